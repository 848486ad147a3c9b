use async_trait::async_trait;
use futures_util::stream::BoxStream;

use opti_types::{GraphqlResponse, Operation};

use crate::error::TransportError;

/// Events of one subscription as delivered by a persistent-stream adapter.
pub type EventStream = BoxStream<'static, Result<GraphqlResponse, TransportError>>;

/// Request/response adapter: one operation in, one response out.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn execute(&self, operation: &Operation) -> Result<GraphqlResponse, TransportError>;
}

/// Persistent-stream adapter: one subscription in, zero or more events out.
///
/// Dropping the returned stream must cancel the subscription and release
/// its connection. Implementations reconnect on drop and end the stream with
/// [`TransportError::ReconnectExhausted`] when they give up.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn subscribe(&self, operation: &Operation) -> Result<EventStream, TransportError>;
}
