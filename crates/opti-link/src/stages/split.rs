use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tracing::debug;

use opti_types::{Operation, OperationKind};

use crate::error::{LinkError, LinkResult};
use crate::link::{Link, Next, ResponseStream};
use crate::transport::{RequestTransport, StreamTransport};

/// Which adapter an operation is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Request,
    Stream,
}

impl Route {
    pub fn for_kind(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Subscription => Self::Stream,
            OperationKind::Query | OperationKind::Mutation => Self::Request,
        }
    }
}

/// Terminal stage: subscriptions go to the persistent-stream adapter,
/// everything else to the request/response adapter.
pub struct TransportSplit {
    request: Arc<dyn RequestTransport>,
    stream: Arc<dyn StreamTransport>,
}

impl TransportSplit {
    pub fn new(request: Arc<dyn RequestTransport>, stream: Arc<dyn StreamTransport>) -> Self {
        Self { request, stream }
    }
}

#[async_trait]
impl Link for TransportSplit {
    fn name(&self) -> &str {
        "split"
    }

    async fn request(&self, operation: Operation, _next: Next<'_>) -> LinkResult<ResponseStream> {
        let route = Route::for_kind(operation.kind());
        debug!(operation = %operation.name(), route = ?route, "routing operation");
        match route {
            Route::Request => {
                let response = self.request.execute(&operation).await?;
                Ok(stream::once(async move { Ok(response) }).boxed())
            }
            Route::Stream => {
                let events = self.stream.subscribe(&operation).await?;
                Ok(events.map(|item| item.map_err(LinkError::from)).boxed())
            }
        }
    }
}
