//! Transport adapters for Opti.
//!
//! # Adapters
//!
//! - [`HttpTransport`] -- request/response over HTTP POST (`reqwest`)
//! - [`WsTransport`] -- persistent subscriptions over `graphql-transport-ws`
//!   (`tokio-tungstenite`), reconnecting on drop
//! - [`ScriptedTransport`] / [`PushChannel`] -- in-process adapters for tests
//!   and offline use
//!
//! Adapters report per-request failures as [`opti_link::TransportError`];
//! [`AdapterError`] only covers construction.

pub mod error;
pub mod http;
pub mod protocol;
pub mod scripted;
pub mod ws;

pub use error::{AdapterError, AdapterResult};
pub use http::{HttpTransport, HttpTransportBuilder};
pub use protocol::{ProtocolMessage, SUBPROTOCOL};
pub use scripted::{PushChannel, ScriptedTransport};
pub use ws::{WsTransport, WsTransportBuilder};
