//! Client context for Opti.
//!
//! A [`Client`] owns one link pipeline, one normalized cache and one strategy
//! table. It is constructed explicitly from a [`ClientConfig`] and passed to
//! whatever issues operations; [`Client::shutdown`] ends its live merges.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! # use opti_client::*;
//! # async fn demo() -> ClientResult<()> {
//! let config = ClientConfig::from_toml_str(r#"
//!     http_endpoint = "http://localhost:4000/graphql"
//!     ws_endpoint = "ws://localhost:4000/graphql"
//!     bearer_token = "auth987"
//! "#)?;
//! let client = Client::from_config(config)?;
//!
//! let list = client
//!     .run_query("query ListTodos { listTodos { id name } }", Default::default(), FetchPolicy::NetworkOnly)
//!     .await?;
//! println!("{}", list.data);
//!
//! let mut notes = client
//!     .subscribe("subscription TodoAdded { todoAdded { id name } }", Default::default(), LiveTarget::notify_only())
//!     .await?;
//! while let Some(LiveEvent::Data(event)) = notes.next().await {
//!     println!("{event}");
//! }
//! notes.detach().await;
//! client.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! # Key Types
//!
//! - [`Client`] / [`ClientBuilder`] -- The context object and its wiring
//! - [`ClientConfig`] -- Endpoints, credential, retry, redirects, strategies, local state
//! - [`StrategyTable`] -- Update, optimistic and merge strategies by operation name
//! - [`QueryWatch`] / [`QueryState`] -- `Pending | Ok | Err` delivered on every cache change
//! - [`LiveHandle`] / [`LiveEvent`] -- An attached subscription and its events
//!
//! # Design Rules
//!
//! 1. Optimistic layers are applied before the network call is dispatched.
//! 2. Every applied layer ends settled or rolled back, including when the caller gives up.
//! 3. Live-merge events of one subscription are merged in delivery order.
//! 4. Detaching releases the transport stream before returning; reattaching detaches first.

pub mod client;
pub mod config;
pub mod error;
pub mod live;
pub mod result;
pub mod strategy;
pub mod watch;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, LocalConfig, RetryConfig};
pub use error::{ClientError, ClientResult};
pub use live::{merge_update, LiveEvent, LiveHandle, LiveTarget};
pub use result::{FetchPolicy, MutationResult, MutationState, QueryResult, QueryState, ResultSource};
pub use strategy::{OperationStrategies, StrategyTable};
pub use watch::QueryWatch;
