//! Built-in pipeline stages, in their usual order.

pub mod auth;
pub mod local;
pub mod observe;
pub mod retry;
pub mod split;

pub use auth::AuthLink;
pub use local::{LocalResolver, LocalResolverTable, LocalStateLink};
pub use observe::ErrorLink;
pub use retry::{Backoff, RetryDecision, RetryLink, RetryPolicy};
pub use split::{Route, TransportSplit};
