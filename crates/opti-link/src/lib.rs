//! Link pipeline for Opti.
//!
//! Every operation flows through an ordered chain of [`Link`] stages before
//! reaching a transport, and its responses flow back through the same chain.
//! A stage may rewrite the operation, observe or rewrite responses, or answer
//! without reaching the transport at all.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use opti_link::*;
//! # fn demo(store: Arc<dyn opti_store::NormalizedStore>,
//! #         http: Arc<dyn RequestTransport>, ws: Arc<dyn StreamTransport>) {
//! let observer = ErrorObserver::default();
//! let pipeline = Pipeline::builder()
//!     .with_stage(AuthLink::bearer("auth987"))
//!     .with_stage(RetryLink::new(RetryPolicy::default()))
//!     .with_stage(ErrorLink::new(observer.clone()))
//!     .with_stage(LocalStateLink::new(store, LocalResolverTable::new()))
//!     .with_stage(TransportSplit::new(http, ws))
//!     .build();
//! assert_eq!(pipeline.stage_count(), 5);
//! # }
//! ```
//!
//! # Design Rules
//!
//! 1. The last stage is terminal and never calls `next`.
//! 2. Only transport failures are retried; application errors never are.
//! 3. Observation never alters what passes through it.
//! 4. Routing is decided once per operation from its kind.

pub mod diagnostics;
pub mod error;
pub mod link;
pub mod stages;
pub mod transport;

// Re-exports for convenience.
pub use diagnostics::{Diagnostic, DiagnosticKind, ErrorObserver};
pub use error::{LinkError, LinkResult, TransportError};
pub use link::{Link, Next, Pipeline, PipelineBuilder, ResponseStream};
pub use stages::auth::AuthLink;
pub use stages::local::{LocalResolver, LocalResolverTable, LocalStateLink};
pub use stages::observe::ErrorLink;
pub use stages::retry::{Backoff, RetryDecision, RetryLink, RetryPolicy};
pub use stages::split::{Route, TransportSplit};
pub use transport::{EventStream, RequestTransport, StreamTransport};
