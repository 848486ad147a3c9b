use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::debug;

use opti_types::{GraphqlResponse, Operation};

use crate::error::{LinkError, LinkResult, TransportError};

/// Responses flowing back through the pipeline. Queries and mutations yield
/// one item; subscriptions yield until the stream is dropped or ends.
pub type ResponseStream = BoxStream<'static, LinkResult<GraphqlResponse>>;

// ---------------------------------------------------------------------------
// Link trait
// ---------------------------------------------------------------------------

/// A single stage in the link pipeline.
///
/// A stage may rewrite the operation before calling `next`, wrap the
/// returned stream to observe or rewrite responses, or answer without
/// calling `next` at all. Terminal stages never call `next`.
///
/// The trait is object-safe and `Send + Sync` so stages can be stored in a
/// `Vec<Arc<dyn Link>>`.
#[async_trait]
pub trait Link: Send + Sync {
    /// Human-readable name of this stage (e.g. "auth", "retry").
    fn name(&self) -> &str;

    async fn request(&self, operation: Operation, next: Next<'_>) -> LinkResult<ResponseStream>;
}

/// The remainder of the pipeline after the current stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    links: &'a [Arc<dyn Link>],
}

impl<'a> Next<'a> {
    /// Forward `operation` to the next stage. May be called more than once.
    pub async fn run(self, operation: Operation) -> LinkResult<ResponseStream> {
        match self.links.split_first() {
            Some((link, rest)) => link.request(operation, Next { links: rest }).await,
            None => Err(LinkError::Pipeline(
                "pipeline ended without a terminating stage".into(),
            )),
        }
    }

    /// Number of stages left, including the next one.
    pub fn remaining(&self) -> usize {
        self.links.len()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered chain of links every operation flows through.
pub struct Pipeline {
    links: Vec<Arc<dyn Link>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder { links: Vec::new() }
    }

    /// Number of stages in the pipeline.
    pub fn stage_count(&self) -> usize {
        self.links.len()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.name()).collect()
    }

    /// Submit an operation and return its response stream.
    pub async fn submit(&self, operation: Operation) -> LinkResult<ResponseStream> {
        debug!(
            operation = %operation.name(),
            kind = %operation.kind(),
            stages = self.links.len(),
            "submitting operation"
        );
        Next { links: &self.links }.run(operation).await
    }

    /// Submit an operation and wait for its single response.
    ///
    /// A response carrying errors becomes [`LinkError::Application`] with the
    /// partial data attached.
    pub async fn execute(&self, operation: Operation) -> LinkResult<GraphqlResponse> {
        let mut stream = self.submit(operation).await?;
        match stream.next().await {
            Some(Ok(response)) if response.has_errors() => Err(LinkError::Application {
                errors: response.errors,
                data: response.data,
            }),
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Closed("no response".into()).into()),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Builds a [`Pipeline`] in stage order.
pub struct PipelineBuilder {
    links: Vec<Arc<dyn Link>>,
}

impl PipelineBuilder {
    /// Append a stage to the end of the pipeline.
    pub fn with_stage(mut self, link: impl Link + 'static) -> Self {
        self.links.push(Arc::new(link));
        self
    }

    /// Append an already shared stage.
    pub fn with_shared_stage(mut self, link: Arc<dyn Link>) -> Self {
        self.links.push(link);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline { links: self.links }
    }
}
