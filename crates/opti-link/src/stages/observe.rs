use async_trait::async_trait;
use futures_util::StreamExt;

use opti_types::Operation;

use crate::diagnostics::ErrorObserver;
use crate::error::LinkResult;
use crate::link::{Link, Next, ResponseStream};

/// Records diagnostics for every failure passing back through the pipeline.
///
/// Responses and errors are forwarded unchanged, partial data included.
pub struct ErrorLink {
    observer: ErrorObserver,
}

impl ErrorLink {
    pub fn new(observer: ErrorObserver) -> Self {
        Self { observer }
    }

    pub fn observer(&self) -> &ErrorObserver {
        &self.observer
    }
}

#[async_trait]
impl Link for ErrorLink {
    fn name(&self) -> &str {
        "error"
    }

    async fn request(&self, operation: Operation, next: Next<'_>) -> LinkResult<ResponseStream> {
        let name = operation.name().to_string();
        let responses = match next.run(operation).await {
            Ok(responses) => responses,
            Err(e) => {
                self.observer.observe_error(&name, &e);
                return Err(e);
            }
        };

        let observer = self.observer.clone();
        Ok(responses
            .inspect(move |item| match item {
                Ok(response) => observer.observe_response(&name, response),
                Err(e) => observer.observe_error(&name, e),
            })
            .boxed())
    }
}
