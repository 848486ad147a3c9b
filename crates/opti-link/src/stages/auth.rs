use async_trait::async_trait;

use opti_types::Operation;

use crate::error::LinkResult;
use crate::link::{Link, Next, ResponseStream};

pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Attaches a fixed bearer token to every outgoing operation.
///
/// The token is supplied once at construction; there is no refresh flow.
pub struct AuthLink {
    value: String,
}

impl AuthLink {
    pub fn bearer(token: impl AsRef<str>) -> Self {
        Self {
            value: format!("Bearer {}", token.as_ref()),
        }
    }
}

impl std::fmt::Debug for AuthLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthLink").field("value", &"Bearer ***").finish()
    }
}

#[async_trait]
impl Link for AuthLink {
    fn name(&self) -> &str {
        "auth"
    }

    async fn request(&self, operation: Operation, next: Next<'_>) -> LinkResult<ResponseStream> {
        next.run(operation.with_header(AUTHORIZATION_HEADER, self.value.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures_util::{stream, StreamExt};
    use opti_types::{Document, GraphqlResponse, Variables};
    use serde_json::json;

    use crate::link::Pipeline;

    struct HeaderEcho;

    #[async_trait]
    impl Link for HeaderEcho {
        fn name(&self) -> &str {
            "echo"
        }

        async fn request(&self, operation: Operation, _next: Next<'_>) -> LinkResult<ResponseStream> {
            let auth = operation.context().header("Authorization").map(str::to_string);
            Ok(stream::once(async move { Ok(GraphqlResponse::data(json!({ "auth": auth }))) }).boxed())
        }
    }

    #[tokio::test]
    async fn attaches_bearer_header() {
        let pipeline = Pipeline::builder()
            .with_stage(AuthLink::bearer("auth987"))
            .with_stage(HeaderEcho)
            .build();
        let op = Operation::new(Arc::new(Document::parse("{ a }").unwrap()), Variables::new());
        let response = pipeline.execute(op).await.unwrap();
        assert_eq!(response.data.unwrap()["auth"], json!("Bearer auth987"));
    }

    #[test]
    fn debug_hides_token() {
        let rendered = format!("{:?}", AuthLink::bearer("secret"));
        assert!(!rendered.contains("secret"));
    }
}
