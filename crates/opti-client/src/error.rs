use serde_json::Value;

use opti_link::LinkError;
use opti_store::CacheError;
use opti_transport::AdapterError;
use opti_types::{DocumentError, GraphqlError, OperationKind};

/// Errors returned to callers of the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Transport failure after retries, local resolver failure, or a
    /// misconfigured pipeline.
    #[error(transparent)]
    Link(LinkError),

    /// The server returned structured errors, possibly with partial data.
    #[error("{} GraphQL error(s): {}", errors.len(), errors.first().map(|e| e.message.as_str()).unwrap_or(""))]
    Application {
        errors: Vec<GraphqlError>,
        data: Option<Value>,
    },

    #[error("expected a {expected} operation, found a {found}")]
    WrongOperationKind {
        expected: OperationKind,
        found: OperationKind,
    },

    /// A cache-only read found nothing.
    #[error("`{0}` is not cached")]
    CacheMiss(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("client has been shut down")]
    Shutdown,
}

impl ClientError {
    /// Whether the failure happened below the application layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Link(LinkError::Transport(_)))
    }

    /// Partial data returned alongside application errors.
    pub fn partial_data(&self) -> Option<&Value> {
        match self {
            Self::Application { data, .. } => data.as_ref(),
            _ => None,
        }
    }
}

impl From<LinkError> for ClientError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Application { errors, data } => Self::Application { errors, data },
            other => Self::Link(other),
        }
    }
}

impl From<toml::de::Error> for ClientError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
