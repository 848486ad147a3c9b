use opti_types::GraphqlError;
use serde_json::Value;

/// Failures below the pipeline: connecting, sending, or reading a response.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("invalid JSON: {0}")]
    Json(String),
}

impl TransportError {
    /// Whether resubmitting the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout | Self::Closed(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            Self::Protocol(_) | Self::ReconnectExhausted { .. } | Self::Json(_) => false,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// Errors surfaced by the link pipeline.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum LinkError {
    /// The transport failed; retried by the retry stage while retryable.
    #[error("network error: {0}")]
    Transport(#[from] TransportError),

    /// The server answered with structured errors, possibly with partial data.
    #[error("{} GraphQL error(s): {}", errors.len(), errors.first().map(|e| e.message.as_str()).unwrap_or(""))]
    Application {
        errors: Vec<GraphqlError>,
        data: Option<Value>,
    },

    /// A local-only field could not be resolved.
    #[error("local resolver error: {0}")]
    LocalResolver(String),

    /// The pipeline itself is misconfigured.
    #[error("pipeline error: {0}")]
    Pipeline(String),
}

impl LinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_retryable())
    }
}

/// Result alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Connect("refused".into()).is_retryable());
        assert!(TransportError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(TransportError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!TransportError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!TransportError::ReconnectExhausted { attempts: 3 }.is_retryable());
        assert!(!LinkError::Application { errors: Vec::new(), data: None }.is_retryable());
        assert!(!LinkError::LocalResolver("x".into()).is_retryable());
    }
}
