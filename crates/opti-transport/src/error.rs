/// Errors raised while constructing an adapter.
///
/// Failures of an individual request or subscription are reported as
/// [`TransportError`](opti_link::TransportError) instead.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid header `{0}`")]
    InvalidHeader(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Result alias for adapter construction.
pub type AdapterResult<T> = Result<T, AdapterError>;
