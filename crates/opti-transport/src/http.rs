//! Request/response adapter over HTTP POST.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use opti_link::{RequestTransport, TransportError};
use opti_types::{GraphqlResponse, Operation};

use crate::error::{AdapterError, AdapterResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY: usize = 4096;

/// Builds an [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportBuilder {
    endpoint: String,
    timeout: Duration,
    headers: Vec<(String, String)>,
}

impl HttpTransportBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            headers: Vec::new(),
        }
    }

    /// Per-request timeout, covering connect and body.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Header sent with every request. Operation headers take precedence.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn build(self) -> AdapterResult<HttpTransport> {
        reqwest::Url::parse(&self.endpoint).map_err(|e| AdapterError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        })?;

        let mut defaults = HeaderMap::new();
        for (name, value) in &self.headers {
            let (name, value) = header_pair(name, value)?;
            defaults.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(defaults)
            .timeout(self.timeout)
            .build()?;

        Ok(HttpTransport {
            endpoint: self.endpoint,
            client,
        })
    }
}

/// POSTs `{ query, variables, operationName }` to a single endpoint.
///
/// Operation headers (e.g. `authorization` from the auth stage) become
/// request headers. A non-2xx reply that still carries GraphQL errors is a
/// response, not a transport failure, unless the status is 5xx.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn builder(endpoint: impl Into<String>) -> HttpTransportBuilder {
        HttpTransportBuilder::new(endpoint)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RequestTransport for HttpTransport {
    async fn execute(&self, operation: &Operation) -> Result<GraphqlResponse, TransportError> {
        let mut request = self.client.post(&self.endpoint).json(&operation.request_body());
        for (name, value) in operation.context().headers() {
            let (name, value) =
                header_pair(name, value).map_err(|e| TransportError::Protocol(e.to_string()))?;
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(map_reqwest)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_reqwest)?;
        debug!(
            operation = %operation.name(),
            status = status.as_u16(),
            bytes = body.len(),
            "HTTP response"
        );

        if status.is_success() {
            return Ok(serde_json::from_slice(&body)?);
        }
        if !status.is_server_error() {
            if let Ok(parsed) = serde_json::from_slice::<GraphqlResponse>(&body) {
                if parsed.has_errors() {
                    return Ok(parsed);
                }
            }
        }
        Err(TransportError::Status {
            status: status.as_u16(),
            body: truncate_body(&body),
        })
    }
}

fn header_pair(name: &str, value: &str) -> AdapterResult<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| AdapterError::InvalidHeader(name.to_string()))?;
    let header_value =
        HeaderValue::from_str(value).map_err(|_| AdapterError::InvalidHeader(name.to_string()))?;
    Ok((header_name, header_value))
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_decode() {
        TransportError::Json(e.to_string())
    } else {
        TransportError::Closed(e.to_string())
    }
}

fn truncate_body(bytes: &[u8]) -> String {
    let mut body = String::from_utf8_lossy(bytes).into_owned();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push('…');
    }
    body
}
