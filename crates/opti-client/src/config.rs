use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use opti_link::{Backoff, LocalResolverTable, RetryPolicy};
use opti_store::RedirectRule;

use crate::error::{ClientError, ClientResult};
use crate::result::FetchPolicy;
use crate::strategy::StrategyTable;

/// Retry or reconnect schedule.
///
/// `max_attempts` counts the first attempt. In TOML it is a number or the
/// string `"unbounded"`; unbounded retry keeps a failing mutation pending
/// forever and is rarely wanted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "attempts")]
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            backoff: Backoff::Exponential,
            initial_delay_ms: 300,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::default()
        }
    }

    fn reconnect_default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_delay_ms: 1_000,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }

    fn validate(&self, name: &str) -> ClientResult<()> {
        if self.max_attempts == Some(0) {
            return Err(ClientError::Config(format!("{name}.max_attempts must be at least 1")));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ClientError::Config(format!(
                "{name}.initial_delay_ms exceeds {name}.max_delay_ms"
            )));
        }
        Ok(())
    }
}

/// Client-only state: initial values and named local mutations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub defaults: Map<String, Value>,
    pub resolvers: LocalResolverTable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub http_endpoint: String,
    pub ws_endpoint: String,
    /// Sent as `authorization: Bearer <token>` on every request.
    pub bearer_token: Option<String>,
    /// Payload of the push channel's `connection_init`.
    pub connection_params: Option<Value>,
    pub request_timeout_ms: u64,
    pub default_fetch_policy: FetchPolicy,
    /// Diagnostics kept by the error observer.
    pub diagnostics_capacity: usize,
    pub retry: RetryConfig,
    /// Schedule for re-establishing dropped subscription sockets.
    pub reconnect: RetryConfig,
    pub redirects: Vec<RedirectRule>,
    pub strategies: StrategyTable,
    pub local: LocalConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http_endpoint: "http://localhost:4000/graphql".into(),
            ws_endpoint: "ws://localhost:4000/graphql".into(),
            bearer_token: None,
            connection_params: None,
            request_timeout_ms: 30_000,
            default_fetch_policy: FetchPolicy::CacheFirst,
            diagnostics_capacity: 256,
            retry: RetryConfig::default(),
            reconnect: RetryConfig::reconnect_default(),
            redirects: Vec::new(),
            strategies: StrategyTable::new(),
            local: LocalConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> ClientResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.http_endpoint.trim().is_empty() {
            return Err(ClientError::Config("http_endpoint is empty".into()));
        }
        if self.ws_endpoint.trim().is_empty() {
            return Err(ClientError::Config("ws_endpoint is empty".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ClientError::Config("request_timeout_ms must be positive".into()));
        }
        if self.diagnostics_capacity == 0 {
            return Err(ClientError::Config("diagnostics_capacity must be positive".into()));
        }
        if self.connection_params.as_ref().is_some_and(|p| !p.is_object()) {
            return Err(ClientError::Config("connection_params must be a table".into()));
        }
        self.retry.validate("retry")?;
        self.reconnect.validate("reconnect")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

mod attempts {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    const UNBOUNDED: &str = "unbounded";

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Count(u32),
        Word(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(n) => Repr::Count(*n),
            None => Repr::Word(UNBOUNDED.into()),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(Some(n)),
            Repr::Word(w) if w == UNBOUNDED => Ok(None),
            Repr::Word(w) => Err(de::Error::custom(format!(
                "expected an attempt count or \"{UNBOUNDED}\", found \"{w}\""
            ))),
        }
    }
}
