use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use opti_types::{Operation, OperationKind};

use crate::error::{LinkError, LinkResult};
use crate::link::{Link, Next, ResponseStream};

/// Backoff growth between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `initial_delay * 2^(attempt - 1)`, capped at `max_delay`.
    Exponential,
    /// `initial_delay` every time, capped at `max_delay`.
    Fixed,
}

/// When and how long to wait before resubmitting after a transport failure.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` retries indefinitely.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    pub initial_delay: Duration,
    /// Ceiling for a single delay.
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0, 1)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            backoff: Backoff::Exponential,
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    DoNotRetry,
}

impl RetryPolicy {
    /// Retry indefinitely. Rarely what a production client wants.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::default()
        }
    }

    pub fn never() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::default()
        }
    }

    /// Decide after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, error: &LinkError, attempt: u32) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::DoNotRetry;
        }
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return RetryDecision::DoNotRetry;
        }
        RetryDecision::RetryAfter(self.delay_for(attempt))
    }

    /// Delay before attempt `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential => {
                let exp = 2_u32.saturating_pow(attempt.saturating_sub(1));
                self.initial_delay.saturating_mul(exp)
            }
        };
        let capped = base.min(self.max_delay);
        if self.jitter {
            capped.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
        } else {
            capped
        }
    }
}

/// Resubmits queries and mutations that fail at the transport level.
///
/// Application errors are never retried. Subscriptions pass through; their
/// adapter reconnects on its own. The delay is awaited inside the request
/// future, so dropping that future cancels pending retries.
///
/// A mutation whose response was lost after the server applied it will be
/// applied again on retry. Nothing here deduplicates it.
pub struct RetryLink {
    policy: RetryPolicy,
}

impl RetryLink {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Link for RetryLink {
    fn name(&self) -> &str {
        "retry"
    }

    async fn request(&self, operation: Operation, next: Next<'_>) -> LinkResult<ResponseStream> {
        if operation.kind() == OperationKind::Subscription {
            return next.run(operation).await;
        }

        let mut attempt: u32 = 1;
        loop {
            let error = match next.run(operation.clone()).await {
                Ok(mut responses) => match responses.next().await {
                    Some(Err(e)) => e,
                    Some(Ok(first)) => {
                        return Ok(stream::once(async move { Ok(first) }).chain(responses).boxed())
                    }
                    None => return Ok(stream::empty().boxed()),
                },
                Err(e) => e,
            };

            match self.policy.decide(&error, attempt) {
                RetryDecision::RetryAfter(delay) => {
                    debug!(
                        operation = %operation.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after transport failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                RetryDecision::DoNotRetry => {
                    if error.is_retryable() {
                        warn!(operation = %operation.name(), attempts = attempt, "retries exhausted");
                    }
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use opti_types::{Document, GraphqlResponse, Variables};
    use serde_json::json;

    use crate::error::TransportError;
    use crate::link::Pipeline;

    /// Fails the first `failures` calls, then answers.
    struct Flaky {
        calls: Arc<AtomicU32>,
        failures: u32,
        error: TransportError,
    }

    #[async_trait]
    impl Link for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn request(&self, _operation: Operation, _next: Next<'_>) -> LinkResult<ResponseStream> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(self.error.clone().into());
            }
            Ok(stream::once(async { Ok(GraphqlResponse::data(json!({"ok": true}))) }).boxed())
        }
    }

    fn policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    fn pipeline(policy: RetryPolicy, failures: u32, error: TransportError) -> (Pipeline, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = Pipeline::builder()
            .with_stage(RetryLink::new(policy))
            .with_stage(Flaky {
                calls: calls.clone(),
                failures,
                error,
            })
            .build();
        (pipeline, calls)
    }

    fn op(source: &str) -> Operation {
        Operation::new(Arc::new(Document::parse(source).unwrap()), Variables::new())
    }

    #[test]
    fn exponential_delays_are_capped() {
        let p = policy(None);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_secs(1));
        assert_eq!(p.delay_for(60), Duration::from_secs(1));
    }

    #[test]
    fn fixed_delays_and_jitter_bounds() {
        let mut p = policy(None);
        p.backoff = Backoff::Fixed;
        assert_eq!(p.delay_for(7), Duration::from_millis(100));
        p.jitter = true;
        for attempt in 1..10 {
            assert!(p.delay_for(attempt) < Duration::from_millis(100));
        }
    }

    #[test]
    fn decide_respects_bound_and_error_kind() {
        let p = policy(Some(3));
        let timeout = LinkError::Transport(TransportError::Timeout);
        assert!(matches!(p.decide(&timeout, 1), RetryDecision::RetryAfter(_)));
        assert_eq!(p.decide(&timeout, 3), RetryDecision::DoNotRetry);
        let app = LinkError::Application { errors: Vec::new(), data: None };
        assert_eq!(p.decide(&app, 1), RetryDecision::DoNotRetry);
        assert!(matches!(policy(None).decide(&timeout, 10_000), RetryDecision::RetryAfter(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let (pipeline, calls) = pipeline(policy(Some(5)), 2, TransportError::Timeout);
        let response = pipeline.execute(op("{ ok }")).await.unwrap();
        assert_eq!(response.data, Some(json!({"ok": true})));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_bound() {
        let (pipeline, calls) = pipeline(policy(Some(3)), 10, TransportError::Connect("refused".into()));
        let err = pipeline.execute(op("{ ok }")).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(TransportError::Connect(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_is_not_retried() {
        let (pipeline, calls) = pipeline(policy(None), 10, TransportError::Protocol("bad frame".into()));
        assert!(pipeline.execute(op("{ ok }")).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoning_the_request_cancels_pending_retries() {
        let (pipeline, calls) = pipeline(policy(None), u32::MAX, TransportError::Timeout);
        let pipeline = Arc::new(pipeline);
        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.execute(op("{ ok }")).await })
        };
        // 100 + 200 ms of backoff: three attempts made, fourth pending.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn subscriptions_pass_through() {
        let (pipeline, calls) = pipeline(policy(Some(5)), 1, TransportError::Timeout);
        assert!(pipeline.submit(op("subscription { ticks }")).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
