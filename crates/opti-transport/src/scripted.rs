//! In-process adapters driven by a script instead of a server.
//!
//! Used to exercise clients without a network: queue responses or failures
//! per operation name, hold a response until released, and push
//! subscription events by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use opti_link::{EventStream, RequestTransport, StreamTransport, TransportError};
use opti_types::{GraphqlResponse, Operation};

enum Step {
    Respond(GraphqlResponse),
    Fail(TransportError),
    Hold(GraphqlResponse, Arc<Notify>),
}

/// Request/response adapter answering from per-operation queues.
///
/// A queue's last step repeats once everything before it is consumed, so a
/// single `fail` keeps failing every retry.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<HashMap<String, VecDeque<Arc<Step>>>>,
    calls: Mutex<Vec<Operation>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, operation: &str, step: Step) {
        self.script
            .lock()
            .expect("lock poisoned")
            .entry(operation.to_string())
            .or_default()
            .push_back(Arc::new(step));
    }

    pub fn respond(&self, operation: &str, response: GraphqlResponse) -> &Self {
        self.push(operation, Step::Respond(response));
        self
    }

    pub fn fail(&self, operation: &str, error: TransportError) -> &Self {
        self.push(operation, Step::Fail(error));
        self
    }

    /// Queue a response that is only delivered after the returned handle's
    /// `notify_one` is called.
    pub fn hold(&self, operation: &str, response: GraphqlResponse) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        self.push(operation, Step::Hold(response, release.clone()));
        release
    }

    /// Every operation executed so far, in order.
    pub fn calls(&self) -> Vec<Operation> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|op| op.name() == operation)
            .count()
    }

    fn next_step(&self, operation: &str) -> Option<Arc<Step>> {
        let mut script = self.script.lock().expect("lock poisoned");
        let queue = script.get_mut(operation)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl RequestTransport for ScriptedTransport {
    async fn execute(&self, operation: &Operation) -> Result<GraphqlResponse, TransportError> {
        self.calls.lock().expect("lock poisoned").push(operation.clone());
        let step = self.next_step(operation.name()).ok_or_else(|| {
            TransportError::Connect(format!("no scripted response for `{}`", operation.name()))
        })?;
        match step.as_ref() {
            Step::Respond(response) => Ok(response.clone()),
            Step::Fail(error) => Err(error.clone()),
            Step::Hold(response, release) => {
                release.notified().await;
                Ok(response.clone())
            }
        }
    }
}

type Subscriber = mpsc::UnboundedSender<Result<GraphqlResponse, TransportError>>;

/// Persistent-stream adapter whose events are pushed by the test.
#[derive(Clone, Default)]
pub struct PushChannel {
    subscribers: Arc<Mutex<Vec<(String, Subscriber)>>>,
    opened: Arc<Mutex<Vec<Operation>>>,
}

impl PushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every open subscription named `operation`.
    /// Returns how many received it.
    pub fn push(&self, operation: &str, event: GraphqlResponse) -> usize {
        self.send(operation, Ok(event))
    }

    /// End every open subscription named `operation` with a terminal error.
    pub fn fail(&self, operation: &str, error: TransportError) -> usize {
        let delivered = self.send(operation, Err(error));
        self.close(operation);
        delivered
    }

    /// End every open subscription named `operation`.
    pub fn close(&self, operation: &str) {
        self.subscribers
            .lock()
            .expect("lock poisoned")
            .retain(|(name, _)| name != operation);
    }

    /// Subscriptions named `operation` whose receiving side is still alive.
    pub fn active(&self, operation: &str) -> usize {
        let mut subscribers = self.subscribers.lock().expect("lock poisoned");
        subscribers.retain(|(_, tx)| !tx.is_closed());
        subscribers.iter().filter(|(name, _)| name == operation).count()
    }

    /// Number of subscriptions ever opened.
    pub fn opened(&self) -> usize {
        self.opened.lock().expect("lock poisoned").len()
    }

    fn send(&self, operation: &str, item: Result<GraphqlResponse, TransportError>) -> usize {
        let mut subscribers = self.subscribers.lock().expect("lock poisoned");
        subscribers.retain(|(_, tx)| !tx.is_closed());
        subscribers
            .iter()
            .filter(|(name, _)| name == operation)
            .filter(|(_, tx)| tx.send(item.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl StreamTransport for PushChannel {
    async fn subscribe(&self, operation: &Operation) -> Result<EventStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(operation = %operation.name(), "scripted subscription opened");
        self.opened.lock().expect("lock poisoned").push(operation.clone());
        self.subscribers
            .lock()
            .expect("lock poisoned")
            .push((operation.name().to_string(), tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
