//! Structured diagnostics recorded by the error-observation stage.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

use opti_types::{ErrorLocation, GraphqlError, GraphqlResponse, PathSegment};

use crate::error::LinkError;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Connection, timeout or protocol failure.
    Transport,
    /// Structured error returned by the server.
    Application,
    /// A local-only field could not be resolved.
    LocalResolver,
    /// A confirmed write overwrote a concurrent write to the same entity.
    ReconciliationConflict,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "network",
            Self::Application => "graphql",
            Self::LocalResolver => "local",
            Self::ReconciliationConflict => "conflict",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Name of the operation that produced it.
    pub operation: String,
    pub message: String,
    pub locations: Vec<ErrorLocation>,
    pub path: Vec<PathSegment>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
            locations: Vec::new(),
            path: Vec::new(),
        }
    }

    fn from_graphql(operation: &str, e: &GraphqlError) -> Self {
        Self {
            kind: DiagnosticKind::Application,
            operation: operation.to_string(),
            message: e.message.clone(),
            locations: e.locations.clone(),
            path: e.path.clone(),
        }
    }
}

/// Shared sink for diagnostics: a bounded history plus a live broadcast.
///
/// Clones share the same history.
#[derive(Clone)]
pub struct ErrorObserver {
    history: Arc<Mutex<VecDeque<Diagnostic>>>,
    capacity: usize,
    sender: broadcast::Sender<Diagnostic>,
}

impl ErrorObserver {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            history: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            sender,
        }
    }

    /// Record a diagnostic, evicting the oldest once the history is full.
    pub fn record(&self, diagnostic: Diagnostic) {
        {
            let mut history = self.history.lock().expect("lock poisoned");
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(diagnostic.clone());
        }
        // No receivers is fine.
        let _ = self.sender.send(diagnostic);
    }

    /// Record every error carried by a response. The response is not altered.
    pub fn observe_response(&self, operation: &str, response: &GraphqlResponse) {
        for e in &response.errors {
            warn!(
                operation = %operation,
                message = %e.message,
                locations = %e.locations_string(),
                path = %e.path_string(),
                "[GraphQL error]"
            );
            self.record(Diagnostic::from_graphql(operation, e));
        }
    }

    pub fn observe_error(&self, operation: &str, err: &LinkError) {
        match err {
            LinkError::Transport(e) => {
                error!(operation = %operation, error = %e, "[Network error]");
                self.record(Diagnostic::new(DiagnosticKind::Transport, operation, e.to_string()));
            }
            LinkError::Application { errors, .. } => {
                for e in errors {
                    warn!(operation = %operation, message = %e.message, "[GraphQL error]");
                    self.record(Diagnostic::from_graphql(operation, e));
                }
            }
            LinkError::LocalResolver(message) => {
                warn!(operation = %operation, message = %message, "[Local error]");
                self.record(Diagnostic::new(DiagnosticKind::LocalResolver, operation, message.clone()));
            }
            LinkError::Pipeline(message) => {
                error!(operation = %operation, message = %message, "[Pipeline error]");
                self.record(Diagnostic::new(DiagnosticKind::Transport, operation, message.clone()));
            }
        }
    }

    /// Diagnostics recorded so far, oldest first.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.history.lock().expect("lock poisoned").iter().cloned().collect()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.history
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|d| d.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.history.lock().expect("lock poisoned").clear();
    }

    /// Receive diagnostics as they are recorded.
    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.sender.subscribe()
    }
}

impl Default for ErrorObserver {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for ErrorObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorObserver")
            .field("capacity", &self.capacity)
            .field("recorded", &self.history.lock().expect("lock poisoned").len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn history_is_bounded() {
        let observer = ErrorObserver::new(2);
        for i in 0..3 {
            observer.record(Diagnostic::new(DiagnosticKind::Transport, "Op", format!("e{i}")));
        }
        let messages: Vec<String> = observer.diagnostics().into_iter().map(|d| d.message).collect();
        assert_eq!(messages, vec!["e1", "e2"]);
    }

    #[test]
    fn distinguishes_transport_from_application() {
        let observer = ErrorObserver::default();
        observer.observe_error("ListTodos", &LinkError::Transport(TransportError::Timeout));
        let mut err = GraphqlError::new("boom").with_path(vec![PathSegment::Key("listTodos".into())]);
        err.locations.push(ErrorLocation { line: 1, column: 3 });
        observer.observe_response("ListTodos", &GraphqlResponse::errors(vec![err]));

        assert_eq!(observer.count(DiagnosticKind::Transport), 1);
        assert_eq!(observer.count(DiagnosticKind::Application), 1);
        let app = &observer.diagnostics()[1];
        assert_eq!(app.path, vec![PathSegment::Key("listTodos".into())]);
        assert_eq!(app.locations, vec![ErrorLocation { line: 1, column: 3 }]);
    }

    #[tokio::test]
    async fn subscribers_receive_live_diagnostics() {
        let observer = ErrorObserver::default();
        let mut rx = observer.subscribe();
        observer.observe_error("AddTodo", &LinkError::LocalResolver("missing".into()));
        let d = rx.recv().await.unwrap();
        assert_eq!(d.kind, DiagnosticKind::LocalResolver);
        assert_eq!(d.operation, "AddTodo");
    }
}
