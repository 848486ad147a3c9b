//! Live-Merge Engine: subscription events merged into cached queries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use opti_link::ResponseStream;
use opti_store::{CacheUpdate, NormalizedStore, UpdateAction};
use opti_types::{Document, ListPosition, MergeStrategy, QueryRef, Variables};

use crate::error::ClientError;

/// Where a subscription's events go.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiveTarget {
    pub(crate) query: Option<QueryRef>,
    pub(crate) merge: Option<MergeStrategy>,
}

impl LiveTarget {
    /// Merge into a cached query. The merge strategy comes from
    /// [`with_merge`](Self::with_merge) or the strategy table.
    pub fn query(query: impl Into<String>, variables: Variables) -> Self {
        Self {
            query: Some(QueryRef {
                query: query.into(),
                variables,
            }),
            merge: None,
        }
    }

    /// Deliver events without merging them into any query.
    pub fn notify_only() -> Self {
        Self {
            query: None,
            merge: Some(MergeStrategy::NotifyOnly),
        }
    }

    pub fn with_merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = Some(merge);
        self
    }
}

/// Build the cache update a merge strategy performs on `target`.
/// `None` for [`MergeStrategy::NotifyOnly`].
pub fn merge_update(merge: &MergeStrategy, target: Arc<Document>, variables: Variables) -> Option<CacheUpdate> {
    let action = match merge {
        MergeStrategy::AppendToList { .. } => UpdateAction::Insert(ListPosition::End),
        MergeStrategy::PrependToList { .. } => UpdateAction::Insert(ListPosition::Start),
        MergeStrategy::ReplaceField { .. } => UpdateAction::Replace,
        MergeStrategy::NotifyOnly => return None,
    };
    Some(CacheUpdate {
        target,
        variables,
        path: merge.path().to_vec(),
        action,
        source_field: merge.event_field().map(str::to_string),
    })
}

/// One delivered subscription event.
#[derive(Debug)]
pub enum LiveEvent {
    /// Event data, already merged when the target asked for it.
    Data(Value),
    /// The event carried errors, could not be merged, or the stream failed.
    Error(ClientError),
}

impl LiveEvent {
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Data(data) => Some(data),
            Self::Error(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Running live merges of one client, so shutdown can stop them all.
#[derive(Default)]
pub(crate) struct LiveRegistry {
    tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl LiveRegistry {
    fn remove(&self, id: u64) {
        self.tasks.lock().expect("lock poisoned").remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().expect("lock poisoned").len()
    }

    /// Abort every running merge. Returns how many were running.
    pub(crate) fn abort_all(&self) -> usize {
        let mut tasks = self.tasks.lock().expect("lock poisoned");
        let count = tasks.len();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        count
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// An attached subscription.
///
/// Dropping the handle stops merging; [`detach`](Self::detach) additionally
/// waits until the transport stream has been released.
pub struct LiveHandle {
    id: u64,
    operation: String,
    events: mpsc::UnboundedReceiver<LiveEvent>,
    task: Option<JoinHandle<()>>,
    registry: Arc<LiveRegistry>,
}

impl LiveHandle {
    pub(crate) fn spawn(
        id: u64,
        operation: String,
        stream: ResponseStream,
        merge: LiveMerge,
        registry: Arc<LiveRegistry>,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let task = {
            let mut tasks = registry.tasks.lock().expect("lock poisoned");
            let task = tokio::spawn(run(id, operation.clone(), stream, merge, tx, registry.clone()));
            tasks.insert(id, task.abort_handle());
            task
        };
        info!(operation = %operation, live = id, "live merge attached");
        Self {
            id,
            operation,
            events,
            task: Some(task),
            registry,
        }
    }

    /// Next event, or `None` once the stream has ended or been detached.
    pub async fn next(&mut self) -> Option<LiveEvent> {
        self.events.recv().await
    }

    /// Stop merging and release the transport stream. Idempotent.
    pub async fn detach(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        // Cancellation is the expected outcome.
        let _ = task.await;
        self.registry.remove(self.id);
        self.events.close();
        info!(operation = %self.operation, live = self.id, "live merge detached");
    }

    /// Whether events are still being merged.
    pub fn is_attached(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Name of the subscription operation.
    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHandle")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("attached", &self.is_attached())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// What a running merge writes with.
pub(crate) struct LiveMerge {
    pub store: Arc<dyn NormalizedStore>,
    pub document: Arc<Document>,
    pub variables: Variables,
    pub updates: Vec<CacheUpdate>,
}

async fn run(
    id: u64,
    operation: String,
    mut stream: ResponseStream,
    merge: LiveMerge,
    tx: mpsc::UnboundedSender<LiveEvent>,
    registry: Arc<LiveRegistry>,
) {
    let mut merged = 0_u64;
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(response) if response.has_errors() => LiveEvent::Error(ClientError::Application {
                errors: response.errors,
                data: response.data,
            }),
            Ok(response) => {
                let data = response.data.unwrap_or(Value::Null);
                match merge
                    .store
                    .write_with_updates(&merge.document, &merge.variables, &data, &merge.updates)
                {
                    Ok(()) => {
                        merged += 1;
                        LiveEvent::Data(data)
                    }
                    Err(e) => {
                        warn!(operation = %operation, error = %e, "live merge failed");
                        LiveEvent::Error(e.into())
                    }
                }
            }
            Err(e) => LiveEvent::Error(e.into()),
        };
        if tx.send(event).is_err() {
            break;
        }
    }
    debug!(operation = %operation, live = id, merged, "live stream ended");
    registry.remove(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Arc<Document> {
        Arc::new(Document::parse("query GetTodo($id: ID) { getTodo(id: $id) { id notes } }").unwrap())
    }

    #[test]
    fn merge_strategies_map_to_updates() {
        let append = MergeStrategy::AppendToList {
            path: vec!["getTodo".into(), "notes".into()],
            event_field: Some("noteAdded".into()),
        };
        let update = merge_update(&append, doc(), Variables::new()).unwrap();
        assert_eq!(update.action, UpdateAction::Insert(ListPosition::End));
        assert_eq!(update.path, vec!["getTodo", "notes"]);
        assert_eq!(update.source_field.as_deref(), Some("noteAdded"));

        let prepend = MergeStrategy::PrependToList {
            path: vec!["getTodo".into(), "notes".into()],
            event_field: None,
        };
        let update = merge_update(&prepend, doc(), Variables::new()).unwrap();
        assert_eq!(update.action, UpdateAction::Insert(ListPosition::Start));
        assert!(update.source_field.is_none());

        let replace = MergeStrategy::ReplaceField {
            path: vec!["getTodo".into()],
            event_field: None,
        };
        assert_eq!(
            merge_update(&replace, doc(), Variables::new()).unwrap().action,
            UpdateAction::Replace
        );
        assert!(merge_update(&MergeStrategy::NotifyOnly, doc(), Variables::new()).is_none());
    }

    #[test]
    fn targets() {
        let t = LiveTarget::notify_only();
        assert!(t.query.is_none());
        assert_eq!(t.merge, Some(MergeStrategy::NotifyOnly));
        let t = LiveTarget::query("query ListTodos { listTodos { id } }", Variables::new());
        assert!(t.query.is_some() && t.merge.is_none());
    }
}
