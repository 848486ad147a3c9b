//! Watched queries: a query's result re-delivered whenever the cache changes.

use std::sync::Arc;

use futures_util::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use opti_store::ReadOutcome;
use opti_types::{Document, Variables};

use crate::client::Client;
use crate::result::{FetchPolicy, QueryState};

enum Phase {
    Initial,
    Fetching,
    Watching,
    Done,
}

/// Cancellable stream of [`QueryState`]s for one query.
///
/// Yields `Pending`, then the first result (or error), then the query's data
/// again every time a cache change alters it. Identical consecutive results
/// are not repeated. Ends when the client shuts down; dropping it stops
/// watching.
pub struct QueryWatch {
    client: Client,
    document: Arc<Document>,
    variables: Variables,
    policy: FetchPolicy,
    changes: watch::Receiver<u64>,
    shutdown: watch::Receiver<bool>,
    phase: Phase,
    last: Option<Value>,
}

impl QueryWatch {
    pub(crate) fn new(
        client: Client,
        document: Arc<Document>,
        variables: Variables,
        policy: FetchPolicy,
        changes: watch::Receiver<u64>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        // A watch that never writes would never see its own result.
        let policy = match policy {
            FetchPolicy::NoCache => FetchPolicy::NetworkOnly,
            other => other,
        };
        Self {
            client,
            document,
            variables,
            policy,
            changes,
            shutdown,
            phase: Phase::Initial,
            last: None,
        }
    }

    pub async fn next(&mut self) -> Option<QueryState> {
        loop {
            match self.phase {
                Phase::Initial => {
                    self.phase = Phase::Fetching;
                    return Some(QueryState::Pending);
                }
                Phase::Fetching => {
                    self.phase = Phase::Watching;
                    self.changes.borrow_and_update();
                    let fetched = self
                        .client
                        .fetch(self.document.clone(), self.variables.clone(), self.policy)
                        .await;
                    return Some(match fetched {
                        Ok(result) => {
                            self.last = Some(result.data.clone());
                            QueryState::Ok(result.data)
                        }
                        Err(e) => QueryState::Err(e),
                    });
                }
                Phase::Watching => {
                    let stopped = tokio::select! {
                        changed = self.changes.changed() => changed.is_err(),
                        _ = closed(&mut self.shutdown) => true,
                    };
                    if stopped {
                        debug!(query = %self.document.id(), "watch ended");
                        self.phase = Phase::Done;
                        continue;
                    }
                    match self.client.store().materialize(&self.document, &self.variables) {
                        Ok(ReadOutcome::Complete(data)) if self.last.as_ref() != Some(&data) => {
                            self.last = Some(data.clone());
                            return Some(QueryState::Ok(data));
                        }
                        Ok(_) => continue,
                        Err(e) => return Some(QueryState::Err(e.into())),
                    }
                }
                Phase::Done => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = QueryState> + Send {
        stream::unfold(self, |mut watch| async move {
            let state = watch.next().await?;
            Some((state, watch))
        })
    }
}

async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}
