use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use opti_link::{
    AuthLink, Diagnostic, DiagnosticKind, ErrorLink, ErrorObserver, LocalStateLink, Pipeline,
    RequestTransport, RetryLink, StreamTransport, TransportSplit,
};
use opti_store::{
    CacheError, CacheUpdate, Confirmation, InMemoryCache, LayerId, NormalizedStore,
    OptimisticPatch, ReadOutcome, SettleReport, UpdateAction, WriteMode,
};
use opti_transport::{HttpTransport, WsTransport};
use opti_types::strategy::with_placeholder_ids;
use opti_types::{Document, MergeStrategy, Operation, OperationKind, Variables};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::live::{merge_update, LiveHandle, LiveMerge, LiveRegistry, LiveTarget};
use crate::result::{FetchPolicy, MutationResult, MutationState, QueryResult, ResultSource};
use crate::strategy::StrategyTable;
use crate::watch::QueryWatch;

const PLACEHOLDER_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Wires a [`Client`] from configuration.
///
/// Anything not supplied explicitly is created from the config: an
/// [`InMemoryCache`] with the configured redirects and local defaults, an
/// [`HttpTransport`] and a [`WsTransport`]. A supplied store is used as is.
pub struct ClientBuilder {
    config: ClientConfig,
    store: Option<Arc<dyn NormalizedStore>>,
    request: Option<Arc<dyn RequestTransport>>,
    stream: Option<Arc<dyn StreamTransport>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            store: None,
            request: None,
            stream: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn NormalizedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_request_transport(mut self, transport: Arc<dyn RequestTransport>) -> Self {
        self.request = Some(transport);
        self
    }

    pub fn with_stream_transport(mut self, transport: Arc<dyn StreamTransport>) -> Self {
        self.stream = Some(transport);
        self
    }

    pub fn build(self) -> ClientResult<Client> {
        let config = self.config;
        config.validate()?;

        let store = self.store.unwrap_or_else(|| {
            Arc::new(
                InMemoryCache::new()
                    .with_redirects(config.redirects.clone())
                    .with_local_defaults(config.local.defaults.clone()),
            )
        });
        let request: Arc<dyn RequestTransport> = match self.request {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::builder(config.http_endpoint.as_str())
                    .with_timeout(config.request_timeout())
                    .build()?,
            ),
        };
        let stream: Arc<dyn StreamTransport> = match self.stream {
            Some(transport) => transport,
            None => {
                let mut builder = WsTransport::builder(config.ws_endpoint.as_str())
                    .with_reconnect(config.reconnect.policy());
                if let Some(params) = &config.connection_params {
                    builder = builder.with_connection_params(params.clone());
                }
                Arc::new(builder.build()?)
            }
        };

        if config.retry.max_attempts.is_none() {
            warn!("retry is unbounded; failing operations stay pending until the transport recovers");
        }

        let observer = ErrorObserver::new(config.diagnostics_capacity);
        let mut pipeline = Pipeline::builder();
        if let Some(token) = &config.bearer_token {
            pipeline = pipeline.with_stage(AuthLink::bearer(token));
        }
        let pipeline = pipeline
            .with_stage(RetryLink::new(config.retry.policy()))
            .with_stage(ErrorLink::new(observer.clone()))
            .with_stage(LocalStateLink::new(store.clone(), config.local.resolvers.clone()))
            .with_stage(TransportSplit::new(request, stream))
            .build();

        let (shutdown, _) = watch::channel(false);
        info!(
            http = %config.http_endpoint,
            ws = %config.ws_endpoint,
            stages = ?pipeline.stage_names(),
            strategies = config.strategies.len(),
            "client started"
        );
        Ok(Client {
            inner: Arc::new(ClientInner {
                store,
                pipeline: Arc::new(pipeline),
                observer,
                strategies: config.strategies,
                default_policy: config.default_fetch_policy,
                documents: Mutex::new(HashMap::new()),
                live: Arc::new(LiveRegistry::default()),
                next_live: AtomicU64::new(1),
                shutdown,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct ClientInner {
    store: Arc<dyn NormalizedStore>,
    pipeline: Arc<Pipeline>,
    observer: ErrorObserver,
    strategies: StrategyTable,
    default_policy: FetchPolicy,
    /// Parsed documents keyed by source text.
    documents: Mutex<HashMap<String, Arc<Document>>>,
    live: Arc<LiveRegistry>,
    next_live: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// The client context: one pipeline, one cache, one strategy table.
///
/// Cloning is cheap and every clone shares the same state. Operations fail
/// with [`ClientError::Shutdown`] after [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Build a client with HTTP and WebSocket transports from `config`.
    pub fn from_config(config: ClientConfig) -> ClientResult<Self> {
        ClientBuilder::new(config).build()
    }

    pub fn store(&self) -> &Arc<dyn NormalizedStore> {
        &self.inner.store
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn observer(&self) -> &ErrorObserver {
        &self.inner.observer
    }

    pub fn strategies(&self) -> &StrategyTable {
        &self.inner.strategies
    }

    pub fn default_fetch_policy(&self) -> FetchPolicy {
        self.inner.default_policy
    }

    /// Number of live merges currently running.
    pub fn live_count(&self) -> usize {
        self.inner.live.len()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Stop every live merge and refuse further operations. Watches end.
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let stopped = self.inner.live.abort_all();
        info!(live_merges = stopped, "client shut down");
    }

    // ---- Queries ----

    /// Run a query with the client's default fetch policy.
    pub async fn query(&self, query: &str, variables: Variables) -> ClientResult<QueryResult> {
        self.run_query(query, variables, self.inner.default_policy).await
    }

    pub async fn run_query(
        &self,
        query: &str,
        variables: Variables,
        policy: FetchPolicy,
    ) -> ClientResult<QueryResult> {
        self.ensure_open()?;
        let document = self.document(query)?;
        expect_kind(&document, OperationKind::Query)?;
        self.fetch(document, variables, policy).await
    }

    /// Read a query from the cache without touching the network.
    pub fn read_query(&self, query: &str, variables: &Variables) -> ClientResult<Option<Value>> {
        let document = self.document(query)?;
        let variables = document.effective_variables(variables);
        Ok(self.inner.store.materialize(&document, &variables)?.into_value())
    }

    /// Re-run `query` whenever the cache changes.
    pub fn watch_query(&self, query: &str, variables: Variables) -> ClientResult<QueryWatch> {
        self.ensure_open()?;
        let document = self.document(query)?;
        expect_kind(&document, OperationKind::Query)?;
        let variables = document.effective_variables(&variables);
        Ok(QueryWatch::new(
            self.clone(),
            document,
            variables,
            self.inner.default_policy,
            self.inner.store.changes(),
            self.inner.shutdown.subscribe(),
        ))
    }

    pub(crate) async fn fetch(
        &self,
        document: Arc<Document>,
        variables: Variables,
        policy: FetchPolicy,
    ) -> ClientResult<QueryResult> {
        self.ensure_open()?;
        let variables = document.effective_variables(&variables);
        let operation = Operation::new(document.clone(), variables.clone());

        if policy.reads_cache() {
            match self.inner.store.materialize(&document, &variables)? {
                ReadOutcome::Complete(data) => {
                    debug!(operation = %operation.name(), "answered from cache");
                    return Ok(QueryResult {
                        data,
                        source: ResultSource::Cache,
                    });
                }
                ReadOutcome::Miss if policy == FetchPolicy::CacheOnly => {
                    return Err(ClientError::CacheMiss(operation.name().to_string()));
                }
                ReadOutcome::Miss => debug!(operation = %operation.name(), "cache miss, fetching"),
            }
        }

        let response = self.inner.pipeline.execute(operation).await?;
        let data = response.data.unwrap_or(Value::Null);
        if policy.writes_cache() {
            self.inner
                .store
                .write(&document, &variables, &data, WriteMode::Merge)?;
        }
        Ok(QueryResult {
            data,
            source: ResultSource::Network,
        })
    }

    // ---- Mutations ----

    /// Run a mutation, applying an optimistic layer first when a payload is
    /// given or the strategy table declares one.
    ///
    /// The layer is settled with the confirmed result, or rolled back when
    /// the mutation fails. Dropping the returned future before it completes
    /// also rolls the layer back.
    pub async fn run_mutation(
        &self,
        mutation: &str,
        variables: Variables,
        optimistic: Option<Value>,
    ) -> ClientResult<MutationResult> {
        self.ensure_open()?;
        let document = self.document(mutation)?;
        expect_kind(&document, OperationKind::Mutation)?;
        let variables = document.effective_variables(&variables);
        let operation = Operation::new(document.clone(), variables.clone());
        let name = operation.name().to_string();
        let updates = self.cache_updates(&name)?;
        let store = &self.inner.store;

        let mut state = MutationState::Submitted;
        let guard = match self.apply_optimistic(&name, &document, &variables, optimistic, &updates)? {
            Some(layer) => {
                advance(&mut state, MutationState::OptimisticApplied, &name);
                Some(LayerGuard::new(store.clone(), layer))
            }
            None => None,
        };

        match self.inner.pipeline.execute(operation).await {
            Ok(response) => {
                let data = response.data.unwrap_or(Value::Null);
                let (layer, report) = match guard {
                    Some(guard) => {
                        let layer = guard.layer;
                        let report = guard.settle(Confirmation {
                            document,
                            variables,
                            data: data.clone(),
                            updates,
                        })?;
                        (Some(layer), report)
                    }
                    None => {
                        store.write_with_updates(&document, &variables, &data, &updates)?;
                        (None, SettleReport::default())
                    }
                };
                for conflict in &report.conflicts {
                    self.inner.observer.record(Diagnostic::new(
                        DiagnosticKind::ReconciliationConflict,
                        name.as_str(),
                        format!(
                            "{} overwritten fields: {}",
                            conflict.key,
                            conflict.fields.join(", ")
                        ),
                    ));
                }
                advance(&mut state, MutationState::Confirmed, &name);
                Ok(MutationResult {
                    data,
                    layer,
                    repointed: report.repointed,
                    conflicts: report.conflicts,
                })
            }
            Err(e) => {
                if let Some(guard) = guard {
                    guard.rollback();
                    advance(&mut state, MutationState::RolledBack, &name);
                }
                Err(e.into())
            }
        }
    }

    /// Apply the explicit payload, or the strategy table's, as a new layer.
    ///
    /// Minting and applying are separate steps, so a concurrent mutation can
    /// claim the same placeholder in between; the store rejects that and a
    /// fresh id is minted.
    fn apply_optimistic(
        &self,
        operation: &str,
        document: &Arc<Document>,
        variables: &Variables,
        explicit: Option<Value>,
        updates: &[CacheUpdate],
    ) -> ClientResult<Option<LayerId>> {
        let store = &self.inner.store;
        let strategy = self.inner.strategies.optimistic(operation);
        let mut attempt = 1;
        loop {
            let placeholder = store.mint_placeholder_id();
            let data = match (&explicit, strategy) {
                (Some(data), _) => with_placeholder_ids(data.clone(), placeholder),
                (None, Some(strategy)) => strategy.payload(document, variables, placeholder),
                (None, None) => return Ok(None),
            };
            let applied = store.apply_optimistic(OptimisticPatch {
                operation: operation.to_string(),
                document: document.clone(),
                variables: variables.clone(),
                data,
                updates: updates.to_vec(),
                placeholder: Some(placeholder),
            });
            match applied {
                Err(CacheError::PlaceholderTaken(id)) if attempt < PLACEHOLDER_ATTEMPTS => {
                    debug!(operation = %operation, placeholder = id, "placeholder taken, minting another");
                    attempt += 1;
                }
                other => return Ok(Some(other?)),
            }
        }
    }

    /// Cache updates the strategy table declares for a mutation.
    fn cache_updates(&self, operation: &str) -> ClientResult<Vec<CacheUpdate>> {
        self.inner
            .strategies
            .updates(operation)
            .iter()
            .map(|strategy| {
                Ok(CacheUpdate {
                    target: self.document(&strategy.target().query)?,
                    variables: strategy.target().variables.clone(),
                    path: strategy.path().to_vec(),
                    action: UpdateAction::Insert(strategy.position()),
                    source_field: None,
                })
            })
            .collect()
    }

    // ---- Subscriptions ----

    /// Open a subscription and merge its events into `target`.
    ///
    /// The merge strategy is the target's own, else the strategy table's entry
    /// for the subscription, else notify-only.
    pub async fn subscribe(
        &self,
        subscription: &str,
        variables: Variables,
        target: LiveTarget,
    ) -> ClientResult<LiveHandle> {
        self.ensure_open()?;
        let document = self.document(subscription)?;
        expect_kind(&document, OperationKind::Subscription)?;
        let variables = document.effective_variables(&variables);
        let operation = Operation::new(document.clone(), variables.clone());
        let name = operation.name().to_string();

        let merge = target
            .merge
            .or_else(|| self.inner.strategies.merge(&name).cloned())
            .unwrap_or(MergeStrategy::NotifyOnly);
        let updates = match (&target.query, merge.is_notify_only()) {
            (_, true) => Vec::new(),
            (Some(query), false) => {
                let target_doc = self.document(&query.query)?;
                let target_vars = target_doc.effective_variables(&query.variables);
                merge_update(&merge, target_doc, target_vars).into_iter().collect()
            }
            (None, false) => {
                return Err(ClientError::Config(format!(
                    "merge strategy for `{name}` needs a target query"
                )))
            }
        };
        let stream = self
            .inner
            .pipeline
            .submit(operation.with_merge_strategy(merge))
            .await?;
        let id = self.inner.next_live.fetch_add(1, Ordering::Relaxed);
        Ok(LiveHandle::spawn(
            id,
            name,
            stream,
            LiveMerge {
                store: self.inner.store.clone(),
                document,
                variables,
                updates,
            },
            self.inner.live.clone(),
        ))
    }

    /// Replace `handle` with a new subscription. The old stream is released
    /// before the new one is opened.
    pub async fn reattach(
        &self,
        handle: &mut LiveHandle,
        subscription: &str,
        variables: Variables,
        target: LiveTarget,
    ) -> ClientResult<()> {
        handle.detach().await;
        *handle = self.subscribe(subscription, variables, target).await?;
        Ok(())
    }

    // ---- Internal ----

    fn ensure_open(&self) -> ClientResult<()> {
        if self.is_shut_down() {
            return Err(ClientError::Shutdown);
        }
        Ok(())
    }

    fn document(&self, source: &str) -> ClientResult<Arc<Document>> {
        let mut documents = self.inner.documents.lock().expect("lock poisoned");
        if let Some(document) = documents.get(source) {
            return Ok(document.clone());
        }
        let document = Arc::new(Document::parse(source)?);
        documents.insert(source.to_string(), document.clone());
        Ok(document)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pipeline", &self.inner.pipeline)
            .field("strategies", &self.inner.strategies.len())
            .field("live", &self.live_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn expect_kind(document: &Document, expected: OperationKind) -> ClientResult<()> {
    if document.kind() != expected {
        return Err(ClientError::WrongOperationKind {
            expected,
            found: document.kind(),
        });
    }
    Ok(())
}

fn advance(state: &mut MutationState, next: MutationState, operation: &str) {
    debug_assert!(state.allows(next), "{state:?} -> {next:?}");
    debug!(operation = %operation, from = ?state, to = ?next, "mutation state");
    *state = next;
}

// ---------------------------------------------------------------------------
// LayerGuard
// ---------------------------------------------------------------------------

/// Owns an optimistic layer until it is settled or rolled back; rolls it
/// back when dropped.
struct LayerGuard {
    store: Arc<dyn NormalizedStore>,
    layer: LayerId,
    armed: bool,
}

impl LayerGuard {
    fn new(store: Arc<dyn NormalizedStore>, layer: LayerId) -> Self {
        Self {
            store,
            layer,
            armed: true,
        }
    }

    fn settle(mut self, confirmation: Confirmation) -> ClientResult<SettleReport> {
        self.armed = false;
        match self.store.settle(self.layer, confirmation) {
            Ok(report) => Ok(report),
            Err(e) => {
                // The confirmed data was unusable; drop the provisional write.
                let _ = self.store.rollback(self.layer);
                Err(e.into())
            }
        }
    }

    fn rollback(mut self) {
        self.armed = false;
        if let Err(e) = self.store.rollback(self.layer) {
            warn!(layer = %self.layer, error = %e, "rollback failed");
        }
    }
}

impl Drop for LayerGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!(layer = %self.layer, "mutation abandoned, rolling back");
            let _ = self.store.rollback(self.layer);
        }
    }
}
