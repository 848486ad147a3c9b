use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use opti_types::{
    Document, EntityId, EntityKey, Field, Fields, Node, OperationKind, QuerySignature, ResultTree,
    Variables,
};

use crate::entity::{EntityStore, WriteMode};
use crate::error::{CacheError, CacheResult};
use crate::local::LocalState;
use crate::normalize::{normalize, Normalized};
use crate::optimistic::{LayerId, OptimisticLayer, OptimisticStack};
use crate::patch::{Owner, TreePatch};
use crate::read::{ReadOutcome, View};
use crate::traits::NormalizedStore;
use crate::tree::{RedirectRule, ResultTreeCache};
use crate::update::{
    CacheUpdate, Confirmation, OptimisticPatch, ReconciliationConflict, SettleReport,
};

const PLACEHOLDER_RANGE: std::ops::RangeInclusive<i64> = -1_000_000..=-1;

#[derive(Default)]
struct CacheState {
    entities: EntityStore,
    trees: ResultTreeCache,
    layers: OptimisticStack,
    local: LocalState,
    /// Incremented on every base entity write.
    seq: u64,
}

/// In-memory normalized cache.
///
/// Base entities, result trees, optimistic layers and local state share one
/// `RwLock`, so a write (including layer insertion and removal) is a single
/// critical section and readers never observe a half-applied change.
pub struct InMemoryCache {
    state: RwLock<CacheState>,
    redirects: Vec<RedirectRule>,
    version: watch::Sender<u64>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: RwLock::new(CacheState::default()),
            redirects: Vec::new(),
            version,
        }
    }

    pub fn with_redirects(mut self, redirects: Vec<RedirectRule>) -> Self {
        self.redirects = redirects;
        self
    }

    /// Seed local state, e.g. `networkStatus { isConnected: true }`.
    pub fn with_local_defaults(self, defaults: Map<String, Value>) -> Self {
        self.state.write().expect("lock poisoned").local = LocalState::new(defaults);
        self
    }

    /// Entity fields in the base store only.
    pub fn base_entity(&self, key: &EntityKey) -> Option<Fields> {
        let state = self.state.read().expect("lock poisoned");
        state.entities.get(key).map(|e| e.fields.clone())
    }

    /// Base store contents, without write stamps.
    pub fn entity_snapshot(&self) -> std::collections::BTreeMap<EntityKey, Fields> {
        self.state.read().expect("lock poisoned").entities.snapshot()
    }

    pub fn entity_count(&self) -> usize {
        self.state.read().expect("lock poisoned").entities.len()
    }

    pub fn layer_count(&self) -> usize {
        self.state.read().expect("lock poisoned").layers.len()
    }

    pub fn has_layer(&self, id: LayerId) -> bool {
        self.state.read().expect("lock poisoned").layers.contains(id)
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Referenced entity keys with no entity behind them, through every layer.
    pub fn dangling_references(&self) -> Vec<EntityKey> {
        let state = self.state.read().expect("lock poisoned");
        let view = self.view(&state, true);
        let mut refs = Vec::new();
        for (_, tree) in state.trees.iter() {
            refs.extend(tree.references());
        }
        for key in state.entities.keys() {
            if let Some(fields) = view.entity(key) {
                fields.values().for_each(|n| n.collect_refs(&mut refs));
            }
        }
        for layer in state.layers.iter() {
            for (_, fields) in &layer.entity_writes {
                fields.values().for_each(|n| n.collect_refs(&mut refs));
            }
            for patch in &layer.tree_patches {
                refs.extend(patch.references());
            }
        }
        let mut seen = HashSet::new();
        refs.into_iter()
            .filter(|k| !view.contains_entity(k))
            .filter(|k| seen.insert(k.clone()))
            .collect()
    }

    fn view<'a>(&'a self, state: &'a CacheState, with_layers: bool) -> View<'a> {
        View {
            entities: &state.entities,
            trees: &state.trees,
            layers: with_layers.then_some(&state.layers),
            redirects: &self.redirects,
            local: &state.local,
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Normalize response data without touching the store.
    fn normalize_data(document: &Document, variables: &Variables, data: &Value) -> CacheResult<Normalized> {
        let empty = Map::new();
        let object = match data {
            Value::Object(object) => object,
            Value::Null => &empty,
            other => {
                return Err(CacheError::Shape {
                    path: String::new(),
                    reason: format!("expected data object, found {other}"),
                })
            }
        };
        normalize(document.selection_set(), object, variables)
    }

    /// Write normalized data to the base store. Returns `true` if anything changed.
    fn commit(
        state: &mut CacheState,
        document: &Document,
        variables: &Variables,
        normalized: &Normalized,
        mode: WriteMode,
    ) -> bool {
        let mut changed = false;
        for (key, fields) in &normalized.entities {
            state.seq += 1;
            changed |= state.entities.write(key.clone(), fields, mode, state.seq);
        }
        if document.kind() == OperationKind::Query && !normalized.root.is_empty() {
            let signature = QuerySignature::new(document.id(), variables);
            changed |= state
                .trees
                .write(signature, ResultTree::new(normalized.root.clone()));
        }
        changed
    }

    /// Build patches for `updates`, resolving targets through the base store
    /// (`with_layers == false`) or through every layer. Each patch is tried on
    /// a copy of its target first, so an invalid target fails here and not
    /// halfway through a write.
    fn build_patches(
        &self,
        state: &CacheState,
        with_layers: bool,
        document: &Document,
        variables: &Variables,
        normalized: &Normalized,
        updates: &[CacheUpdate],
    ) -> CacheResult<Vec<TreePatch>> {
        let view = self.view(state, with_layers);
        let mut patches = Vec::new();
        for update in updates {
            let node = normalized.root_node(
                document.selection_set(),
                variables,
                update.source_field.as_deref(),
            );
            let Some(node) = node.filter(|n| **n != Node::Scalar(Value::Null)) else {
                debug!(path = %update.path.join("."), "update skipped, no source value");
                continue;
            };
            match view.resolve_location(&update.target, &update.variables, &update.path)? {
                Some(location) => patches.push(TreePatch {
                    location,
                    op: update.action.op(node.clone()),
                }),
                None => {
                    debug!(
                        query = %update.target.id(),
                        path = %update.path.join("."),
                        "update target not cached"
                    );
                }
            }
        }
        check_patches(&view, &patches)?;
        Ok(patches)
    }

    fn apply_base_patch(state: &mut CacheState, patch: &TreePatch) -> bool {
        let apply = |fields: &mut Fields| match patch.apply(fields) {
            Ok(changed) => changed,
            Err(e) => {
                warn!(error = %e, "update not applied");
                false
            }
        };
        match &patch.location.owner {
            Owner::Tree(signature) => state
                .trees
                .get_mut(signature)
                .is_some_and(|tree| apply(&mut tree.fields)),
            Owner::Entity(key) => {
                state.seq += 1;
                let seq = state.seq;
                state.entities.get_mut(key).is_some_and(|entity| {
                    let changed = apply(&mut entity.fields);
                    if changed {
                        entity.written_seq = seq;
                    }
                    changed
                })
            }
        }
    }

    /// Negative ids used by stored or provisional entities.
    fn taken_placeholders(state: &CacheState) -> HashSet<i64> {
        state
            .entities
            .keys()
            .chain(state.layers.iter().flat_map(|l| l.entity_writes.iter().map(|(k, _)| k)))
            .filter_map(|key| match key.id {
                EntityId::Int(i) if i < 0 => Some(i),
                _ => None,
            })
            .collect()
    }
}

/// Try every patch on a copy of its owner's fields, in order.
fn check_patches(view: &View<'_>, patches: &[TreePatch]) -> CacheResult<()> {
    let mut scratch: HashMap<&Owner, Fields> = HashMap::new();
    for patch in patches {
        let owner = &patch.location.owner;
        let fields = match scratch.entry(owner) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let loaded = match owner {
                    Owner::Tree(signature) => view.tree(signature).map(|t| t.fields),
                    Owner::Entity(key) => view.entity(key),
                };
                match loaded {
                    Some(fields) => e.insert(fields),
                    None => continue,
                }
            }
        };
        patch.apply(fields)?;
    }
    Ok(())
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NormalizedStore for InMemoryCache {
    fn write(&self, document: &Document, variables: &Variables, data: &Value, mode: WriteMode) -> CacheResult<()> {
        let normalized = Self::normalize_data(document, variables, data)?;
        let mut state = self.state.write().expect("lock poisoned");
        let changed = Self::commit(&mut state, document, variables, &normalized, mode);
        drop(state);
        if changed {
            self.bump();
        }
        Ok(())
    }

    fn write_with_updates(
        &self,
        document: &Document,
        variables: &Variables,
        data: &Value,
        updates: &[CacheUpdate],
    ) -> CacheResult<()> {
        let normalized = Self::normalize_data(document, variables, data)?;
        let mut state = self.state.write().expect("lock poisoned");
        let patches = self.build_patches(&state, false, document, variables, &normalized, updates)?;
        let mut changed = Self::commit(&mut state, document, variables, &normalized, WriteMode::Merge);
        for patch in &patches {
            changed |= Self::apply_base_patch(&mut state, patch);
        }
        drop(state);
        if changed {
            self.bump();
        }
        Ok(())
    }

    fn read(&self, signature: &QuerySignature) -> Option<ResultTree> {
        let state = self.state.read().expect("lock poisoned");
        self.view(&state, true).tree(signature)
    }

    fn read_redirect(&self, document: &Document, variables: &Variables) -> Option<EntityKey> {
        let [field] = document.selection_set() else {
            return None;
        };
        let state = self.state.read().expect("lock poisoned");
        self.view(&state, true).redirect(field, variables)
    }

    fn materialize(&self, document: &Document, variables: &Variables) -> CacheResult<ReadOutcome> {
        let state = self.state.read().expect("lock poisoned");
        self.view(&state, true).materialize(document, variables)
    }

    fn entity(&self, key: &EntityKey) -> Option<Fields> {
        let state = self.state.read().expect("lock poisoned");
        self.view(&state, true).entity(key)
    }

    fn apply_optimistic(&self, patch: OptimisticPatch) -> CacheResult<LayerId> {
        let mut state = self.state.write().expect("lock poisoned");
        if let Some(id) = patch.placeholder {
            if Self::taken_placeholders(&state).contains(&id) {
                return Err(CacheError::PlaceholderTaken(id));
            }
        }
        let object = patch.data.as_object().cloned().unwrap_or_default();
        let normalized = normalize(patch.document.selection_set(), &object, &patch.variables)?;
        let tree_patches = self.build_patches(
            &state,
            true,
            &patch.document,
            &patch.variables,
            &normalized,
            &patch.updates,
        )?;

        let layer = OptimisticLayer {
            id: LayerId::new(),
            operation: patch.operation,
            root: normalized.root,
            entity_writes: normalized.entities,
            tree_patches,
            base_seq: state.seq,
        };

        {
            let view = self.view(&state, true);
            let mut refs = Vec::new();
            for (_, fields) in &layer.entity_writes {
                fields.values().for_each(|n| n.collect_refs(&mut refs));
            }
            for p in &layer.tree_patches {
                refs.extend(p.references());
            }
            if let Some(missing) = refs
                .into_iter()
                .find(|k| !view.contains_entity(k) && !layer.writes_entity(k))
            {
                return Err(CacheError::DanglingReference(missing));
            }
        }

        let id = layer.id;
        debug!(
            layer = %id,
            operation = %layer.operation,
            placeholders = layer.placeholders().len(),
            patches = layer.tree_patches.len(),
            "optimistic layer applied"
        );
        state.layers.push(layer);
        drop(state);
        self.bump();
        Ok(id)
    }

    fn settle(&self, layer: LayerId, confirmation: Confirmation) -> CacheResult<SettleReport> {
        let confirmed = Self::normalize_data(
            &confirmation.document,
            &confirmation.variables,
            &confirmation.data,
        )?;

        let mut state = self.state.write().expect("lock poisoned");
        let removed = state.layers.remove(layer).ok_or(CacheError::UnknownLayer(layer))?;

        let mut report = SettleReport::default();
        for (key, fields) in &confirmed.entities {
            let Some(existing) = state.entities.get(key) else {
                continue;
            };
            if existing.written_seq <= removed.base_seq {
                continue;
            }
            let differing: Vec<String> = fields
                .iter()
                .filter(|(name, node)| existing.fields.get(*name).is_some_and(|e| e != *node))
                .map(|(name, _)| name.clone())
                .collect();
            if !differing.is_empty() && !report.conflicts.iter().any(|c| &c.key == key) {
                warn!(
                    key = %key,
                    fields = ?differing,
                    operation = %removed.operation,
                    "reconciliation conflict, confirmed write wins"
                );
                report.conflicts.push(ReconciliationConflict {
                    key: key.clone(),
                    fields: differing,
                });
            }
        }

        Self::commit(
            &mut state,
            &confirmation.document,
            &confirmation.variables,
            &confirmed,
            WriteMode::Merge,
        );

        let mut pairs = Vec::new();
        for (key, provisional) in &removed.root {
            if let Some(confirmed_node) = confirmed.root.get(key) {
                pair_placeholders(provisional, confirmed_node, &mut pairs);
            }
        }
        for (from, to) in &pairs {
            state.layers.repoint(from, to);
            state.entities.repoint(from, to);
            state.trees.repoint(from, to);
            debug!(from = %from, to = %to, "placeholder repointed");
        }
        report.repointed = pairs;

        match self.build_patches(
            &state,
            false,
            &confirmation.document,
            &confirmation.variables,
            &confirmed,
            &confirmation.updates,
        ) {
            Ok(patches) => {
                for patch in &patches {
                    Self::apply_base_patch(&mut state, patch);
                }
            }
            Err(e) => warn!(layer = %layer, error = %e, "confirmed update not applied"),
        }

        debug!(
            layer = %layer,
            operation = %removed.operation,
            repointed = report.repointed.len(),
            conflicts = report.conflicts.len(),
            "optimistic layer settled"
        );
        drop(state);
        self.bump();
        Ok(report)
    }

    fn rollback(&self, layer: LayerId) -> CacheResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let removed = state.layers.remove(layer).ok_or(CacheError::UnknownLayer(layer))?;
        drop(state);
        debug!(layer = %layer, operation = %removed.operation, "optimistic layer rolled back");
        self.bump();
        Ok(())
    }

    fn mint_placeholder_id(&self) -> i64 {
        let taken = Self::taken_placeholders(&self.state.read().expect("lock poisoned"));
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let candidate = rng.gen_range(PLACEHOLDER_RANGE);
            if !taken.contains(&candidate) {
                return candidate;
            }
        }
        taken.iter().min().copied().unwrap_or(0) - 1
    }

    fn read_local(&self, field: &Field) -> CacheResult<Value> {
        self.state.read().expect("lock poisoned").local.read(field)
    }

    fn write_local(&self, name: &str, value: Value) {
        let changed = self
            .state
            .write()
            .expect("lock poisoned")
            .local
            .write(name, value);
        if changed {
            self.bump();
        }
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

/// Pair provisional placeholder refs with the confirmed refs at the same position.
fn pair_placeholders(provisional: &Node, confirmed: &Node, out: &mut Vec<(EntityKey, EntityKey)>) {
    match (provisional, confirmed) {
        (Node::Ref(from), Node::Ref(to)) if from != to && from.is_placeholder() => {
            if !out.iter().any(|(f, _)| f == from) {
                out.push((from.clone(), to.clone()));
            }
        }
        (Node::List(a), Node::List(b)) => {
            for (p, c) in a.iter().zip(b) {
                pair_placeholders(p, c, out);
            }
        }
        (Node::Object(a), Node::Object(b)) => {
            for (key, p) in a {
                if let Some(c) = b.get(key) {
                    pair_placeholders(p, c, out);
                }
            }
        }
        _ => {}
    }
}

impl std::fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("lock poisoned");
        f.debug_struct("InMemoryCache")
            .field("entity_count", &state.entities.len())
            .field("tree_count", &state.trees.len())
            .field("layer_count", &state.layers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use opti_types::ListPosition;
    use serde_json::json;

    use crate::update::UpdateAction;

    const LIST_TODOS: &str = "query ListTodos { listTodos { id name } }";
    const GET_TODO: &str = "query GetTodo($id: ID!) { getTodo(id: $id) { id name } }";
    const ADD_TODO: &str = "mutation AddTodo($input: TodoInput) { addTodo(input: $input) { id name } }";

    fn doc(source: &str) -> Arc<Document> {
        Arc::new(Document::parse(source).unwrap())
    }

    fn vars(value: Value) -> Variables {
        value.as_object().cloned().unwrap_or_default()
    }

    fn todo(id: i64, name: &str) -> Value {
        json!({"__typename": "Todo", "id": id, "name": name})
    }

    fn seeded() -> (InMemoryCache, Arc<Document>) {
        let cache = InMemoryCache::new().with_redirects(vec![RedirectRule::new("getTodo", "Todo")]);
        let list = doc(LIST_TODOS);
        cache
            .write(
                &list,
                &Variables::new(),
                &json!({"listTodos": [todo(1, "Walk dog"), todo(2, "Read")]}),
                WriteMode::Merge,
            )
            .unwrap();
        (cache, list)
    }

    fn list_update(list: &Arc<Document>) -> CacheUpdate {
        CacheUpdate {
            target: list.clone(),
            variables: Variables::new(),
            path: vec!["listTodos".into()],
            action: UpdateAction::Insert(ListPosition::End),
            source_field: None,
        }
    }

    fn optimistic_add(cache: &InMemoryCache, list: &Arc<Document>, name: &str) -> (LayerId, i64) {
        let placeholder = cache.mint_placeholder_id();
        let layer = cache
            .apply_optimistic(OptimisticPatch {
                operation: "AddTodo".into(),
                document: doc(ADD_TODO),
                variables: vars(json!({"input": {"name": name}})),
                data: json!({"addTodo": todo(placeholder, name)}),
                updates: vec![list_update(list)],
                placeholder: Some(placeholder),
            })
            .unwrap();
        (layer, placeholder)
    }

    fn list_ids(cache: &InMemoryCache, list: &Document) -> Vec<i64> {
        let data = cache
            .materialize(list, &Variables::new())
            .unwrap()
            .into_value()
            .unwrap();
        data["listTodos"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_i64().unwrap())
            .collect()
    }

    // ---- 1. Writes and reads ----

    #[test]
    fn write_then_materialize() {
        let (cache, list) = seeded();
        assert_eq!(cache.entity_count(), 2);
        let data = cache.materialize(&list, &Variables::new()).unwrap();
        assert_eq!(
            data,
            ReadOutcome::Complete(json!({"listTodos": [
                {"id": 1, "name": "Walk dog"},
                {"id": 2, "name": "Read"}
            ]}))
        );
    }

    #[test]
    fn entities_are_shared_across_queries() {
        let (cache, list) = seeded();
        let get = doc(GET_TODO);
        cache
            .write(&get, &vars(json!({"id": 1})), &json!({"getTodo": todo(1, "Walk cat")}), WriteMode::Merge)
            .unwrap();
        assert_eq!(cache.entity_count(), 2);
        let data = cache.materialize(&list, &Variables::new()).unwrap().into_value().unwrap();
        assert_eq!(data["listTodos"][0]["name"], json!("Walk cat"));
    }

    #[test]
    fn unknown_query_is_a_miss() {
        let cache = InMemoryCache::new();
        let outcome = cache.materialize(&doc(LIST_TODOS), &Variables::new()).unwrap();
        assert!(outcome.is_miss());
        assert!(cache.read(&QuerySignature::new(doc(LIST_TODOS).id(), &Variables::new())).is_none());
    }

    #[test]
    fn partial_entity_is_a_miss() {
        let (cache, _) = seeded();
        let detail = doc("query GetTodo($id: ID!) { getTodo(id: $id) { id name done } }");
        let outcome = cache.materialize(&detail, &vars(json!({"id": 1}))).unwrap();
        assert!(outcome.is_miss());
    }

    #[test]
    fn read_returns_references() {
        let (cache, list) = seeded();
        let tree = cache.read(&QuerySignature::new(list.id(), &Variables::new())).unwrap();
        assert_eq!(tree.references(), vec![EntityKey::new("Todo", 1), EntityKey::new("Todo", 2)]);
    }

    #[test]
    fn writes_bump_version_only_on_change() {
        let (cache, list) = seeded();
        let before = cache.version();
        cache
            .write(
                &list,
                &Variables::new(),
                &json!({"listTodos": [todo(1, "Walk dog"), todo(2, "Read")]}),
                WriteMode::Merge,
            )
            .unwrap();
        assert_eq!(cache.version(), before);
    }

    // ---- 2. Redirects ----

    #[test]
    fn redirect_hits_present_entity() {
        let (cache, _) = seeded();
        let get = doc(GET_TODO);
        let variables = vars(json!({"id": 2}));
        assert_eq!(cache.read_redirect(&get, &variables), Some(EntityKey::new("Todo", 2)));
        let data = cache.materialize(&get, &variables).unwrap().into_value().unwrap();
        assert_eq!(data, json!({"getTodo": {"id": 2, "name": "Read"}}));
    }

    #[test]
    fn redirect_misses_absent_entity() {
        let (cache, _) = seeded();
        let get = doc(GET_TODO);
        let variables = vars(json!({"id": 7}));
        assert_eq!(cache.read_redirect(&get, &variables), None);
        assert!(cache.materialize(&get, &variables).unwrap().is_miss());
    }

    // ---- 3. Optimistic layers ----

    #[test]
    fn optimistic_entity_is_visible_immediately() {
        let (cache, list) = seeded();
        let (layer, placeholder) = optimistic_add(&cache, &list, "Buy milk");
        assert!(placeholder < 0);
        assert!(cache.has_layer(layer));
        assert_eq!(list_ids(&cache, &list), vec![1, 2, placeholder]);
        assert!(cache.base_entity(&EntityKey::new("Todo", placeholder)).is_none());
        assert!(cache.dangling_references().is_empty());
    }

    #[test]
    fn rollback_restores_exact_prior_state() {
        let (cache, list) = seeded();
        let before = serde_json::to_string(
            &cache.materialize(&list, &Variables::new()).unwrap().into_value().unwrap(),
        )
        .unwrap();
        let snapshot = cache.entity_snapshot();

        let (layer, _) = optimistic_add(&cache, &list, "Buy milk");
        cache.rollback(layer).unwrap();

        let after = serde_json::to_string(
            &cache.materialize(&list, &Variables::new()).unwrap().into_value().unwrap(),
        )
        .unwrap();
        assert_eq!(before, after);
        assert_eq!(snapshot, cache.entity_snapshot());
        assert_eq!(cache.layer_count(), 0);
    }

    #[test]
    fn layer_is_removed_exactly_once() {
        let (cache, list) = seeded();
        let (layer, _) = optimistic_add(&cache, &list, "Buy milk");
        cache.rollback(layer).unwrap();
        assert!(matches!(cache.rollback(layer), Err(CacheError::UnknownLayer(_))));
        let confirmation = Confirmation {
            document: doc(ADD_TODO),
            variables: Variables::new(),
            data: json!({"addTodo": todo(42, "Buy milk")}),
            updates: Vec::new(),
        };
        assert!(matches!(
            cache.settle(layer, confirmation),
            Err(CacheError::UnknownLayer(_))
        ));
    }

    #[test]
    fn settle_replaces_placeholder_without_duplicates() {
        let (cache, list) = seeded();
        let (layer, placeholder) = optimistic_add(&cache, &list, "Buy milk");
        let report = cache
            .settle(
                layer,
                Confirmation {
                    document: doc(ADD_TODO),
                    variables: vars(json!({"input": {"name": "Buy milk"}})),
                    data: json!({"addTodo": todo(42, "Buy milk")}),
                    updates: vec![list_update(&list)],
                },
            )
            .unwrap();
        assert_eq!(
            report.repointed,
            vec![(EntityKey::new("Todo", placeholder), EntityKey::new("Todo", 42))]
        );
        assert!(report.conflicts.is_empty());
        assert_eq!(list_ids(&cache, &list), vec![1, 2, 42]);
        assert!(cache.entity(&EntityKey::new("Todo", placeholder)).is_none());
        assert!(cache.dangling_references().is_empty());
    }

    #[test]
    fn later_layer_referencing_placeholder_is_repointed() {
        let (cache, list) = seeded();
        let (first, placeholder) = optimistic_add(&cache, &list, "Buy milk");
        let rename = doc("mutation Rename($id: ID!) { renameTodo(id: $id) { id name } }");
        let second = cache
            .apply_optimistic(OptimisticPatch {
                operation: "Rename".into(),
                document: rename,
                variables: vars(json!({"id": placeholder})),
                data: json!({"renameTodo": todo(placeholder, "Buy oat milk")}),
                updates: Vec::new(),
                placeholder: None,
            })
            .unwrap();
        cache
            .settle(
                first,
                Confirmation {
                    document: doc(ADD_TODO),
                    variables: Variables::new(),
                    data: json!({"addTodo": todo(42, "Buy milk")}),
                    updates: vec![list_update(&list)],
                },
            )
            .unwrap();
        let real = EntityKey::new("Todo", 42);
        assert_eq!(
            cache.entity(&real).unwrap()["name"],
            Node::Scalar(json!("Buy oat milk"))
        );
        cache.rollback(second).unwrap();
        assert_eq!(cache.entity(&real).unwrap()["name"], Node::Scalar(json!("Buy milk")));
    }

    #[test]
    fn concurrent_base_write_is_reported_as_conflict() {
        let (cache, list) = seeded();
        let edit = doc("mutation Edit($id: ID!) { editTodo(id: $id) { id name } }");
        let layer = cache
            .apply_optimistic(OptimisticPatch {
                operation: "Edit".into(),
                document: edit.clone(),
                variables: vars(json!({"id": 1})),
                data: json!({"editTodo": todo(1, "Walk the dog")}),
                updates: Vec::new(),
                placeholder: None,
            })
            .unwrap();
        cache
            .write(
                &list,
                &Variables::new(),
                &json!({"listTodos": [todo(1, "Walk dog twice"), todo(2, "Read")]}),
                WriteMode::Merge,
            )
            .unwrap();
        let report = cache
            .settle(
                layer,
                Confirmation {
                    document: edit,
                    variables: vars(json!({"id": 1})),
                    data: json!({"editTodo": todo(1, "Walk the dog")}),
                    updates: Vec::new(),
                },
            )
            .unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].key, EntityKey::new("Todo", 1));
        assert_eq!(report.conflicts[0].fields, vec!["name".to_string()]);
        assert_eq!(
            cache.base_entity(&EntityKey::new("Todo", 1)).unwrap()["name"],
            Node::Scalar(json!("Walk the dog"))
        );
    }

    #[test]
    fn layer_may_reference_entities_it_writes() {
        let (cache, list) = seeded();
        let mutation = doc("mutation Link { link { id owner { id } } }");
        let result = cache.apply_optimistic(OptimisticPatch {
            operation: "Link".into(),
            document: mutation,
            variables: Variables::new(),
            data: json!({"link": {"__typename": "Todo", "id": 1, "owner": {"__typename": "User", "id": 9}}}),
            updates: vec![list_update(&list)],
            placeholder: None,
        });
        assert!(result.is_ok());
        assert!(cache.dangling_references().is_empty());
    }

    #[test]
    fn placeholder_ids_are_unique_and_negative() {
        let (cache, list) = seeded();
        let (_, a) = optimistic_add(&cache, &list, "a");
        let b = cache.mint_placeholder_id();
        assert!(a < 0 && b < 0);
        assert_ne!(a, b);
    }

    #[test]
    fn placeholder_claimed_between_mint_and_apply_is_rejected() {
        let (cache, list) = seeded();
        let placeholder = cache.mint_placeholder_id();
        let patch = |name: &str| OptimisticPatch {
            operation: "AddTodo".into(),
            document: doc(ADD_TODO),
            variables: vars(json!({"input": {"name": name}})),
            data: json!({"addTodo": todo(placeholder, name)}),
            updates: vec![list_update(&list)],
            placeholder: Some(placeholder),
        };
        cache.apply_optimistic(patch("first")).unwrap();
        let err = cache.apply_optimistic(patch("second")).unwrap_err();
        assert!(matches!(err, CacheError::PlaceholderTaken(id) if id == placeholder));
        assert_eq!(cache.layer_count(), 1);
        assert_eq!(list_ids(&cache, &list), vec![1, 2, placeholder]);
    }

    // ---- 4. Updates and local state ----

    #[test]
    fn write_with_updates_appends_to_nested_list() {
        let cache = InMemoryCache::new();
        let detail = doc("query Detail($id: ID!) { getTodo(id: $id) { id notes { id text } } }");
        let variables = vars(json!({"id": 7}));
        cache
            .write(
                &detail,
                &variables,
                &json!({"getTodo": {"__typename": "Todo", "id": 7, "notes": []}}),
                WriteMode::Merge,
            )
            .unwrap();
        let event = doc("subscription { noteAdded { id text } }");
        let update = CacheUpdate {
            target: detail.clone(),
            variables: variables.clone(),
            path: vec!["getTodo".into(), "notes".into()],
            action: UpdateAction::Insert(ListPosition::End),
            source_field: Some("noteAdded".into()),
        };
        for (id, text) in [(1, "a"), (2, "b")] {
            cache
                .write_with_updates(
                    &event,
                    &Variables::new(),
                    &json!({"noteAdded": {"__typename": "Note", "id": id, "text": text}}),
                    std::slice::from_ref(&update),
                )
                .unwrap();
        }
        let data = cache.materialize(&detail, &variables).unwrap().into_value().unwrap();
        assert_eq!(
            data["getTodo"]["notes"],
            json!([{"id": 1, "text": "a"}, {"id": 2, "text": "b"}])
        );
    }

    #[test]
    fn write_with_updates_appends_plain_values_in_order() {
        let cache = InMemoryCache::new();
        let detail = doc("query GetTodo($id: ID) { getTodo(id: $id) { id notes } }");
        let variables = vars(json!({"id": 7}));
        cache
            .write(
                &detail,
                &variables,
                &json!({"getTodo": {"__typename": "Todo", "id": 7, "notes": []}}),
                WriteMode::Merge,
            )
            .unwrap();
        let event = doc("subscription { noteAdded }");
        let update = CacheUpdate {
            target: detail.clone(),
            variables: variables.clone(),
            path: vec!["getTodo".into(), "notes".into()],
            action: UpdateAction::Insert(ListPosition::End),
            source_field: Some("noteAdded".into()),
        };
        for note in ["ok", "ok", "done"] {
            cache
                .write_with_updates(
                    &event,
                    &Variables::new(),
                    &json!({ "noteAdded": note }),
                    std::slice::from_ref(&update),
                )
                .unwrap();
        }
        let data = cache.materialize(&detail, &variables).unwrap().into_value().unwrap();
        assert_eq!(data["getTodo"]["notes"], json!(["ok", "ok", "done"]));
    }

    #[test]
    fn invalid_update_path_is_an_error() {
        let (cache, list) = seeded();
        let mut update = list_update(&list);
        update.path = vec!["todos".into()];
        let err = cache
            .write_with_updates(
                &doc(ADD_TODO),
                &Variables::new(),
                &json!({"addTodo": todo(3, "x")}),
                &[update],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidPath { .. }));
    }

    #[test]
    fn rejected_update_writes_nothing() {
        let (cache, list) = seeded();
        let get = doc(GET_TODO);
        let variables = vars(json!({"id": 1}));
        cache
            .write(&get, &variables, &json!({"getTodo": todo(1, "Walk dog")}), WriteMode::Merge)
            .unwrap();
        let before = cache.version();
        let into_name = CacheUpdate {
            target: get,
            variables,
            path: vec!["getTodo".into(), "name".into()],
            action: UpdateAction::Insert(ListPosition::End),
            source_field: None,
        };

        let err = cache
            .write_with_updates(
                &doc(ADD_TODO),
                &Variables::new(),
                &json!({"addTodo": todo(3, "x")}),
                &[into_name],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidPath { .. }));
        assert!(cache.base_entity(&EntityKey::new("Todo", 3)).is_none());
        assert_eq!(cache.version(), before);
        assert_eq!(list_ids(&cache, &list), vec![1, 2]);
    }

    #[test]
    fn local_fields_merge_into_reads() {
        let cache = InMemoryCache::new().with_local_defaults(vars(
            json!({"networkStatus": {"__typename": "NetworkStatus", "isConnected": true}}),
        ));
        let mixed = doc("query { networkStatus @client { isConnected } listTodos { id } }");
        cache
            .write(&mixed, &Variables::new(), &json!({"listTodos": [todo(1, "a")]}), WriteMode::Merge)
            .unwrap();
        let data = cache.materialize(&mixed, &Variables::new()).unwrap().into_value().unwrap();
        assert_eq!(data["networkStatus"], json!({"isConnected": true}));
        cache.write_local("networkStatus", json!({"isConnected": false}));
        let data = cache.materialize(&mixed, &Variables::new()).unwrap().into_value().unwrap();
        assert_eq!(data["networkStatus"], json!({"isConnected": false}));
    }

    #[tokio::test]
    async fn changes_notify_watchers() {
        let (cache, list) = seeded();
        let mut rx = cache.changes();
        let (layer, _) = optimistic_add(&cache, &list, "x");
        rx.changed().await.unwrap();
        cache.rollback(layer).unwrap();
        rx.changed().await.unwrap();
    }

    // ---- 5. Properties ----

    proptest::proptest! {
        #[test]
        fn normalization_is_idempotent(names in proptest::collection::vec("[a-z]{0,6}", 1..6)) {
            let list = doc(LIST_TODOS);
            let todos: Vec<Value> = names
                .iter()
                .enumerate()
                .map(|(i, n)| todo(i as i64 + 1, n))
                .collect();
            let data = json!({"listTodos": todos});

            let once = InMemoryCache::new();
            once.write(&list, &Variables::new(), &data, WriteMode::Merge).unwrap();
            let twice = InMemoryCache::new();
            twice.write(&list, &Variables::new(), &data, WriteMode::Merge).unwrap();
            twice.write(&list, &Variables::new(), &data, WriteMode::Merge).unwrap();

            proptest::prop_assert_eq!(once.entity_snapshot(), twice.entity_snapshot());
            proptest::prop_assert_eq!(
                once.materialize(&list, &Variables::new()).unwrap(),
                twice.materialize(&list, &Variables::new()).unwrap()
            );
        }
    }
}
