//! Reading through the optimistic stack.

use serde_json::{Map, Value};

use opti_types::{
    Document, EntityKey, Field, Fields, Node, QuerySignature, ResultTree, Variables, TYPENAME_FIELD,
};

use crate::entity::EntityStore;
use crate::error::{CacheError, CacheResult};
use crate::local::LocalState;
use crate::optimistic::OptimisticStack;
use crate::patch::{Location, Owner};
use crate::tree::{RedirectRule, ResultTreeCache};

/// Result of materializing a query from the cache.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadOutcome {
    /// Every selected field was available.
    Complete(Value),
    /// Something selected is not cached; the caller should fetch.
    Miss,
}

impl ReadOutcome {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Complete(value) => Some(value),
            Self::Miss => None,
        }
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }
}

enum Step {
    Entity(EntityKey),
    Embedded(Fields),
}

/// A consistent read view: base store plus, optionally, every optimistic layer.
pub(crate) struct View<'a> {
    pub entities: &'a EntityStore,
    pub trees: &'a ResultTreeCache,
    pub layers: Option<&'a OptimisticStack>,
    pub redirects: &'a [RedirectRule],
    pub local: &'a LocalState,
}

impl View<'_> {
    pub fn entity(&self, key: &EntityKey) -> Option<Fields> {
        let mut fields = self.entities.get(key).map(|e| e.fields.clone());
        if let Some(layers) = self.layers {
            for layer in layers.iter() {
                layer.overlay_entity(key, &mut fields);
            }
        }
        fields
    }

    pub fn tree(&self, signature: &QuerySignature) -> Option<ResultTree> {
        let mut tree = self.trees.get(signature)?.clone();
        if let Some(layers) = self.layers {
            let owner = Owner::Tree(signature.clone());
            for layer in layers.iter() {
                layer.overlay_owner(&owner, &mut tree.fields);
            }
        }
        Some(tree)
    }

    pub fn contains_entity(&self, key: &EntityKey) -> bool {
        self.entities.contains(key)
            || self
                .layers
                .is_some_and(|layers| layers.iter().any(|l| l.writes_entity(key)))
    }

    /// Redirect target for a root field, only when that entity is present.
    pub fn redirect(&self, field: &Field, variables: &Variables) -> Option<EntityKey> {
        self.redirects
            .iter()
            .find_map(|rule| rule.key_for(field, variables))
            .filter(|key| self.contains_entity(key))
    }

    /// Resolve a response-key path inside a cached query to a patch location.
    ///
    /// `Ok(None)` means the query (or an intermediate entity) is not cached.
    pub fn resolve_location(
        &self,
        document: &Document,
        variables: &Variables,
        path: &[String],
    ) -> CacheResult<Option<Location>> {
        let invalid = |reason: String| CacheError::InvalidPath {
            path: path.join("."),
            reason,
        };
        if path.is_empty() {
            return Err(invalid("empty path".into()));
        }
        let signature = QuerySignature::new(document.id(), variables);
        let Some(tree) = self.tree(&signature) else {
            return Ok(None);
        };
        let mut owner = Owner::Tree(signature);
        let mut keys: Vec<String> = Vec::new();
        let mut fields = tree.fields;
        let mut selection = document.selection_set();

        for (i, segment) in path.iter().enumerate() {
            let field = selection
                .iter()
                .find(|f| f.response_key() == segment)
                .ok_or_else(|| invalid(format!("'{segment}' is not selected")))?;
            let storage_key = field.storage_key(variables);
            if i + 1 == path.len() {
                keys.push(storage_key);
                return Ok(Some(Location { owner, keys }));
            }
            let child = match fields.get(&storage_key) {
                Some(Node::Ref(key)) => Step::Entity(key.clone()),
                Some(Node::Object(inner)) => Step::Embedded(inner.clone()),
                Some(_) => return Err(invalid(format!("'{segment}' is not an object"))),
                None => return Ok(None),
            };
            match child {
                Step::Embedded(inner) => {
                    keys.push(storage_key);
                    fields = inner;
                }
                Step::Entity(key) => {
                    let Some(next) = self.entity(&key) else {
                        return Ok(None);
                    };
                    owner = Owner::Entity(key);
                    keys.clear();
                    fields = next;
                }
            }
            selection = &field.selection_set;
        }
        Ok(None)
    }

    pub fn materialize(&self, document: &Document, variables: &Variables) -> CacheResult<ReadOutcome> {
        let signature = QuerySignature::new(document.id(), variables);
        let tree = self.tree(&signature);
        let mut out = Map::new();
        for field in document.selection_set() {
            if field.is_local() {
                out.insert(field.response_key().to_string(), self.local.read(field)?);
                continue;
            }
            let stored = tree
                .as_ref()
                .and_then(|t| t.get(&field.storage_key(variables)).cloned());
            let node = match stored {
                Some(node) => node,
                None => match self.redirect(field, variables) {
                    Some(key) => Node::Ref(key),
                    None => return Ok(ReadOutcome::Miss),
                },
            };
            match self.denormalize(&node, field, variables) {
                Some(value) => {
                    out.insert(field.response_key().to_string(), value);
                }
                None => return Ok(ReadOutcome::Miss),
            }
        }
        Ok(ReadOutcome::Complete(Value::Object(out)))
    }

    fn denormalize(&self, node: &Node, field: &Field, variables: &Variables) -> Option<Value> {
        match node {
            Node::Scalar(value) => Some(value.clone()),
            Node::Ref(key) if field.is_leaf() => Some(key.id.to_value()),
            Node::Ref(key) => {
                let entity = self.entity(key)?;
                self.select(&entity, &field.selection_set, variables)
            }
            Node::List(items) => items
                .iter()
                .map(|item| self.denormalize(item, field, variables))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Node::Object(fields) => self.select(fields, &field.selection_set, variables),
        }
    }

    fn select(&self, fields: &Fields, selection: &[Field], variables: &Variables) -> Option<Value> {
        let mut out = Map::new();
        for sub in selection {
            let key = sub.storage_key(variables);
            let value = match fields.get(&key) {
                Some(node) => self.denormalize(node, sub, variables)?,
                // Objects written without a typename still satisfy the selection.
                None if sub.name == TYPENAME_FIELD => continue,
                None => return None,
            };
            out.insert(sub.response_key().to_string(), value);
        }
        Some(Value::Object(out))
    }
}
