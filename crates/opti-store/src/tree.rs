use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use opti_types::entity::repoint_fields;
use opti_types::{EntityId, EntityKey, Field, QuerySignature, ResultTree, Variables};

/// Cached result trees keyed by query signature.
#[derive(Clone, Debug, Default)]
pub struct ResultTreeCache {
    trees: HashMap<QuerySignature, ResultTree>,
}

impl ResultTreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, signature: &QuerySignature) -> Option<&ResultTree> {
        self.trees.get(signature)
    }

    pub fn get_mut(&mut self, signature: &QuerySignature) -> Option<&mut ResultTree> {
        self.trees.get_mut(signature)
    }

    /// Store a tree, merging its root fields into any tree already cached
    /// under the same signature. Returns `true` if anything changed.
    pub fn write(&mut self, signature: QuerySignature, tree: ResultTree) -> bool {
        let entry = self.trees.entry(signature).or_default();
        let before = entry.clone();
        entry.fields.extend(tree.fields);
        *entry != before
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn repoint(&mut self, from: &EntityKey, to: &EntityKey) {
        for tree in self.trees.values_mut() {
            repoint_fields(&mut tree.fields, from, to);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&QuerySignature, &ResultTree)> {
        self.trees.iter()
    }
}

/// Resolves a parameterized single-entity root field straight to an entity.
///
/// `getTodo(id: 7)` with `RedirectRule { field: "getTodo", typename: "Todo",
/// id_argument: "id" }` resolves to `Todo:7`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub field: String,
    pub typename: String,
    #[serde(default = "default_id_argument")]
    pub id_argument: String,
}

fn default_id_argument() -> String {
    "id".to_string()
}

impl RedirectRule {
    pub fn new(field: impl Into<String>, typename: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            typename: typename.into(),
            id_argument: default_id_argument(),
        }
    }

    /// Entity key this rule maps `field` to, if the rule applies.
    pub fn key_for(&self, field: &Field, variables: &Variables) -> Option<EntityKey> {
        if field.name != self.field {
            return None;
        }
        let arguments = field.resolved_arguments(variables);
        let id = EntityId::from_value(arguments.get(&self.id_argument)?)?;
        Some(EntityKey::new(self.typename.clone(), id))
    }
}
