use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::DocumentId;
use crate::entity::{EntityKey, Fields, Node};
use crate::operation::Variables;

/// Identity of a cached result tree: document plus canonical variables.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuerySignature {
    pub document: DocumentId,
    /// Variables as canonical (key-sorted) JSON.
    pub variables: String,
}

impl QuerySignature {
    pub fn new(document: DocumentId, variables: &Variables) -> Self {
        // serde_json maps are key-ordered, so this string is canonical.
        Self {
            document,
            variables: Value::Object(variables.clone()).to_string(),
        }
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.document, self.variables)
    }
}

/// A query's normalized response: root fields by storage key, with every
/// entity position held as a [`Node::Ref`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultTree {
    pub fields: Fields,
}

impl ResultTree {
    pub fn new(fields: Fields) -> Self {
        Self { fields }
    }

    pub fn get(&self, storage_key: &str) -> Option<&Node> {
        self.fields.get(storage_key)
    }

    pub fn get_mut(&mut self, storage_key: &str) -> Option<&mut Node> {
        self.fields.get_mut(storage_key)
    }

    /// Every entity key the tree references.
    pub fn references(&self) -> Vec<EntityKey> {
        let mut out = Vec::new();
        self.fields.values().for_each(|n| n.collect_refs(&mut out));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
