//! Targeted edits of cached trees and entities.
//!
//! A [`TreePatch`] names a field by its owner (a cached result tree or an
//! entity) plus a storage-key path inside that owner. Patches are applied
//! directly to the base store for confirmed writes, and replayed at read time
//! for optimistic layers.

use serde_json::Value;

use opti_types::{EntityKey, Fields, ListPosition, Node, QuerySignature};

use crate::error::{CacheError, CacheResult};

/// What a patch location is rooted at.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Tree(QuerySignature),
    Entity(EntityKey),
}

/// A field inside an owner. `keys` is never empty: the first key is the
/// owner's field, the rest descend through embedded objects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub owner: Owner,
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PatchOp {
    /// Insert into the list at the location. A reference already present in
    /// the list is not inserted again.
    Insert { node: Node, position: ListPosition },
    /// Overwrite the value at the location.
    Replace(Node),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TreePatch {
    pub location: Location,
    pub op: PatchOp,
}

impl TreePatch {
    /// Apply to the owner's field map. Returns `true` if anything changed.
    ///
    /// A missing field is left alone. Inserting into a field that holds
    /// neither a list of nodes nor a list of plain values is an error.
    pub fn apply(&self, fields: &mut Fields) -> CacheResult<bool> {
        let Some((last, parents)) = self.location.keys.split_last() else {
            return Ok(false);
        };
        let mut current = fields;
        for key in parents {
            match current.get_mut(key) {
                Some(Node::Object(inner)) => current = inner,
                _ => return Ok(false),
            }
        }
        match &self.op {
            PatchOp::Insert { node, position } => {
                let Some(target) = current.get_mut(last) else {
                    return Ok(false);
                };
                match target {
                    Node::List(list) => {
                        // Only references are deduplicated; repeated values are distinct events.
                        if matches!(node, Node::Ref(_)) && list.contains(node) {
                            return Ok(false);
                        }
                        insert_at(list, *position, node.clone());
                    }
                    Node::Scalar(Value::Array(items)) => {
                        let Node::Scalar(value) = node else {
                            return Err(self.invalid("cannot insert an object into a list of plain values"));
                        };
                        insert_at(items, *position, value.clone());
                    }
                    _ => return Err(self.invalid("not a list")),
                }
                Ok(true)
            }
            PatchOp::Replace(node) => Ok(current.insert(last.clone(), node.clone()).as_ref() != Some(node)),
        }
    }

    fn invalid(&self, reason: &str) -> CacheError {
        CacheError::InvalidPath {
            path: self.location.keys.join("."),
            reason: reason.to_string(),
        }
    }

    /// Entity keys the patch would introduce.
    pub fn references(&self) -> Vec<EntityKey> {
        let mut out = Vec::new();
        match &self.op {
            PatchOp::Insert { node, .. } | PatchOp::Replace(node) => node.collect_refs(&mut out),
        }
        out
    }

    pub fn repoint(&mut self, from: &EntityKey, to: &EntityKey) {
        if self.location.owner == Owner::Entity(from.clone()) {
            self.location.owner = Owner::Entity(to.clone());
        }
        match &mut self.op {
            PatchOp::Insert { node, .. } | PatchOp::Replace(node) => {
                node.repoint(from, to);
            }
        }
    }
}

fn insert_at<T>(list: &mut Vec<T>, position: ListPosition, item: T) {
    match position {
        ListPosition::Start => list.insert(0, item),
        ListPosition::End => list.push(item),
    }
}
