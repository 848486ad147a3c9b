use std::sync::Arc;

use serde_json::Value;

use opti_types::{Document, EntityKey, ListPosition, Node, Variables};

use crate::patch::PatchOp;

/// What a [`CacheUpdate`] does at its target location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateAction {
    Insert(ListPosition),
    Replace,
}

impl UpdateAction {
    pub(crate) fn op(&self, node: Node) -> PatchOp {
        match self {
            Self::Insert(position) => PatchOp::Insert {
                node,
                position: *position,
            },
            Self::Replace => PatchOp::Replace(node),
        }
    }
}

/// Writes a root field of a written result into another cached query.
#[derive(Clone, Debug)]
pub struct CacheUpdate {
    /// The cached query to edit.
    pub target: Arc<Document>,
    pub variables: Variables,
    /// Response keys from the target's root to the edited field.
    pub path: Vec<String>,
    pub action: UpdateAction,
    /// Root response key of the written result to use; the first remote root
    /// field when `None`.
    pub source_field: Option<String>,
}

/// Provisional result of a mutation, applied as a new optimistic layer.
#[derive(Clone, Debug)]
pub struct OptimisticPatch {
    pub operation: String,
    pub document: Arc<Document>,
    pub variables: Variables,
    pub data: Value,
    pub updates: Vec<CacheUpdate>,
    /// Placeholder id minted for `data`. Applying fails with
    /// [`CacheError::PlaceholderTaken`](crate::error::CacheError::PlaceholderTaken)
    /// if another entity already uses it.
    pub placeholder: Option<i64>,
}

/// Server-confirmed result replacing an optimistic layer.
#[derive(Clone, Debug)]
pub struct Confirmation {
    pub document: Arc<Document>,
    pub variables: Variables,
    pub data: Value,
    pub updates: Vec<CacheUpdate>,
}

/// A confirmed entity overwrote fields that another operation had written
/// after the mutation was submitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconciliationConflict {
    pub key: EntityKey,
    pub fields: Vec<String>,
}

/// What settling a layer changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SettleReport {
    /// Placeholder keys and the confirmed keys they were repointed to.
    pub repointed: Vec<(EntityKey, EntityKey)>,
    pub conflicts: Vec<ReconciliationConflict>,
}
