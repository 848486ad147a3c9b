use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use opti_types::entity::repoint_fields;
use opti_types::{EntityKey, Fields};

use crate::entity::merge_fields;
use crate::patch::{Owner, TreePatch};

/// Identifier of an optimistic layer (UUID v7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(Uuid);

impl LayerId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer:{}", self.0)
    }
}

/// Provisional writes of one in-flight mutation.
#[derive(Clone, Debug)]
pub struct OptimisticLayer {
    pub id: LayerId,
    /// Name of the mutation that owns the layer.
    pub operation: String,
    /// Provisional root fields, used to pair placeholder keys with confirmed ones.
    pub root: Fields,
    pub entity_writes: Vec<(EntityKey, Fields)>,
    pub tree_patches: Vec<TreePatch>,
    /// Store sequence number when the layer was applied.
    pub base_seq: u64,
}

impl OptimisticLayer {
    /// Placeholder keys this layer introduced.
    pub fn placeholders(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .entity_writes
            .iter()
            .map(|(k, _)| k.clone())
            .filter(EntityKey::is_placeholder)
            .collect();
        keys.dedup();
        keys
    }

    /// Overlay this layer's writes for `key` onto `fields`.
    pub fn overlay_entity(&self, key: &EntityKey, fields: &mut Option<Fields>) {
        for (k, written) in &self.entity_writes {
            if k == key {
                merge_fields(fields.get_or_insert_with(Fields::new), written);
            }
        }
        let owner = Owner::Entity(key.clone());
        if let Some(fields) = fields {
            for patch in self.tree_patches.iter().filter(|p| p.location.owner == owner) {
                // Checked when the layer was applied.
                let _ = patch.apply(fields);
            }
        }
    }

    pub fn overlay_owner(&self, owner: &Owner, fields: &mut Fields) {
        for patch in self.tree_patches.iter().filter(|p| &p.location.owner == owner) {
            let _ = patch.apply(fields);
        }
    }

    pub fn writes_entity(&self, key: &EntityKey) -> bool {
        self.entity_writes.iter().any(|(k, _)| k == key)
    }

    pub fn repoint(&mut self, from: &EntityKey, to: &EntityKey) {
        repoint_fields(&mut self.root, from, to);
        for (key, fields) in &mut self.entity_writes {
            if key == from {
                *key = to.clone();
            }
            repoint_fields(fields, from, to);
        }
        for patch in &mut self.tree_patches {
            patch.repoint(from, to);
        }
    }
}

/// Ordered overlay of provisional writes. Later layers win.
#[derive(Clone, Debug, Default)]
pub struct OptimisticStack {
    layers: Vec<OptimisticLayer>,
}

impl OptimisticStack {
    pub fn push(&mut self, layer: OptimisticLayer) {
        self.layers.push(layer);
    }

    /// Remove a layer. `None` if it is not (or no longer) on the stack.
    pub fn remove(&mut self, id: LayerId) -> Option<OptimisticLayer> {
        let idx = self.layers.iter().position(|l| l.id == id)?;
        Some(self.layers.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptimisticLayer> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.layers.iter().any(|l| l.id == id)
    }

    pub fn repoint(&mut self, from: &EntityKey, to: &EntityKey) {
        for layer in &mut self.layers {
            layer.repoint(from, to);
        }
    }
}
