use std::collections::{BTreeMap, HashMap};

use opti_types::entity::repoint_fields;
use opti_types::{EntityKey, Fields};

/// How incoming entity fields combine with stored ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Incoming fields overwrite, absent fields are preserved.
    #[default]
    Merge,
    /// The stored field set is replaced wholesale.
    Replace,
}

/// An entity as held by the base store.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEntity {
    pub fields: Fields,
    /// Store sequence number of the last write touching this entity.
    pub written_seq: u64,
}

/// Merge `incoming` into `target` field by field.
pub fn merge_fields(target: &mut Fields, incoming: &Fields) {
    for (key, node) in incoming {
        target.insert(key.clone(), node.clone());
    }
}

/// The base (confirmed) entity table.
#[derive(Clone, Debug, Default)]
pub struct EntityStore {
    entities: HashMap<EntityKey, StoredEntity>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&StoredEntity> {
        self.entities.get(key)
    }

    pub fn get_mut(&mut self, key: &EntityKey) -> Option<&mut StoredEntity> {
        self.entities.get_mut(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Write `fields` at `key`, stamping the entity with `seq`.
    ///
    /// Returns `true` if the stored fields changed.
    pub fn write(&mut self, key: EntityKey, fields: &Fields, mode: WriteMode, seq: u64) -> bool {
        let entry = self.entities.entry(key).or_insert_with(|| StoredEntity {
            fields: Fields::new(),
            written_seq: seq,
        });
        let before = entry.fields.clone();
        match mode {
            WriteMode::Merge => merge_fields(&mut entry.fields, fields),
            WriteMode::Replace => entry.fields = fields.clone(),
        }
        entry.written_seq = seq;
        entry.fields != before
    }

    /// Rewrite references to `from` in every entity, and move the entity
    /// itself if it is stored under `from`.
    pub fn repoint(&mut self, from: &EntityKey, to: &EntityKey) {
        if let Some(moved) = self.entities.remove(from) {
            let target = self.entities.entry(to.clone()).or_insert(StoredEntity {
                fields: Fields::new(),
                written_seq: moved.written_seq,
            });
            for (k, v) in moved.fields {
                target.fields.entry(k).or_insert(v);
            }
        }
        for entity in self.entities.values_mut() {
            repoint_fields(&mut entity.fields, from, to);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entities.keys()
    }

    /// Field contents of every entity, ordered by key, without sequence stamps.
    pub fn snapshot(&self) -> BTreeMap<EntityKey, Fields> {
        self.entities
            .iter()
            .map(|(k, e)| (k.clone(), e.fields.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opti_types::Node;
    use serde_json::json;

    fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Node::Scalar(v.clone())))
            .collect()
    }

    #[test]
    fn merge_preserves_absent_fields() {
        let mut store = EntityStore::new();
        let key = EntityKey::new("Todo", 1);
        store.write(key.clone(), &fields(&[("name", json!("a")), ("done", json!(false))]), WriteMode::Merge, 1);
        store.write(key.clone(), &fields(&[("name", json!("b"))]), WriteMode::Merge, 2);
        let stored = store.get(&key).unwrap();
        assert_eq!(stored.fields["name"], Node::Scalar(json!("b")));
        assert_eq!(stored.fields["done"], Node::Scalar(json!(false)));
        assert_eq!(stored.written_seq, 2);
    }

    #[test]
    fn replace_drops_absent_fields() {
        let mut store = EntityStore::new();
        let key = EntityKey::new("Todo", 1);
        store.write(key.clone(), &fields(&[("name", json!("a")), ("done", json!(false))]), WriteMode::Merge, 1);
        store.write(key.clone(), &fields(&[("name", json!("b"))]), WriteMode::Replace, 2);
        assert!(!store.get(&key).unwrap().fields.contains_key("done"));
    }

    #[test]
    fn identical_write_reports_no_change() {
        let mut store = EntityStore::new();
        let key = EntityKey::new("Todo", 1);
        let f = fields(&[("name", json!("a"))]);
        assert!(store.write(key.clone(), &f, WriteMode::Merge, 1));
        assert!(!store.write(key, &f, WriteMode::Merge, 2));
    }

    #[test]
    fn repoint_moves_entity_and_references() {
        let mut store = EntityStore::new();
        let placeholder = EntityKey::new("Todo", -5);
        let real = EntityKey::new("Todo", 42);
        let owner = EntityKey::new("User", 1);
        store.write(placeholder.clone(), &fields(&[("name", json!("x"))]), WriteMode::Merge, 1);
        let mut owner_fields = Fields::new();
        owner_fields.insert("todos".into(), Node::List(vec![Node::Ref(placeholder.clone())]));
        store.write(owner.clone(), &owner_fields, WriteMode::Merge, 2);

        store.repoint(&placeholder, &real);

        assert!(!store.contains(&placeholder));
        assert!(store.contains(&real));
        assert_eq!(
            store.get(&owner).unwrap().fields["todos"],
            Node::List(vec![Node::Ref(real)])
        );
    }
}
