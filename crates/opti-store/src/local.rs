//! Client-only state backing `@client` fields.

use serde_json::{Map, Value};

use opti_types::{Field, TYPENAME_FIELD};

use crate::error::{CacheError, CacheResult};

/// Root-level local fields, e.g. `networkStatus { isConnected }`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalState {
    fields: Map<String, Value>,
}

impl LocalState {
    pub fn new(defaults: Map<String, Value>) -> Self {
        Self { fields: defaults }
    }

    /// Resolve a local root field, projected through its selection set.
    pub fn read(&self, field: &Field) -> CacheResult<Value> {
        let value = self
            .fields
            .get(&field.name)
            .ok_or_else(|| CacheError::MissingLocalField(field.name.clone()))?;
        project(field, value, &field.name)
    }

    /// Write a root field. Objects merge key by key into an existing object.
    /// Returns `true` if the state changed.
    pub fn write(&mut self, name: &str, value: Value) -> bool {
        let before = self.fields.get(name).cloned();
        let next = match (&before, value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                let mut merged = existing.clone();
                merged.extend(incoming);
                Value::Object(merged)
            }
            (_, value) => value,
        };
        let changed = before.as_ref() != Some(&next);
        self.fields.insert(name.to_string(), next);
        changed
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

fn project(field: &Field, value: &Value, path: &str) -> CacheResult<Value> {
    if field.is_leaf() {
        return Ok(value.clone());
    }
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| project(field, item, path))
            .collect::<CacheResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(object) => {
            let mut out = Map::new();
            for sub in &field.selection_set {
                let sub_path = format!("{path}.{}", sub.name);
                let child = match object.get(&sub.name) {
                    Some(child) => child,
                    None if sub.name == TYPENAME_FIELD => continue,
                    None => return Err(CacheError::MissingLocalField(sub_path)),
                };
                out.insert(sub.response_key().to_string(), project(sub, child, &sub_path)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opti_types::Document;
    use serde_json::json;

    fn network_status() -> LocalState {
        LocalState::new(
            json!({"networkStatus": {"__typename": "NetworkStatus", "isConnected": true}})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    fn field(source: &str) -> Field {
        Document::parse(source).unwrap().selection_set()[0].clone()
    }

    #[test]
    fn reads_defaults_through_selection() {
        let state = network_status();
        let value = state
            .read(&field("{ networkStatus @client { isConnected } }"))
            .unwrap();
        assert_eq!(value, json!({"isConnected": true}));
    }

    #[test]
    fn write_merges_objects() {
        let mut state = network_status();
        assert!(state.write("networkStatus", json!({"isConnected": false})));
        assert!(!state.write("networkStatus", json!({"isConnected": false})));
        assert_eq!(
            state.get("networkStatus"),
            Some(&json!({"__typename": "NetworkStatus", "isConnected": false}))
        );
    }

    #[test]
    fn missing_field_is_reported_with_path() {
        let state = network_status();
        let err = state
            .read(&field("{ networkStatus @client { latency } }"))
            .unwrap_err();
        assert!(matches!(err, CacheError::MissingLocalField(ref p) if p == "networkStatus.latency"));
        assert!(state.read(&field("{ theme @client }")).is_err());
    }
}
