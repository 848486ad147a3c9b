//! Selection-guided normalization of response data.
//!
//! Every object carrying both a `__typename` and an `id` becomes an entity;
//! its position in the tree is replaced by a [`Node::Ref`]. Objects without an
//! identity stay embedded as [`Node::Object`]. Local-only root fields are
//! skipped; they live in local state.

use serde_json::{Map, Value};

use opti_types::{EntityId, EntityKey, Field, Fields, Node, Variables, TYPENAME_FIELD};

use crate::error::{CacheError, CacheResult};

/// Output of normalizing one response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Normalized {
    /// Root fields keyed by storage key.
    pub root: Fields,
    /// Extracted entities in encounter order. A key may repeat; later
    /// occurrences merge over earlier ones.
    pub entities: Vec<(EntityKey, Fields)>,
}

impl Normalized {
    /// Node produced for the root field with the given response key, or the
    /// first root field when `response_key` is `None`.
    pub fn root_node(&self, selection: &[Field], variables: &Variables, response_key: Option<&str>) -> Option<&Node> {
        let field = match response_key {
            Some(key) => selection.iter().find(|f| f.response_key() == key)?,
            None => selection.iter().find(|f| !f.is_local())?,
        };
        self.root.get(&field.storage_key(variables))
    }
}

pub fn normalize(
    selection: &[Field],
    data: &Map<String, Value>,
    variables: &Variables,
) -> CacheResult<Normalized> {
    let mut out = Normalized::default();
    let mut root = Fields::new();
    for field in selection.iter().filter(|f| !f.is_local()) {
        let Some(value) = data.get(field.response_key()) else {
            continue;
        };
        let path = field.response_key().to_string();
        let node = normalize_value(field, value, variables, &path, &mut out.entities)?;
        root.insert(field.storage_key(variables), node);
    }
    out.root = root;
    Ok(out)
}

fn normalize_value(
    field: &Field,
    value: &Value,
    variables: &Variables,
    path: &str,
    entities: &mut Vec<(EntityKey, Fields)>,
) -> CacheResult<Node> {
    if field.is_leaf() {
        return Ok(Node::Scalar(value.clone()));
    }
    match value {
        Value::Null => Ok(Node::Scalar(Value::Null)),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| normalize_value(field, item, variables, &format!("{path}.{i}"), entities))
            .collect::<CacheResult<Vec<_>>>()
            .map(Node::List),
        Value::Object(object) => normalize_object(&field.selection_set, object, variables, path, entities),
        other => Err(CacheError::Shape {
            path: path.to_string(),
            reason: format!("expected object for selection set, found {other}"),
        }),
    }
}

fn normalize_object(
    selection: &[Field],
    object: &Map<String, Value>,
    variables: &Variables,
    path: &str,
    entities: &mut Vec<(EntityKey, Fields)>,
) -> CacheResult<Node> {
    let mut fields = Fields::new();
    if let Some(typename) = object.get(TYPENAME_FIELD) {
        fields.insert(TYPENAME_FIELD.to_string(), Node::Scalar(typename.clone()));
    }
    for sub in selection {
        let Some(value) = object.get(sub.response_key()) else {
            continue;
        };
        let sub_path = format!("{path}.{}", sub.response_key());
        let node = normalize_value(sub, value, variables, &sub_path, entities)?;
        fields.insert(sub.storage_key(variables), node);
    }

    match identify(selection, object) {
        Some(key) => {
            entities.push((key.clone(), fields));
            Ok(Node::Ref(key))
        }
        None => Ok(Node::Object(fields)),
    }
}

/// Entity key of a response object, if it carries both typename and id.
pub fn identify(selection: &[Field], object: &Map<String, Value>) -> Option<EntityKey> {
    let typename = object.get(TYPENAME_FIELD)?.as_str()?;
    let id_key = selection
        .iter()
        .find(|f| f.name == "id")
        .map(Field::response_key)
        .unwrap_or("id");
    let id = EntityId::from_value(object.get(id_key)?)?;
    Some(EntityKey::new(typename, id))
}
