use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TypeError;

/// Server-assigned or placeholder identifier of an entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Str(String),
}

impl EntityId {
    /// Read an id from a JSON value. Only integers and strings qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Str(s) => Value::String(s.clone()),
        }
    }

    /// Negative integer ids are minted locally for optimistic entities.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Int(i) if *i < 0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// Identity of a normalized entity: `(typename, id)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub typename: String,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(typename: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            typename: typename.into(),
            id: id.into(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.id.is_placeholder()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.typename, self.id)
    }
}

impl FromStr for EntityKey {
    type Err = TypeError;

    /// Parse `Typename:id`. Ids that parse as integers become [`EntityId::Int`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (typename, id) = s
            .split_once(':')
            .filter(|(t, i)| !t.is_empty() && !i.is_empty())
            .ok_or_else(|| TypeError::InvalidEntityKey(s.to_string()))?;
        let id = id
            .parse::<i64>()
            .map(EntityId::Int)
            .unwrap_or_else(|_| EntityId::Str(id.to_string()));
        Ok(Self::new(typename, id))
    }
}

/// Field values of an entity or result tree, keyed by storage key.
pub type Fields = BTreeMap<String, Node>;

/// A stored value: either a scalar, a reference into the entity store, or a
/// structure made of those.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Scalar(Value),
    Ref(EntityKey),
    List(Vec<Node>),
    /// An embedded object without its own identity.
    Object(Fields),
}

impl Node {
    pub fn as_ref_key(&self) -> Option<&EntityKey> {
        match self {
            Self::Ref(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Node>> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Append every entity key reachable from this node.
    pub fn collect_refs(&self, out: &mut Vec<EntityKey>) {
        match self {
            Self::Scalar(_) => {}
            Self::Ref(key) => out.push(key.clone()),
            Self::List(items) => items.iter().for_each(|n| n.collect_refs(out)),
            Self::Object(fields) => fields.values().for_each(|n| n.collect_refs(out)),
        }
    }

    /// Rewrite references to `from` so they point at `to`. Returns whether
    /// anything changed.
    pub fn repoint(&mut self, from: &EntityKey, to: &EntityKey) -> bool {
        match self {
            Self::Scalar(_) => false,
            Self::Ref(key) => {
                if key == from {
                    *key = to.clone();
                    true
                } else {
                    false
                }
            }
            Self::List(items) => items
                .iter_mut()
                .fold(false, |changed, n| n.repoint(from, to) | changed),
            Self::Object(fields) => repoint_fields(fields, from, to),
        }
    }
}

/// [`Node::repoint`] over every value of a field map.
pub fn repoint_fields(fields: &mut Fields, from: &EntityKey, to: &EntityKey) -> bool {
    fields
        .values_mut()
        .fold(false, |changed, n| n.repoint(from, to) | changed)
}
