//! Named cache strategies.
//!
//! Cache updates, optimistic payloads and live merges are declared as data and
//! looked up by operation name, instead of being supplied as code at each call
//! site. Paths are lists of response keys resolved against the target query's
//! selection set.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::{Document, TYPENAME_FIELD};
use crate::operation::Variables;

/// A cached query addressed by its source text and variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRef {
    pub query: String,
    #[serde(default)]
    pub variables: Variables,
}

/// How a confirmed (or provisional) mutation result updates other cached queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Push the mutation's root entity onto the end of a list.
    AppendToList { target: QueryRef, path: Vec<String> },
    /// Insert the mutation's root entity at the start of a list.
    PrependToList { target: QueryRef, path: Vec<String> },
}

impl UpdateStrategy {
    pub fn target(&self) -> &QueryRef {
        match self {
            Self::AppendToList { target, .. } | Self::PrependToList { target, .. } => target,
        }
    }

    pub fn path(&self) -> &[String] {
        match self {
            Self::AppendToList { path, .. } | Self::PrependToList { path, .. } => path,
        }
    }

    pub fn position(&self) -> ListPosition {
        match self {
            Self::AppendToList { .. } => ListPosition::End,
            Self::PrependToList { .. } => ListPosition::Start,
        }
    }
}

/// Where a list insertion lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListPosition {
    Start,
    End,
}

/// How the provisional result of a mutation is produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimisticStrategy {
    /// Echo an input-object variable back as the root entity.
    EchoInput {
        typename: String,
        input_variable: String,
    },
    /// A fixed payload in the mutation's response shape.
    Static { response: Value },
}

impl OptimisticStrategy {
    /// Build the provisional response data.
    ///
    /// Root objects that carry a `__typename` but no `id` receive
    /// `placeholder` as their id.
    pub fn payload(&self, document: &Document, variables: &Variables, placeholder: i64) -> Value {
        match self {
            Self::EchoInput {
                typename,
                input_variable,
            } => {
                let mut object = variables
                    .get(input_variable)
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                object.insert(TYPENAME_FIELD.into(), Value::String(typename.clone()));
                object.insert("id".into(), Value::from(placeholder));
                let mut data = Map::new();
                if let Some(root) = document.selection_set().first() {
                    data.insert(root.response_key().to_string(), Value::Object(object));
                }
                Value::Object(data)
            }
            Self::Static { response } => with_placeholder_ids(response.clone(), placeholder),
        }
    }
}

/// Fill missing ids on root objects of a provisional payload.
pub fn with_placeholder_ids(mut data: Value, placeholder: i64) -> Value {
    if let Some(root) = data.as_object_mut() {
        for value in root.values_mut() {
            if let Some(object) = value.as_object_mut() {
                if object.contains_key(TYPENAME_FIELD) && !object.contains_key("id") {
                    object.insert("id".into(), Value::from(placeholder));
                }
            }
        }
    }
    data
}

/// How a push event is merged into a cached query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Append the event's payload to the list at `path`.
    AppendToList {
        path: Vec<String>,
        #[serde(default)]
        event_field: Option<String>,
    },
    /// Insert the event's payload at the start of the list at `path`.
    PrependToList {
        path: Vec<String>,
        #[serde(default)]
        event_field: Option<String>,
    },
    /// Replace the value at `path` with the event's payload.
    ReplaceField {
        path: Vec<String>,
        #[serde(default)]
        event_field: Option<String>,
    },
    /// Deliver events to the subscriber without touching the target query.
    NotifyOnly,
}

impl MergeStrategy {
    /// Root field of the event data holding the payload; `None` means the
    /// first field present.
    pub fn event_field(&self) -> Option<&str> {
        match self {
            Self::AppendToList { event_field, .. }
            | Self::PrependToList { event_field, .. }
            | Self::ReplaceField { event_field, .. } => event_field.as_deref(),
            Self::NotifyOnly => None,
        }
    }

    pub fn path(&self) -> &[String] {
        match self {
            Self::AppendToList { path, .. }
            | Self::PrependToList { path, .. }
            | Self::ReplaceField { path, .. } => path,
            Self::NotifyOnly => &[],
        }
    }

    pub fn is_notify_only(&self) -> bool {
        matches!(self, Self::NotifyOnly)
    }
}
