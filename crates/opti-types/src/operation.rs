use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::document::{Document, OperationKind};
use crate::strategy::MergeStrategy;
use crate::tree::QuerySignature;

/// Variables supplied with an operation.
pub type Variables = serde_json::Map<String, Value>;

/// Outgoing request metadata carried alongside an operation.
///
/// Pipeline stages add to it (the auth stage sets `authorization`) and the
/// request/response adapter turns it into HTTP headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationContext {
    headers: BTreeMap<String, String>,
}

impl OperationContext {
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// A request against the remote graph API.
///
/// Operations are immutable once built. Stages that need a different
/// operation produce a new one with the consuming `with_*` methods.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    document: Arc<Document>,
    variables: Variables,
    context: OperationContext,
    merge: Option<MergeStrategy>,
}

impl Operation {
    /// Build an operation. Declared variable defaults are filled in for
    /// variables the caller omitted.
    pub fn new(document: Arc<Document>, variables: Variables) -> Self {
        let variables = document.effective_variables(&variables);
        Self {
            document,
            variables,
            context: OperationContext::default(),
            merge: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.document.kind()
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    pub fn merge_strategy(&self) -> Option<&MergeStrategy> {
        self.merge.as_ref()
    }

    /// Operation name, or `"anonymous"`.
    pub fn name(&self) -> &str {
        self.document.operation_name().unwrap_or("anonymous")
    }

    /// Identity of the result tree this operation reads or writes.
    pub fn signature(&self) -> QuerySignature {
        QuerySignature::new(self.document.id(), &self.variables)
    }

    /// Set a request header. Names are stored lowercase.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.context
            .headers
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Replace the document, keeping variables and context.
    pub fn with_document(mut self, document: Arc<Document>) -> Self {
        self.document = document;
        self
    }

    pub fn with_merge_strategy(mut self, merge: MergeStrategy) -> Self {
        self.merge = Some(merge);
        self
    }

    /// JSON body in the conventional `{query, variables, operationName}` shape.
    pub fn request_body(&self) -> Value {
        json!({
            "query": self.document.to_request_text(),
            "variables": Value::Object(self.variables.clone()),
            "operationName": self.document.operation_name(),
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.name())
    }
}
