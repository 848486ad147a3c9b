//! Local-resolver stage: answers `@client` fields from local state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use opti_store::NormalizedStore;
use opti_types::{Field, GraphqlResponse, Operation, OperationKind, Variables, TYPENAME_FIELD};

use crate::error::{LinkError, LinkResult};
use crate::link::{Link, Next, ResponseStream};

/// A named local mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalResolver {
    /// Write `{ __typename, <arguments...> }` into the local root field
    /// `target`, merging with what is there.
    SetObject {
        target: String,
        typename: String,
        arguments: Vec<String>,
    },
}

impl LocalResolver {
    fn apply(&self, field: &Field, variables: &Variables, store: &dyn NormalizedStore) -> Value {
        match self {
            Self::SetObject {
                target,
                typename,
                arguments,
            } => {
                let supplied = field.resolved_arguments(variables);
                let mut object = Map::new();
                object.insert(TYPENAME_FIELD.to_string(), Value::String(typename.clone()));
                for name in arguments {
                    let value = supplied.get(name).cloned().unwrap_or(Value::Null);
                    object.insert(name.clone(), value);
                }
                store.write_local(target, Value::Object(object));
                Value::Null
            }
        }
    }
}

/// Local resolvers keyed by the mutation field they answer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalResolverTable {
    resolvers: HashMap<String, LocalResolver>,
}

impl LocalResolverTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(mut self, field: impl Into<String>, resolver: LocalResolver) -> Self {
        self.resolvers.insert(field.into(), resolver);
        self
    }

    pub fn get(&self, field: &str) -> Option<&LocalResolver> {
        self.resolvers.get(field)
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

/// Resolves `@client` root fields against the store's local state.
///
/// Operations without local fields pass through untouched. Local-only
/// operations never reach the transport. Mixed operations forward only
/// their remote fields and have the local values merged into every
/// response on the way back.
pub struct LocalStateLink {
    store: Arc<dyn NormalizedStore>,
    resolvers: LocalResolverTable,
}

impl LocalStateLink {
    pub fn new(store: Arc<dyn NormalizedStore>, resolvers: LocalResolverTable) -> Self {
        Self { store, resolvers }
    }

    fn resolve(&self, operation: &Operation) -> LinkResult<Map<String, Value>> {
        let mut resolved = Map::new();
        for field in operation.document().local_fields() {
            let value = match operation.kind() {
                OperationKind::Mutation => {
                    let resolver = self.resolvers.get(&field.name).ok_or_else(|| {
                        LinkError::LocalResolver(format!("no local resolver for `{}`", field.name))
                    })?;
                    resolver.apply(field, operation.variables(), self.store.as_ref())
                }
                OperationKind::Query | OperationKind::Subscription => self
                    .store
                    .read_local(field)
                    .map_err(|e| LinkError::LocalResolver(e.to_string()))?,
            };
            resolved.insert(field.response_key().to_string(), value);
        }
        Ok(resolved)
    }
}

#[async_trait]
impl Link for LocalStateLink {
    fn name(&self) -> &str {
        "local"
    }

    async fn request(&self, operation: Operation, next: Next<'_>) -> LinkResult<ResponseStream> {
        if !operation.document().has_local_fields() {
            return next.run(operation).await;
        }

        let local = self.resolve(&operation)?;

        let Some(remote) = operation.document().without_local_fields() else {
            debug!(operation = %operation.name(), fields = local.len(), "answered locally");
            let response = GraphqlResponse::data(Value::Object(local));
            return Ok(stream::once(async move { Ok(response) }).boxed());
        };

        debug!(
            operation = %operation.name(),
            local = local.len(),
            remote = remote.selection_set().len(),
            "forwarding remote fields"
        );
        let responses = next.run(operation.with_document(Arc::new(remote))).await?;
        Ok(responses
            .map(move |item| item.map(|response| recombine(response, &local)))
            .boxed())
    }
}

fn recombine(mut response: GraphqlResponse, local: &Map<String, Value>) -> GraphqlResponse {
    match &mut response.data {
        Some(Value::Object(data)) => {
            for (key, value) in local {
                data.insert(key.clone(), value.clone());
            }
        }
        None if response.errors.is_empty() => {
            response.data = Some(Value::Object(local.clone()));
        }
        _ => {}
    }
    response
}
