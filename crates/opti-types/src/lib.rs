//! Foundation types for Opti, a client-side GraphQL data layer.
//!
//! Every other Opti crate depends on `opti-types`.
//!
//! # Key Types
//!
//! - [`Document`] -- A parsed executable operation with its [`DocumentId`]
//! - [`Operation`] -- Document plus variables and outgoing request context
//! - [`EntityKey`] -- `(typename, id)` identity of a normalized entity
//! - [`Node`] -- Stored value: scalar, entity reference, list or embedded object
//! - [`ResultTree`] / [`QuerySignature`] -- Normalized query results and their identity
//! - [`GraphqlResponse`] / [`GraphqlError`] -- Wire response shapes
//! - [`UpdateStrategy`], [`OptimisticStrategy`], [`MergeStrategy`] -- Named cache strategies

pub mod document;
pub mod entity;
pub mod error;
pub mod lexer;
pub mod operation;
pub mod response;
pub mod strategy;
pub mod tree;

pub use document::{
    Directive, Document, DocumentId, Field, InputValue, OperationKind, VariableDefinition,
    CLIENT_DIRECTIVE, TYPENAME_FIELD,
};
pub use entity::{EntityId, EntityKey, Fields, Node};
pub use error::{DocumentError, TypeError};
pub use operation::{Operation, OperationContext, Variables};
pub use response::{ErrorLocation, GraphqlError, GraphqlResponse, PathSegment};
pub use strategy::{ListPosition, MergeStrategy, OptimisticStrategy, QueryRef, UpdateStrategy};
pub use tree::{QuerySignature, ResultTree};
