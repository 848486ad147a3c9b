use opti_types::EntityKey;

use crate::optimistic::LayerId;

/// Errors from cache operations.
///
/// A cache miss is not an error: reads report it as `None` or
/// [`ReadOutcome::Miss`](crate::read::ReadOutcome::Miss).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The optimistic layer was already settled or rolled back, or never existed.
    #[error("unknown optimistic layer: {0}")]
    UnknownLayer(LayerId),

    /// A write would leave a reference to an entity that is not stored.
    #[error("dangling reference to {0}")]
    DanglingReference(EntityKey),

    /// Response data does not match the selection set that produced it.
    #[error("malformed result at {path}: {reason}")]
    Shape { path: String, reason: String },

    /// An update or merge path does not exist in the target query.
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// The placeholder id minted for an optimistic layer was claimed by
    /// another entity before the layer was applied.
    #[error("placeholder id {0} is already in use")]
    PlaceholderTaken(i64),

    /// A local-only field was requested but has never been written.
    #[error("missing local field: {0}")]
    MissingLocalField(String),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
