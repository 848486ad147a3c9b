//! Normalized cache for Opti.
//!
//! Query results are stored once per entity: every response object carrying
//! a `__typename` and an `id` is extracted into the entity store, and result
//! trees keep only references to it. Mutations may stack provisional writes
//! on top of the base store as optimistic layers, which are later settled
//! with the confirmed result or rolled back.
//!
//! # Storage
//!
//! All caches implement the [`NormalizedStore`] trait:
//!
//! - [`InMemoryCache`] -- single-lock in-memory cache with change notification
//!
//! # Design Rules
//!
//! 1. Entities are owned by the entity store; everything else holds [`EntityKey`](opti_types::EntityKey)s.
//! 2. Writes merge field by field; absent fields are preserved.
//! 3. Optimistic layers are never written into the base store; they are replayed at read time.
//! 4. A layer is removed exactly once, by settle or rollback.
//! 5. Settling repoints placeholder references to the confirmed keys in the same critical section.

pub mod entity;
pub mod error;
pub mod local;
pub mod memory;
pub mod normalize;
pub mod optimistic;
pub mod patch;
pub mod read;
pub mod traits;
pub mod tree;
pub mod update;

pub use entity::{EntityStore, StoredEntity, WriteMode};
pub use error::{CacheError, CacheResult};
pub use local::LocalState;
pub use memory::InMemoryCache;
pub use normalize::{normalize, Normalized};
pub use optimistic::{LayerId, OptimisticLayer};
pub use read::ReadOutcome;
pub use traits::NormalizedStore;
pub use tree::{RedirectRule, ResultTreeCache};
pub use update::{
    CacheUpdate, Confirmation, OptimisticPatch, ReconciliationConflict, SettleReport, UpdateAction,
};
