use serde_json::Value;
use tokio::sync::watch;

use opti_types::{Document, EntityKey, Field, Fields, QuerySignature, ResultTree, Variables};

use crate::entity::WriteMode;
use crate::error::CacheResult;
use crate::optimistic::LayerId;
use crate::read::ReadOutcome;
use crate::update::{CacheUpdate, Confirmation, OptimisticPatch, SettleReport};

/// Normalized cache shared by every operation of a client.
///
/// All implementations must satisfy these invariants:
/// - Every write path is serialized; readers see a consistent snapshot.
/// - Every entity key referenced from a result tree, an entity or an
///   optimistic layer is present in the store or in a layer.
/// - Optimistic layers are removed exactly once, by `settle` or `rollback`.
/// - With every layer removed, reads equal reads of the base store alone.
pub trait NormalizedStore: Send + Sync {
    /// Normalize a response and write it to the base store.
    ///
    /// Query results are also stored as a result tree under their signature.
    fn write(&self, document: &Document, variables: &Variables, data: &Value, mode: WriteMode) -> CacheResult<()>;

    /// Write a response and apply `updates` to other cached queries in the
    /// same atomic step.
    ///
    /// If any update target is invalid (a bad path, or an insert into a
    /// field that is not a list) nothing is written.
    fn write_with_updates(
        &self,
        document: &Document,
        variables: &Variables,
        data: &Value,
        updates: &[CacheUpdate],
    ) -> CacheResult<()>;

    /// Normalized tree cached under `signature`, seen through every layer.
    fn read(&self, signature: &QuerySignature) -> Option<ResultTree>;

    /// Entity a single-root-field query redirects to, if it is present.
    fn read_redirect(&self, document: &Document, variables: &Variables) -> Option<EntityKey>;

    /// Denormalize a query's data through every layer.
    fn materialize(&self, document: &Document, variables: &Variables) -> CacheResult<ReadOutcome>;

    /// Entity fields seen through every layer.
    fn entity(&self, key: &EntityKey) -> Option<Fields>;

    fn apply_optimistic(&self, patch: OptimisticPatch) -> CacheResult<LayerId>;

    /// Remove a layer and write the confirmed result in one step, repointing
    /// placeholder references to the confirmed keys.
    fn settle(&self, layer: LayerId, confirmation: Confirmation) -> CacheResult<SettleReport>;

    /// Remove a layer without writing anything to the base store.
    fn rollback(&self, layer: LayerId) -> CacheResult<()>;

    /// A negative id not used by any stored or provisional entity.
    fn mint_placeholder_id(&self) -> i64;

    fn read_local(&self, field: &Field) -> CacheResult<Value>;

    fn write_local(&self, name: &str, value: Value);

    /// Receiver whose value increments after every committed change.
    fn changes(&self) -> watch::Receiver<u64>;
}
