//! Result types handed back to callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use opti_store::{LayerId, ReconciliationConflict};
use opti_types::EntityKey;

use crate::error::ClientError;

/// Whether a present cache entry short-circuits the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Answer from the cache (or a redirect) when complete, otherwise fetch
    /// and write the result.
    #[default]
    CacheFirst,
    /// Answer from the cache only; a miss is [`ClientError::CacheMiss`].
    CacheOnly,
    /// Always fetch, then write the result.
    NetworkOnly,
    /// Always fetch and never write.
    NoCache,
}

impl FetchPolicy {
    pub fn reads_cache(&self) -> bool {
        matches!(self, Self::CacheFirst | Self::CacheOnly)
    }

    pub fn writes_cache(&self) -> bool {
        matches!(self, Self::CacheFirst | Self::NetworkOnly)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultSource {
    Cache,
    Network,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub data: Value,
    pub source: ResultSource,
}

/// Lifecycle of one mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationState {
    Submitted,
    OptimisticApplied,
    Confirmed,
    RolledBack,
}

impl MutationState {
    /// Whether `next` is a legal successor of this state.
    pub fn allows(self, next: MutationState) -> bool {
        use MutationState::*;
        matches!(
            (self, next),
            (Submitted, OptimisticApplied)
                | (Submitted, Confirmed)
                | (Submitted, RolledBack)
                | (OptimisticApplied, Confirmed)
                | (OptimisticApplied, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::RolledBack)
    }
}

/// A confirmed mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    /// Server data as returned.
    pub data: Value,
    /// The optimistic layer that was settled, if one was applied.
    pub layer: Option<LayerId>,
    /// Placeholder keys and the confirmed keys that replaced them.
    pub repointed: Vec<(EntityKey, EntityKey)>,
    pub conflicts: Vec<ReconciliationConflict>,
}

impl MutationResult {
    pub fn was_optimistic(&self) -> bool {
        self.layer.is_some()
    }
}

/// One observation of a watched query.
#[derive(Debug)]
pub enum QueryState {
    /// The first fetch has not completed.
    Pending,
    Ok(Value),
    Err(ClientError),
}

impl QueryState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Ok(data) => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ClientError> {
        match self {
            Self::Err(e) => Some(e),
            _ => None,
        }
    }
}
