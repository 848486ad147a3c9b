//! Strategy table: cache behaviour declared per operation name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use opti_types::{MergeStrategy, OptimisticStrategy, UpdateStrategy};

/// Strategies attached to one operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStrategies {
    /// Applied to other cached queries when a mutation result is written,
    /// both provisionally and on confirmation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<UpdateStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<OptimisticStrategy>,
    /// Used by subscriptions when the caller supplies no merge strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeStrategy>,
}

/// Named strategies keyed by operation name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyTable {
    entries: BTreeMap<String, OperationStrategies>,
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, operation: impl Into<String>, strategy: UpdateStrategy) -> Self {
        self.entries.entry(operation.into()).or_default().update.push(strategy);
        self
    }

    pub fn with_optimistic(mut self, operation: impl Into<String>, strategy: OptimisticStrategy) -> Self {
        self.entries.entry(operation.into()).or_default().optimistic = Some(strategy);
        self
    }

    pub fn with_merge(mut self, operation: impl Into<String>, strategy: MergeStrategy) -> Self {
        self.entries.entry(operation.into()).or_default().merge = Some(strategy);
        self
    }

    pub fn get(&self, operation: &str) -> Option<&OperationStrategies> {
        self.entries.get(operation)
    }

    pub fn updates(&self, operation: &str) -> &[UpdateStrategy] {
        self.get(operation).map(|s| s.update.as_slice()).unwrap_or(&[])
    }

    pub fn optimistic(&self, operation: &str) -> Option<&OptimisticStrategy> {
        self.get(operation).and_then(|s| s.optimistic.as_ref())
    }

    pub fn merge(&self, operation: &str) -> Option<&MergeStrategy> {
        self.get(operation).and_then(|s| s.merge.as_ref())
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
