//! Computation Caches
//!
//! Where computed values live while a cycle executes.
//!
//! # Overview
//!
//! - [`ViewComputationCache`] holds shared values for one (cycle, calc config)
//!   pair. Every worker executing that graph sees the same cache; external
//!   inputs such as market data are written into it before execution.
//! - [`ComputationCacheSource`] hands out those caches and releases them
//!   once a cycle is no longer needed.
//! - Private values never reach either: a calculation node keeps them in a
//!   job-local store chosen by the job's [`CacheSelectHint`].
//!
//! A value that could not be computed is stored as a [`MissingOutput`]
//! marker rather than left absent, so consumers can tell "failed upstream"
//! apart from "never provided".

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::job::CycleId;
use crate::exec::CacheSelectHint;
use crate::graph::ValueSpecification;

/// Why a value is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MissingOutput {
    /// The producing function failed or did not produce the value.
    EvaluationError,

    /// The producing function was skipped for lack of inputs.
    MissingInputs,

    /// The value was withheld deliberately.
    Suppressed,
}

impl fmt::Display for MissingOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EvaluationError => f.write_str("evaluation error"),
            Self::MissingInputs => f.write_str("missing inputs"),
            Self::Suppressed => f.write_str("suppressed"),
        }
    }
}

/// A cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheValue {
    Value(serde_json::Value),
    Missing(MissingOutput),
}

impl CacheValue {
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Missing(_) => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing(_))
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

/// A value paired with the specification it satisfies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    specification: ValueSpecification,
    value: CacheValue,
}

impl ComputedValue {
    pub fn new(specification: ValueSpecification, value: impl Into<CacheValue>) -> Self {
        Self {
            specification,
            value: value.into(),
        }
    }

    pub fn missing(specification: ValueSpecification, reason: MissingOutput) -> Self {
        Self {
            specification,
            value: CacheValue::Missing(reason),
        }
    }

    pub fn specification(&self) -> &ValueSpecification {
        &self.specification
    }

    pub fn value(&self) -> &CacheValue {
        &self.value
    }

    pub fn into_parts(self) -> (ValueSpecification, CacheValue) {
        (self.specification, self.value)
    }
}

/// Shared values for one graph execution.
pub trait ViewComputationCache: Send + Sync {
    fn get_value(&self, specification: &ValueSpecification) -> Option<CacheValue>;

    fn put_shared_value(&self, value: ComputedValue);

    /// Number of values held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of [`ViewComputationCache`]s, one per (cycle, calc config).
pub trait ComputationCacheSource: Send + Sync {
    fn cache(&self, cycle_id: CycleId, calc_config: &str) -> Arc<dyn ViewComputationCache>;

    /// Drop every cache of `cycle_id`.
    fn release_caches(&self, cycle_id: CycleId);
}

/// A concurrent map standing in for the shared value store.
#[derive(Debug, Default)]
pub struct InMemoryViewComputationCache {
    values: DashMap<ValueSpecification, CacheValue>,
}

impl InMemoryViewComputationCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ViewComputationCache for InMemoryViewComputationCache {
    fn get_value(&self, specification: &ValueSpecification) -> Option<CacheValue> {
        self.values.get(specification).map(|entry| entry.clone())
    }

    fn put_shared_value(&self, value: ComputedValue) {
        let (specification, value) = value.into_parts();
        self.values.insert(specification, value);
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

/// Hands out [`InMemoryViewComputationCache`]s.
#[derive(Debug, Default)]
pub struct InMemoryComputationCacheSource {
    caches: DashMap<(CycleId, String), Arc<InMemoryViewComputationCache>>,
}

impl InMemoryComputationCacheSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live caches across all cycles.
    pub fn cache_count(&self) -> usize {
        self.caches.len()
    }
}

impl ComputationCacheSource for InMemoryComputationCacheSource {
    fn cache(&self, cycle_id: CycleId, calc_config: &str) -> Arc<dyn ViewComputationCache> {
        self.caches
            .entry((cycle_id, calc_config.to_string()))
            .or_default()
            .clone()
    }

    fn release_caches(&self, cycle_id: CycleId) {
        self.caches.retain(|(cycle, _), _| *cycle != cycle_id);
    }
}

/// Routes reads and writes of one job between its private store and the
/// shared cache.
pub(crate) struct JobValueStore<'a> {
    shared: &'a dyn ViewComputationCache,
    hint: &'a CacheSelectHint,
    private: HashMap<ValueSpecification, CacheValue>,
    shared_writes: usize,
}

impl<'a> JobValueStore<'a> {
    pub(crate) fn new(shared: &'a dyn ViewComputationCache, hint: &'a CacheSelectHint) -> Self {
        Self {
            shared,
            hint,
            private: HashMap::new(),
            shared_writes: 0,
        }
    }

    pub(crate) fn get(&self, specification: &ValueSpecification) -> Option<CacheValue> {
        if self.hint.is_private_value(specification) {
            self.private.get(specification).cloned()
        } else {
            self.shared.get_value(specification)
        }
    }

    pub(crate) fn put(&mut self, value: ComputedValue) {
        if self.hint.is_private_value(value.specification()) {
            let (specification, value) = value.into_parts();
            self.private.insert(specification, value);
        } else {
            self.shared_writes += 1;
            self.shared.put_shared_value(value);
        }
    }

    pub(crate) fn private_count(&self) -> usize {
        self.private.len()
    }

    pub(crate) fn shared_writes(&self) -> usize {
        self.shared_writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, "T")
    }

    #[test]
    fn caches_are_per_cycle_and_config() {
        let source = InMemoryComputationCacheSource::new();
        let cycle = CycleId::from(1);
        source
            .cache(cycle, "Default")
            .put_shared_value(ComputedValue::new(spec("a"), json!(1.0)));

        assert_eq!(
            source.cache(cycle, "Default").get_value(&spec("a")),
            Some(CacheValue::Value(json!(1.0)))
        );
        assert!(source.cache(cycle, "Stressed").get_value(&spec("a")).is_none());
        assert!(source.cache(CycleId::from(2), "Default").is_empty());
        assert_eq!(source.cache_count(), 3);

        source.release_caches(cycle);
        assert_eq!(source.cache_count(), 1);
    }

    #[test]
    fn job_store_keeps_private_values_local() {
        let shared = InMemoryViewComputationCache::new();
        let hint = CacheSelectHint::private_values([spec("p")]);
        let mut store = JobValueStore::new(&shared, &hint);

        store.put(ComputedValue::new(spec("p"), json!(1)));
        store.put(ComputedValue::missing(spec("s"), MissingOutput::EvaluationError));

        assert_eq!(store.get(&spec("p")), Some(CacheValue::Value(json!(1))));
        assert!(shared.get_value(&spec("p")).is_none());
        assert_eq!(
            shared.get_value(&spec("s")),
            Some(CacheValue::Missing(MissingOutput::EvaluationError))
        );
        assert_eq!(store.private_count(), 1);
        assert_eq!(store.shared_writes(), 1);
    }
}
