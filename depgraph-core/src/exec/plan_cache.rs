//! Execution Plan Cache
//!
//! Compiled plans keyed by graph shape and function initialization.
//!
//! Graphs are rebuilt every cycle, but from one cycle to the next they
//! usually have the same shape. Partitioning is the expensive part of
//! planning, so a plan compiled for one graph is replayed for every later
//! graph with an equal [`DependencyGraphKey`], as long as the functions
//! have not been re-initialized in between (a new `function_init_id` can
//! change costs and so the partitioning).
//!
//! # Design Decisions
//!
//! 1. Least-recently-used eviction over an insertion-ordered map: the back
//!    of the map is the most recent entry, a hit moves its entry there and
//!    an insert beyond capacity drops the front.
//!
//! 2. The key is built outside the lock. It walks the whole graph, which
//!    would otherwise serialize every planner on the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::graph::{DependencyGraph, DependencyGraphKey};

use super::plan::ExecutionPlan;

/// Default number of plans kept.
pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 64;

/// Cache lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanCacheKey {
    graph: DependencyGraphKey,
    function_init_id: u64,
}

impl PlanCacheKey {
    pub fn new(graph: &DependencyGraph, function_init_id: u64) -> Self {
        Self {
            graph: DependencyGraphKey::of(graph),
            function_init_id,
        }
    }

    pub fn graph(&self) -> &DependencyGraphKey {
        &self.graph
    }

    pub fn function_init_id(&self) -> u64 {
        self.function_init_id
    }
}

/// Bounded LRU cache of compiled plans.
#[derive(Debug)]
pub struct ExecutionPlanCache {
    capacity: usize,
    entries: Mutex<IndexMap<PlanCacheKey, Arc<ExecutionPlan>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ExecutionPlanCache {
    /// A cache holding at most `capacity` plans (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// The plan cached for `graph`, if any.
    pub fn get(&self, graph: &DependencyGraph, function_init_id: u64) -> Option<Arc<ExecutionPlan>> {
        self.get_by_key(&PlanCacheKey::new(graph, function_init_id))
    }

    pub fn get_by_key(&self, key: &PlanCacheKey) -> Option<Arc<ExecutionPlan>> {
        let mut entries = self.entries.lock();
        let Some(index) = entries.get_index_of(key) else {
            drop(entries);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let last = entries.len() - 1;
        entries.move_index(index, last);
        let plan = entries.get_index(last).map(|(_, plan)| plan.clone());
        drop(entries);
        self.hits.fetch_add(1, Ordering::Relaxed);
        plan
    }

    /// Store `plan` for `graph`, replacing any plan already there.
    pub fn cache_plan(&self, graph: &DependencyGraph, function_init_id: u64, plan: Arc<ExecutionPlan>) {
        self.cache_plan_by_key(PlanCacheKey::new(graph, function_init_id), plan);
    }

    pub fn cache_plan_by_key(&self, key: PlanCacheKey, plan: Arc<ExecutionPlan>) {
        let mut entries = self.entries.lock();
        let (index, _) = entries.insert_full(key, plan);
        let last = entries.len() - 1;
        entries.move_index(index, last);
        while entries.len() > self.capacity {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    calc_config = evicted.graph.calc_config(),
                    nodes = evicted.graph.node_count(),
                    function_init_id = evicted.function_init_id,
                    "evicted execution plan"
                );
            }
        }
    }

    /// Drop every cached plan.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl Default for ExecutionPlanCache {
    fn default() -> Self {
        Self::new(DEFAULT_PLAN_CACHE_CAPACITY)
    }
}
