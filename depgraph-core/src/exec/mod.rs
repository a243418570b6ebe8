//! Graph Execution
//!
//! Everything on the planning side of the dispatch boundary.
//!
//! # Overview
//!
//! 1. The [`Partitioner`] splits a [`DependencyGraph`](crate::graph::DependencyGraph)
//!    into a [`FragmentTree`] of job-sized fragments.
//! 2. [`ExecutionPlan::of`] freezes the tree, computing each fragment's
//!    [`CacheSelectHint`].
//! 3. [`ExecutionPlanCache`] keeps plans for reuse by structurally
//!    identical graphs.
//! 4. [`ExecutionPlan::run`] dispatches fragments bottom-up and yields a
//!    [`PlanExecution`].
//!
//! [`GraphExecutor`] wires the four together. Statistics flow back through
//! the gatherer traits in [`stats`]: function costs feed the partitioner,
//! graph totals feed whoever is watching.

mod executor;
mod fragment;
mod hints;
mod partition;
mod plan;
mod plan_cache;
mod run;
pub mod stats;

pub use executor::GraphExecutor;
pub use fragment::{FragmentId, FragmentTree, GraphFragment};
pub use hints::{calculate_cache_hint, CacheSelectHint};
pub use partition::Partitioner;
pub use plan::ExecutionPlan;
pub use plan_cache::{ExecutionPlanCache, PlanCacheKey, DEFAULT_PLAN_CACHE_CAPACITY};
pub use run::{
    ExecutionContext, FragmentResult, PlanExecution, PlanState, PopulatedGraph,
    DEFAULT_JOB_TIMEOUT,
};
pub use stats::{
    DiscardingGraphStatisticsGatherer, FunctionCosts, FunctionInvocationStatistics,
    FunctionInvocationStatisticsGatherer, GraphExecutionStatistics,
    GraphExecutorStatisticsGatherer, TotallingGraphStatisticsGatherer, DEFAULT_INVOCATION_COST,
};
