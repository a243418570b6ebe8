//! Graph Executor
//!
//! Front door for running dependency graphs: plans a graph (or reuses a
//! cached plan), then runs the plan on a dispatcher.
//!
//! # Overview
//!
//! ```text
//! DependencyGraph --plan()--> ExecutionPlanCache --hit--> ExecutionPlan
//!                                  |miss
//!                                  v
//!                  Partitioner -> FragmentTree -> ExecutionPlan::of
//!
//! ExecutionPlan + ExecutionContext --run()--> PlanExecution
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::calcnode::{
    CalculationNode, ComputationCacheSource, CycleId, FunctionRepository, JobDispatcher,
    LocalJobDispatcher,
};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::graph::DependencyGraph;

use super::partition::Partitioner;
use super::plan::ExecutionPlan;
use super::plan_cache::{ExecutionPlanCache, PlanCacheKey};
use super::run::{ExecutionContext, PlanExecution};
use super::stats::{FunctionCosts, GraphExecutorStatisticsGatherer};

/// Plans and runs dependency graphs.
pub struct GraphExecutor {
    partitioner: Partitioner,
    plan_cache: ExecutionPlanCache,
    dispatcher: Arc<dyn JobDispatcher>,
    statistics: Arc<dyn GraphExecutorStatisticsGatherer>,
    /// Where jobs keep shared values; released per cycle.
    caches: Option<Arc<dyn ComputationCacheSource>>,
    job_timeout: Duration,
}

impl GraphExecutor {
    pub fn new(
        config: &EngineConfig,
        costs: Arc<FunctionCosts>,
        dispatcher: Arc<dyn JobDispatcher>,
        statistics: Arc<dyn GraphExecutorStatisticsGatherer>,
    ) -> Self {
        Self {
            partitioner: Partitioner::new(config.partitioner, costs),
            plan_cache: ExecutionPlanCache::new(config.plan_cache_capacity),
            dispatcher,
            statistics,
            caches: None,
            job_timeout: config.job_timeout(),
        }
    }

    /// Release `caches` through [`release_cycle`](Self::release_cycle).
    pub fn with_cache_source(mut self, caches: Arc<dyn ComputationCacheSource>) -> Self {
        self.caches = Some(caches);
        self
    }

    /// An executor running jobs in this process on the current Tokio runtime.
    ///
    /// Invocation timings feed back into `costs`, so later partitions see
    /// measured function costs.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn local(
        config: &EngineConfig,
        functions: Arc<FunctionRepository>,
        caches: Arc<dyn ComputationCacheSource>,
        costs: Arc<FunctionCosts>,
        statistics: Arc<dyn GraphExecutorStatisticsGatherer>,
    ) -> Self {
        let node = Arc::new(CalculationNode::new(
            "local",
            functions,
            caches.clone(),
            costs.clone(),
        ));
        let dispatcher = Arc::new(LocalJobDispatcher::for_current_runtime(
            node,
            config.worker_count,
        ));
        Self::new(config, costs, dispatcher, statistics).with_cache_source(caches)
    }

    /// The plan for `graph`, compiled on a cache miss.
    pub fn plan(&self, graph: &DependencyGraph, function_init_id: u64) -> Arc<ExecutionPlan> {
        let key = PlanCacheKey::new(graph, function_init_id);
        if let Some(plan) = self.plan_cache.get_by_key(&key) {
            info!(
                calc_config = graph.calc_config(),
                nodes = graph.size(),
                function_init_id,
                "using cached execution plan"
            );
            return plan;
        }

        let started = Instant::now();
        let tree = self.partitioner.partition(graph);
        let plan = Arc::new(ExecutionPlan::of(&tree, graph));
        let elapsed = started.elapsed();
        self.statistics.graph_processed(
            graph.calc_config(),
            graph.size(),
            plan.job_count(),
            plan.estimated_cost(),
            elapsed,
        );
        debug!(
            calc_config = graph.calc_config(),
            nodes = graph.size(),
            fragments = plan.fragment_count(),
            jobs = plan.job_count(),
            colours = plan.colour_count(),
            elapsed_us = elapsed.as_micros() as u64,
            "compiled execution plan"
        );
        self.plan_cache.cache_plan_by_key(key, plan.clone());
        plan
    }

    /// A context for running `graph` on this executor's dispatcher.
    pub fn context(&self, graph: Arc<DependencyGraph>) -> ExecutionContext {
        ExecutionContext::new(graph, self.dispatcher.clone()).with_job_timeout(self.job_timeout)
    }

    /// Plan `context`'s graph and start running it.
    pub fn execute(&self, context: ExecutionContext) -> EngineResult<PlanExecution> {
        let plan = self.plan(context.graph(), context.function_init_id());
        plan.run(context, self.statistics.clone())
    }

    /// Drop every value cache of `cycle_id`. A no-op without a cache source.
    pub fn release_cycle(&self, cycle_id: CycleId) {
        if let Some(caches) = &self.caches {
            debug!(cycle = %cycle_id, "releasing cycle caches");
            caches.release_caches(cycle_id);
        }
    }

    pub fn plan_cache(&self) -> &ExecutionPlanCache {
        &self.plan_cache
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    pub fn dispatcher(&self) -> &Arc<dyn JobDispatcher> {
        &self.dispatcher
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calcnode::{ComputedValue, InMemoryComputationCacheSource};
    use crate::config::PartitionerConfig;
    use crate::exec::TotallingGraphStatisticsGatherer;
    use crate::graph::ValueSpecification;
    use serde_json::json;

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, "T")
    }

    fn graph() -> Arc<DependencyGraph> {
        let mut builder = DependencyGraph::builder("Default");
        builder.add_node("one", "A", [], [spec("a")]);
        builder.add_node("double", "B", [spec("a")], [spec("b")]);
        builder.add_terminal_value(spec("b"));
        Arc::new(builder.build().unwrap())
    }

    fn executor(statistics: Arc<TotallingGraphStatisticsGatherer>) -> GraphExecutor {
        let mut functions = FunctionRepository::new();
        functions.register_fn("one", |_, outputs| {
            Ok(outputs.iter().map(|o| ComputedValue::new(o.clone(), json!(1.0))).collect())
        });
        functions.register_fn("double", |inputs, outputs| {
            let a = inputs.f64(&spec("a"))?;
            Ok(outputs.iter().map(|o| ComputedValue::new(o.clone(), json!(a * 2.0))).collect())
        });
        let config = EngineConfig {
            partitioner: PartitionerConfig::with_job_items(1, 1),
            worker_count: 2,
            ..EngineConfig::default()
        };
        GraphExecutor::local(
            &config,
            Arc::new(functions),
            Arc::new(InMemoryComputationCacheSource::new()),
            Arc::new(FunctionCosts::new()),
            statistics,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn plans_are_reused_across_graph_instances() {
        let statistics = Arc::new(TotallingGraphStatisticsGatherer::new());
        let executor = executor(statistics.clone());

        let first = executor.plan(&graph(), 0);
        let second = executor.plan(&graph(), 0);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(executor.plan_cache().hits(), 1);

        let third = executor.plan(&graph(), 1);
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(statistics.statistics("Default").unwrap().processed_graphs, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn executes_to_completion() {
        let statistics = Arc::new(TotallingGraphStatisticsGatherer::new());
        let executor = executor(statistics.clone());

        let execution = executor.execute(executor.context(graph())).unwrap();
        let populated = execution
            .wait_timeout(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(populated.executed_node_count(), 2);
        assert!(populated.failed_nodes().is_empty());
        assert_eq!(statistics.statistics("Default").unwrap().executed_graphs, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn release_cycle_drops_its_caches() {
        let caches = Arc::new(InMemoryComputationCacheSource::new());
        let config = EngineConfig::default();
        let executor = GraphExecutor::local(
            &config,
            Arc::new(FunctionRepository::new()),
            caches.clone(),
            Arc::new(FunctionCosts::new()),
            Arc::new(TotallingGraphStatisticsGatherer::new()),
        );

        let (first, second) = (CycleId::new(), CycleId::new());
        caches.cache(first, "Default");
        caches.cache(second, "Default");
        assert_eq!(caches.cache_count(), 2);

        executor.release_cycle(first);
        assert_eq!(caches.cache_count(), 1);
    }
}
