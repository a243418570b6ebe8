//! Execution Statistics
//!
//! Two kinds of statistics flow through the engine:
//!
//! - Function invocation costs, recorded by calculation nodes after every
//!   job item and read back by the partitioner to estimate fragment cost.
//! - Graph execution totals, recorded by the execution plan for every job
//!   and every completed graph.
//!
//! Both stores are handed to their users explicitly; there is no
//! process-wide statistics registry.

use std::time::Duration;

use dashmap::DashMap;

use crate::graph::FunctionId;

/// Cost assumed for a function that has never been observed: one
/// millisecond, in nanoseconds like every other cost estimate.
pub const DEFAULT_INVOCATION_COST: f64 = 1_000_000.0;

/// Weight of a new sample once a function has this many samples.
const MIN_SAMPLE_WEIGHT: f64 = 0.05;

/// Receives per-invocation timings from calculation nodes.
pub trait FunctionInvocationStatisticsGatherer: Send + Sync {
    /// Record `invocations` calls of `function` taking `execution_nanos` in total.
    fn function_invoked(
        &self,
        calc_config: &str,
        function: &FunctionId,
        invocations: u32,
        execution_nanos: f64,
    );
}

/// Decaying average cost of one function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FunctionInvocationStatistics {
    /// Average nanoseconds per invocation.
    invocation_cost: f64,

    /// Number of invocations observed.
    samples: u64,
}

impl FunctionInvocationStatistics {
    pub fn invocation_cost(&self) -> f64 {
        self.invocation_cost
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    fn record(&mut self, invocations: u32, execution_nanos: f64) {
        if invocations == 0 {
            return;
        }
        let sample = execution_nanos / f64::from(invocations);
        if self.samples == 0 {
            self.invocation_cost = sample;
        } else {
            // Plain average while young, then an exponential decay so the
            // estimate follows functions whose cost drifts.
            let weight = (1.0 / (self.samples as f64 + 1.0)).max(MIN_SAMPLE_WEIGHT);
            self.invocation_cost += (sample - self.invocation_cost) * weight;
        }
        self.samples += u64::from(invocations);
    }
}

/// The cost-estimate store: average invocation cost per calculation
/// configuration and function, in nanoseconds.
#[derive(Debug)]
pub struct FunctionCosts {
    entries: DashMap<(String, FunctionId), FunctionInvocationStatistics>,
    default_cost: f64,
}

impl FunctionCosts {
    pub fn new() -> Self {
        Self::with_default_cost(DEFAULT_INVOCATION_COST)
    }

    pub fn with_default_cost(default_cost: f64) -> Self {
        Self {
            entries: DashMap::new(),
            default_cost,
        }
    }

    /// Observed statistics, if the function has been invoked.
    pub fn statistics(
        &self,
        calc_config: &str,
        function: &FunctionId,
    ) -> Option<FunctionInvocationStatistics> {
        self.entries
            .get(&(calc_config.to_string(), function.clone()))
            .map(|entry| *entry)
    }

    /// Estimated cost of one invocation.
    pub fn estimate(&self, calc_config: &str, function: &FunctionId) -> f64 {
        self.statistics(calc_config, function)
            .map(|stats| stats.invocation_cost())
            .unwrap_or(self.default_cost)
    }

    /// Seed an estimate, replacing anything observed so far.
    pub fn set_estimate(&self, calc_config: &str, function: &FunctionId, invocation_cost: f64) {
        self.entries.insert(
            (calc_config.to_string(), function.clone()),
            FunctionInvocationStatistics {
                invocation_cost,
                samples: 1,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FunctionCosts {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionInvocationStatisticsGatherer for FunctionCosts {
    fn function_invoked(
        &self,
        calc_config: &str,
        function: &FunctionId,
        invocations: u32,
        execution_nanos: f64,
    ) {
        self.entries
            .entry((calc_config.to_string(), function.clone()))
            .or_insert(FunctionInvocationStatistics {
                invocation_cost: self.default_cost,
                samples: 0,
            })
            .record(invocations, execution_nanos);
    }
}

/// Receives graph-level statistics from the executor.
pub trait GraphExecutorStatisticsGatherer: Send + Sync {
    /// A graph was partitioned into a plan (not called on plan cache hits).
    fn graph_processed(
        &self,
        calc_config: &str,
        nodes: usize,
        jobs: usize,
        estimated_cost: f64,
        elapsed: Duration,
    );

    /// One job came back.
    fn job_executed(&self, calc_config: &str, items: usize, duration: Duration);

    /// A whole graph finished executing.
    fn graph_executed(&self, calc_config: &str, nodes: usize, jobs: usize, duration: Duration);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingGraphStatisticsGatherer;

impl GraphExecutorStatisticsGatherer for DiscardingGraphStatisticsGatherer {
    fn graph_processed(&self, _: &str, _: usize, _: usize, _: f64, _: Duration) {}

    fn job_executed(&self, _: &str, _: usize, _: Duration) {}

    fn graph_executed(&self, _: &str, _: usize, _: usize, _: Duration) {}
}

/// Running totals for one calculation configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphExecutionStatistics {
    pub processed_graphs: u64,
    pub executed_graphs: u64,
    pub executed_nodes: u64,
    pub processed_jobs: u64,
    pub executed_jobs: u64,
    pub job_items: u64,
    pub job_time: Duration,
    pub processing_time: Duration,
    pub execution_time: Duration,
    pub estimated_cost: f64,
}

impl GraphExecutionStatistics {
    /// Mean items per executed job.
    pub fn average_job_size(&self) -> f64 {
        if self.executed_jobs == 0 {
            0.0
        } else {
            self.job_items as f64 / self.executed_jobs as f64
        }
    }

    /// Mean estimated cost per planned job.
    pub fn average_job_cost(&self) -> f64 {
        if self.processed_jobs == 0 {
            0.0
        } else {
            self.estimated_cost / self.processed_jobs as f64
        }
    }

    /// Mean wall time per executed job.
    pub fn average_job_duration(&self) -> Duration {
        if self.executed_jobs == 0 {
            Duration::ZERO
        } else {
            self.job_time / self.executed_jobs as u32
        }
    }
}

/// Keeps [`GraphExecutionStatistics`] per calculation configuration.
#[derive(Debug, Default)]
pub struct TotallingGraphStatisticsGatherer {
    per_config: DashMap<String, GraphExecutionStatistics>,
}

impl TotallingGraphStatisticsGatherer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the totals for one configuration.
    pub fn statistics(&self, calc_config: &str) -> Option<GraphExecutionStatistics> {
        self.per_config.get(calc_config).map(|entry| entry.clone())
    }

    /// Names of every configuration seen so far, sorted.
    pub fn calc_configs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.per_config.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn reset(&self) {
        self.per_config.clear();
    }

    fn update(&self, calc_config: &str, f: impl FnOnce(&mut GraphExecutionStatistics)) {
        f(&mut self.per_config.entry(calc_config.to_string()).or_default());
    }
}

impl GraphExecutorStatisticsGatherer for TotallingGraphStatisticsGatherer {
    fn graph_processed(
        &self,
        calc_config: &str,
        _nodes: usize,
        jobs: usize,
        estimated_cost: f64,
        elapsed: Duration,
    ) {
        self.update(calc_config, |stats| {
            stats.processed_graphs += 1;
            stats.processed_jobs += jobs as u64;
            stats.estimated_cost += estimated_cost;
            stats.processing_time += elapsed;
        });
    }

    fn job_executed(&self, calc_config: &str, items: usize, duration: Duration) {
        self.update(calc_config, |stats| {
            stats.executed_jobs += 1;
            stats.job_items += items as u64;
            stats.job_time += duration;
        });
    }

    fn graph_executed(&self, calc_config: &str, nodes: usize, _jobs: usize, duration: Duration) {
        self.update(calc_config, |stats| {
            stats.executed_graphs += 1;
            stats.executed_nodes += nodes as u64;
            stats.execution_time += duration;
        });
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_function_uses_default_cost() {
        let costs = FunctionCosts::with_default_cost(3.0);
        assert_eq!(costs.estimate("Default", &FunctionId::new("pv")), 3.0);
        assert!(costs.is_empty());
    }

    #[test]
    fn first_samples_are_averaged() {
        let costs = FunctionCosts::new();
        let pv = FunctionId::new("pv");

        costs.function_invoked("Default", &pv, 1, 100.0);
        assert_eq!(costs.estimate("Default", &pv), 100.0);

        costs.function_invoked("Default", &pv, 1, 200.0);
        assert_eq!(costs.estimate("Default", &pv), 150.0);

        costs.function_invoked("Default", &pv, 2, 300.0);
        let stats = costs.statistics("Default", &pv).unwrap();
        assert_eq!(stats.samples(), 4);
        assert!(stats.invocation_cost() > 140.0 && stats.invocation_cost() < 150.0);

        // Other configurations are independent.
        assert_eq!(costs.estimate("Stressed", &pv), DEFAULT_INVOCATION_COST);
    }

    #[test]
    fn old_estimates_decay() {
        let costs = FunctionCosts::new();
        let pv = FunctionId::new("pv");
        for _ in 0..100 {
            costs.function_invoked("Default", &pv, 1, 10.0);
        }
        for _ in 0..100 {
            costs.function_invoked("Default", &pv, 1, 1000.0);
        }
        // A plain mean would sit near 505.
        assert!(costs.estimate("Default", &pv) > 900.0);
    }

    #[test]
    fn totals_per_configuration() {
        let gatherer = TotallingGraphStatisticsGatherer::new();
        gatherer.graph_processed("Default", 10, 2, 40.0, Duration::from_millis(1));
        gatherer.job_executed("Default", 6, Duration::from_millis(4));
        gatherer.job_executed("Default", 4, Duration::from_millis(2));
        gatherer.graph_executed("Default", 10, 2, Duration::from_millis(7));
        gatherer.job_executed("Other", 1, Duration::from_millis(1));

        let stats = gatherer.statistics("Default").unwrap();
        assert_eq!(stats.executed_jobs, 2);
        assert_eq!(stats.average_job_size(), 5.0);
        assert_eq!(stats.average_job_cost(), 20.0);
        assert_eq!(stats.average_job_duration(), Duration::from_millis(3));
        assert_eq!(stats.executed_nodes, 10);
        assert_eq!(gatherer.calc_configs(), vec!["Default", "Other"]);

        gatherer.reset();
        assert!(gatherer.statistics("Default").is_none());
    }
}
