//! Calculation Jobs
//!
//! The unit of work sent to a calculation node, and what comes back.
//!
//! A [`CalculationJob`] is one fragment of a dependency graph: an ordered
//! list of items (function applied to target) plus the fragment's cache
//! hint. It may carry tail jobs that the same node runs straight after it,
//! each reporting its own [`CalculationJobResult`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::exec::CacheSelectHint;
use crate::graph::{DependencyNode, FunctionId, TargetSpecification, ValueSpecification};

/// Identity of one dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    /// Reserve `count` consecutive ids and return the first.
    pub fn allocate_block(count: usize) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(count.max(1) as u64, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The id `offset` places after this one.
    pub fn offset(&self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one valuation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CycleId(u64);

impl CycleId {
    /// Generate a new unique cycle ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for CycleId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Header shared by a job and its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationJobSpecification {
    cycle_id: CycleId,
    calc_config: String,
    valuation_time: SystemTime,
    job_id: JobId,
}

impl CalculationJobSpecification {
    pub fn new(
        cycle_id: CycleId,
        calc_config: impl Into<String>,
        valuation_time: SystemTime,
        job_id: JobId,
    ) -> Self {
        Self {
            cycle_id,
            calc_config: calc_config.into(),
            valuation_time,
            job_id,
        }
    }

    pub fn cycle_id(&self) -> CycleId {
        self.cycle_id
    }

    pub fn calc_config(&self) -> &str {
        &self.calc_config
    }

    pub fn valuation_time(&self) -> SystemTime {
        self.valuation_time
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// One function invocation within a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationJobItem {
    function: FunctionId,
    target: TargetSpecification,
    inputs: Vec<ValueSpecification>,
    outputs: Vec<ValueSpecification>,
}

impl CalculationJobItem {
    pub fn new(
        function: FunctionId,
        target: TargetSpecification,
        inputs: Vec<ValueSpecification>,
        outputs: Vec<ValueSpecification>,
    ) -> Self {
        Self {
            function,
            target,
            inputs,
            outputs,
        }
    }

    /// The item that evaluates `node`.
    pub fn from_node(node: &DependencyNode) -> Self {
        Self::new(
            node.function().clone(),
            node.target().clone(),
            node.input_values().to_vec(),
            node.output_values().to_vec(),
        )
    }

    pub fn function(&self) -> &FunctionId {
        &self.function
    }

    pub fn target(&self) -> &TargetSpecification {
        &self.target
    }

    pub fn inputs(&self) -> &[ValueSpecification] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueSpecification] {
        &self.outputs
    }
}

/// A dispatchable job.
#[derive(Debug, Clone)]
pub struct CalculationJob {
    specification: CalculationJobSpecification,
    function_init_id: u64,
    items: Vec<CalculationJobItem>,
    cache_select_hint: Arc<CacheSelectHint>,
    tail: Vec<CalculationJob>,
}

impl CalculationJob {
    pub fn new(
        specification: CalculationJobSpecification,
        function_init_id: u64,
        items: Vec<CalculationJobItem>,
        cache_select_hint: Arc<CacheSelectHint>,
    ) -> Self {
        Self {
            specification,
            function_init_id,
            items,
            cache_select_hint,
            tail: Vec::new(),
        }
    }

    /// Chain jobs to run on the same node after this one.
    pub fn with_tail(mut self, tail: Vec<CalculationJob>) -> Self {
        self.tail = tail;
        self
    }

    pub fn specification(&self) -> &CalculationJobSpecification {
        &self.specification
    }

    pub fn job_id(&self) -> JobId {
        self.specification.job_id
    }

    pub fn function_init_id(&self) -> u64 {
        self.function_init_id
    }

    pub fn items(&self) -> &[CalculationJobItem] {
        &self.items
    }

    pub fn cache_select_hint(&self) -> &CacheSelectHint {
        &self.cache_select_hint
    }

    pub fn tail(&self) -> &[CalculationJob] {
        &self.tail
    }

    /// This job plus every tail job below it.
    pub fn job_count(&self) -> usize {
        1 + self.tail.iter().map(CalculationJob::job_count).sum::<usize>()
    }
}

/// Outcome of one job item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvocationStatus {
    /// The function ran with all of its inputs.
    Success,

    /// The function ran without some inputs it declared it can live without.
    PartialInputs,

    /// The function was not run because inputs were absent or failed.
    MissingInputs,

    /// The function ran and returned an error.
    FunctionFailed,

    /// No function with the item's id is registered.
    FunctionNotFound,

    /// The item matched the function blacklist and was not run.
    Suppressed,
}

impl InvocationStatus {
    /// Whether the function produced results.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::PartialInputs)
    }
}

/// Result of one job item.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationJobResultItem {
    status: InvocationStatus,
    missing_inputs: Vec<ValueSpecification>,
    missing_outputs: Vec<ValueSpecification>,
    error: Option<String>,
}

impl CalculationJobResultItem {
    pub fn success() -> Self {
        Self {
            status: InvocationStatus::Success,
            missing_inputs: Vec::new(),
            missing_outputs: Vec::new(),
            error: None,
        }
    }

    pub fn partial_inputs(missing_inputs: Vec<ValueSpecification>) -> Self {
        Self {
            status: InvocationStatus::PartialInputs,
            missing_inputs,
            ..Self::success()
        }
    }

    pub fn missing_inputs(missing_inputs: Vec<ValueSpecification>) -> Self {
        Self {
            status: InvocationStatus::MissingInputs,
            missing_inputs,
            ..Self::success()
        }
    }

    pub fn function_failed(error: impl Into<String>) -> Self {
        Self {
            status: InvocationStatus::FunctionFailed,
            error: Some(error.into()),
            ..Self::success()
        }
    }

    pub fn function_not_found(function: &FunctionId) -> Self {
        Self {
            status: InvocationStatus::FunctionNotFound,
            error: Some(format!("no function registered as {function}")),
            ..Self::success()
        }
    }

    pub fn suppressed() -> Self {
        Self {
            status: InvocationStatus::Suppressed,
            ..Self::success()
        }
    }

    pub(crate) fn with_missing_outputs(mut self, missing_outputs: Vec<ValueSpecification>) -> Self {
        self.missing_outputs = missing_outputs;
        self
    }

    pub fn status(&self) -> InvocationStatus {
        self.status
    }

    /// Inputs that were absent or carried a failure marker.
    pub fn missing_input_values(&self) -> &[ValueSpecification] {
        &self.missing_inputs
    }

    /// Declared outputs the function did not produce.
    pub fn missing_output_values(&self) -> &[ValueSpecification] {
        &self.missing_outputs
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_failed(&self) -> bool {
        !self.status.is_success()
    }
}

/// Result of one job, one item result per job item in the same order.
#[derive(Debug, Clone)]
pub struct CalculationJobResult {
    specification: CalculationJobSpecification,
    items: Vec<CalculationJobResultItem>,
    duration: Duration,
    compute_node_id: String,
}

impl CalculationJobResult {
    pub fn new(
        specification: CalculationJobSpecification,
        items: Vec<CalculationJobResultItem>,
        duration: Duration,
        compute_node_id: impl Into<String>,
    ) -> Self {
        Self {
            specification,
            items,
            duration,
            compute_node_id: compute_node_id.into(),
        }
    }

    pub fn specification(&self) -> &CalculationJobSpecification {
        &self.specification
    }

    pub fn job_id(&self) -> JobId {
        self.specification.job_id
    }

    pub fn items(&self) -> &[CalculationJobResultItem] {
        &self.items
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Which calculation node produced the result.
    pub fn compute_node_id(&self) -> &str {
        &self.compute_node_id
    }

    /// Number of items that did not produce results.
    pub fn failed_item_count(&self) -> usize {
        self.items.iter().filter(|item| item.is_failed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u64) -> CalculationJob {
        CalculationJob::new(
            CalculationJobSpecification::new(
                CycleId::from(1),
                "Default",
                SystemTime::UNIX_EPOCH,
                JobId::from(id),
            ),
            0,
            Vec::new(),
            Arc::new(CacheSelectHint::all_shared()),
        )
    }

    #[test]
    fn job_id_blocks_do_not_overlap() {
        let first = JobId::allocate_block(3);
        let second = JobId::allocate_block(1);
        assert!(second.raw() >= first.offset(3).raw());
        assert_eq!(first.offset(2).raw(), first.raw() + 2);
    }

    #[test]
    fn job_count_includes_nested_tails() {
        let job = job(1).with_tail(vec![job(2).with_tail(vec![job(3)]), job(4)]);
        assert_eq!(job.job_count(), 4);
        assert_eq!(job.tail()[0].tail()[0].job_id(), JobId::from(3));
    }

    #[test]
    fn item_status_classification() {
        assert!(!CalculationJobResultItem::success().is_failed());
        assert!(!CalculationJobResultItem::partial_inputs(vec![]).is_failed());
        let failed = CalculationJobResultItem::function_failed("division by zero");
        assert!(failed.is_failed());
        assert_eq!(failed.error(), Some("division by zero"));
        let missing = CalculationJobResultItem::function_not_found(&FunctionId::new("pv"));
        assert_eq!(missing.status(), InvocationStatus::FunctionNotFound);
        assert_eq!(missing.error(), Some("no function registered as pv"));
        let suppressed = CalculationJobResultItem::suppressed();
        assert!(suppressed.is_failed());
        assert_eq!(suppressed.error(), None);
    }
}
