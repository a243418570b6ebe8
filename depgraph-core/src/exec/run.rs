//! Plan Execution
//!
//! Runs an [`ExecutionPlan`] against one graph instance.
//!
//! # Overview
//!
//! Dispatch proceeds bottom-up. Every fragment has an atomic count of
//! input fragments still outstanding; a result for fragment `F` decrements
//! the count of each consumer of `F`, and whichever caller takes a count to
//! zero dispatches that consumer. Exactly one caller can observe the zero,
//! so each fragment is dispatched exactly once without a plan-wide lock.
//!
//! Tail fragments are never dispatched on their own. They travel inside
//! their predecessor's job and report their own results, which are
//! processed like any other.
//!
//! The synthetic root has the sink fragments as inputs. Taking its count to
//! zero completes the execution and resolves [`PlanExecution::wait`] with a
//! [`PopulatedGraph`].
//!
//! # State Machine
//!
//! ```text
//! Pending -> Dispatched -> Partial -> Complete
//!    \           \            \
//!     +-----------+------------+--> Cancelled | Failed
//! ```
//!
//! Terminal states are entered by compare-and-swap, so completion,
//! cancellation and job loss race cleanly: the first wins and the others
//! become no-ops. Once terminal, incoming results are ignored and nothing
//! more is dispatched.
//!
//! A job chain with no result after `job_timeout` per link is lost, which
//! fails the execution. The clock starts when a worker picks the job up if
//! the dispatcher reports that, and at dispatch otherwise. Function failures inside a job are results, not
//! failures of the execution.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::calcnode::{
    CalculationJob, CalculationJobResult, CalculationJobResultItem, CalculationJobSpecification,
    Cancelable, CycleId, JobDispatcher, JobId, JobResultReceiver,
};
use crate::error::{EngineError, EngineResult};
use crate::graph::{DependencyGraph, NodeId};

use super::plan::ExecutionPlan;
use super::stats::GraphExecutorStatisticsGatherer;

/// Default time a job may take before it is considered lost.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Set in the progress word once the execution stops accepting results.
const CLOSED: usize = 1 << (usize::BITS - 1);

/// Lifecycle of one plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PlanState {
    /// Nothing dispatched yet.
    Pending = 0,
    /// Jobs are out, no results yet.
    Dispatched = 1,
    /// Some fragments are done.
    Partial = 2,
    /// The root completed.
    Complete = 3,
    /// Cancelled before completion.
    Cancelled = 4,
    /// A job was lost.
    Failed = 5,
}

impl PlanState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Dispatched,
            2 => Self::Partial,
            3 => Self::Complete,
            4 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }
}

/// Everything a plan needs to run against one graph.
#[derive(Clone)]
pub struct ExecutionContext {
    graph: Arc<DependencyGraph>,
    dispatcher: Arc<dyn JobDispatcher>,
    cycle_id: CycleId,
    valuation_time: SystemTime,
    function_init_id: u64,
    job_timeout: Duration,
    result_queue: Option<mpsc::UnboundedSender<FragmentResult>>,
}

impl ExecutionContext {
    pub fn new(graph: Arc<DependencyGraph>, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        Self {
            graph,
            dispatcher,
            cycle_id: CycleId::new(),
            valuation_time: SystemTime::now(),
            function_init_id: 0,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            result_queue: None,
        }
    }

    pub fn with_cycle_id(mut self, cycle_id: CycleId) -> Self {
        self.cycle_id = cycle_id;
        self
    }

    pub fn with_valuation_time(mut self, valuation_time: SystemTime) -> Self {
        self.valuation_time = valuation_time;
        self
    }

    pub fn with_function_init_id(mut self, function_init_id: u64) -> Self {
        self.function_init_id = function_init_id;
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    /// Push every fragment result onto `queue` as it arrives.
    pub fn with_result_queue(mut self, queue: mpsc::UnboundedSender<FragmentResult>) -> Self {
        self.result_queue = Some(queue);
        self
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn cycle_id(&self) -> CycleId {
        self.cycle_id
    }

    pub fn valuation_time(&self) -> SystemTime {
        self.valuation_time
    }

    pub fn function_init_id(&self) -> u64 {
        self.function_init_id
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }
}

/// One fragment's result, as pushed to the result queue.
#[derive(Debug, Clone)]
pub struct FragmentResult {
    calc_config: String,
    fragment: usize,
    nodes: Vec<NodeId>,
    result: Arc<CalculationJobResult>,
}

impl FragmentResult {
    pub fn calc_config(&self) -> &str {
        &self.calc_config
    }

    /// Plan index of the fragment.
    pub fn fragment(&self) -> usize {
        self.fragment
    }

    /// Nodes evaluated, in the order of the result items.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn result(&self) -> &CalculationJobResult {
        &self.result
    }

    /// Pairs each node with its item result.
    pub fn node_results(&self) -> impl Iterator<Item = (NodeId, &CalculationJobResultItem)> {
        self.nodes.iter().copied().zip(self.result.items())
    }
}

/// A graph whose execution completed, with the outcome of every node.
#[derive(Debug)]
pub struct PopulatedGraph {
    graph: Arc<DependencyGraph>,
    results: Vec<Option<CalculationJobResultItem>>,
    job_count: usize,
    duration: Duration,
}

impl PopulatedGraph {
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn node_result(&self, node: NodeId) -> Option<&CalculationJobResultItem> {
        self.results.get(node.index()).and_then(Option::as_ref)
    }

    /// Number of nodes with a result.
    pub fn executed_node_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// Nodes whose function did not produce results.
    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.as_ref().is_some_and(|item| item.is_failed()))
            .map(|(index, _)| NodeId::from(index))
            .collect()
    }

    /// Number of job results received.
    pub fn job_count(&self) -> usize {
        self.job_count
    }

    /// Time from dispatch to completion.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Running,
    Complete(Arc<PopulatedGraph>),
    Cancelled,
    Lost { job_id: JobId, timeout: Duration },
}

impl Outcome {
    fn into_result(self) -> Option<EngineResult<Arc<PopulatedGraph>>> {
        match self {
            Self::Running => None,
            Self::Complete(graph) => Some(Ok(graph)),
            Self::Cancelled => Some(Err(EngineError::Cancelled)),
            Self::Lost { job_id, timeout } => Some(Err(EngineError::JobLost { job_id, timeout })),
        }
    }
}

/// Shared bookkeeping of one execution.
struct RunState {
    plan: Arc<ExecutionPlan>,
    context: ExecutionContext,
    statistics: Arc<dyn GraphExecutorStatisticsGatherer>,
    runtime: Handle,
    first_job: JobId,
    /// Outstanding input fragments per fragment.
    remaining: Vec<AtomicUsize>,
    results: Vec<OnceLock<Arc<CalculationJobResult>>>,
    /// Executed node count, with `CLOSED` set once results stop counting.
    progress: AtomicUsize,
    dispatched: AtomicUsize,
    state: AtomicU8,
    handles: DashMap<JobId, Box<dyn Cancelable>>,
    finished: CancellationToken,
    outcome: watch::Sender<Outcome>,
    started: Instant,
}

impl RunState {
    fn state(&self) -> PlanState {
        PlanState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn executed_nodes(&self) -> usize {
        self.progress.load(Ordering::Acquire) & !CLOSED
    }

    /// Move between non-terminal states; a no-op unless currently `from`.
    fn advance(&self, from: PlanState, to: PlanState) {
        let _ = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Enter a terminal state unless one was already entered.
    fn finish(&self, to: PlanState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!PlanState::from_u8(current).is_terminal()).then_some(to as u8)
            })
            .is_ok()
    }

    /// Count `nodes` executed, unless results are no longer accepted.
    fn accept(&self, nodes: usize) -> bool {
        self.progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current & CLOSED == 0).then_some(current + nodes)
            })
            .is_ok()
    }

    /// Stop accepting results, but only while some node is still unexecuted.
    fn close_if_incomplete(&self) -> bool {
        let total = self.plan.node_count();
        self.progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current & CLOSED == 0 && current < total).then_some(current | CLOSED)
            })
            .is_ok()
    }

    fn start(self: &Arc<Self>) {
        debug!(
            calc_config = self.plan.calc_config(),
            cycle = %self.context.cycle_id,
            fragments = self.plan.fragment_count(),
            jobs = self.plan.job_count(),
            "starting plan execution"
        );
        for &index in self.plan.entry() {
            self.dispatch(index);
        }
        if self.plan.fragments()[self.plan.root()].input_count == 0 {
            self.complete();
        }
    }

    fn build_job(&self, index: usize) -> CalculationJob {
        let fragment = &self.plan.fragments()[index];
        let specification = CalculationJobSpecification::new(
            self.context.cycle_id,
            self.plan.calc_config(),
            self.context.valuation_time,
            self.first_job.offset(index),
        );
        CalculationJob::new(
            specification,
            self.context.function_init_id,
            fragment.items.clone(),
            fragment.hint.clone(),
        )
        .with_tail(fragment.tails.iter().map(|tail| self.build_job(*tail)).collect())
    }

    fn dispatch(self: &Arc<Self>, index: usize) {
        if self.finished.is_cancelled() {
            return;
        }
        let job = self.build_job(index);
        let job_id = job.job_id();
        let chain_length = self.plan.fragments()[index].chain_length;

        self.advance(PlanState::Pending, PlanState::Dispatched);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(
            %job_id,
            fragment = index,
            items = job.items().len(),
            tails = job.tail().len(),
            "dispatching job"
        );

        let receiver: Arc<dyn JobResultReceiver> = Arc::new(PlanReceiver { run: self.clone() });
        let handle = self.context.dispatcher.dispatch_job(job, receiver);
        self.handles.insert(job_id, handle);

        // A cancel that ran between the check above and the insert missed this handle.
        if self.finished.is_cancelled() {
            if let Some((_, handle)) = self.handles.remove(&job_id) {
                handle.cancel(true);
            }
            return;
        }
        if !self.context.dispatcher.reports_job_start() {
            self.watch_job(index, job_id, chain_length);
        }
    }

    fn job_started(self: &Arc<Self>, job_id: JobId) {
        if self.finished.is_cancelled() {
            return;
        }
        let Some(index) = self.fragment_index(job_id) else {
            return;
        };
        if self.plan.fragments()[index].tail_of.is_some() {
            return;
        }
        trace!(%job_id, fragment = index, "job started");
        self.watch_job(index, job_id, self.plan.fragments()[index].chain_length);
    }

    fn watch_job(self: &Arc<Self>, index: usize, job_id: JobId, chain_length: usize) {
        let deadline = self
            .context
            .job_timeout
            .saturating_mul(u32::try_from(chain_length).unwrap_or(u32::MAX));
        let run = self.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = run.finished.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    if !run.chain_complete(index) {
                        run.fail_lost(job_id, deadline);
                    }
                }
            }
        });
    }

    fn chain_complete(&self, index: usize) -> bool {
        self.results[index].get().is_some()
            && self.plan.fragments()[index]
                .tails
                .iter()
                .all(|tail| self.chain_complete(*tail))
    }

    fn fragment_index(&self, job_id: JobId) -> Option<usize> {
        let offset = job_id.raw().checked_sub(self.first_job.raw())?;
        let index = usize::try_from(offset).ok()?;
        (index < self.plan.root()).then_some(index)
    }

    fn job_completed(self: &Arc<Self>, result: CalculationJobResult) {
        let job_id = result.job_id();
        let Some(index) = self.fragment_index(job_id) else {
            warn!(%job_id, "result for a job this execution never dispatched");
            return;
        };
        // Claim the slot before counting, so a duplicate is never counted.
        let result = Arc::new(result);
        if self.results[index].set(result.clone()).is_err() {
            warn!(%job_id, "duplicate job result");
            return;
        }
        let fragment = &self.plan.fragments()[index];
        if !self.accept(fragment.nodes.len()) {
            debug!(%job_id, state = ?self.state(), "ignoring result after execution finished");
            return;
        }
        self.advance(PlanState::Dispatched, PlanState::Partial);
        debug!(
            %job_id,
            fragment = index,
            items = result.items().len(),
            failed = result.failed_item_count(),
            duration_us = result.duration().as_micros() as u64,
            "job result received"
        );
        self.statistics.job_executed(
            self.plan.calc_config(),
            result.items().len(),
            result.duration(),
        );
        if let Some(queue) = &self.context.result_queue {
            let _ = queue.send(FragmentResult {
                calc_config: self.plan.calc_config().to_string(),
                fragment: index,
                nodes: fragment.nodes.clone(),
                result,
            });
        }

        for &dependent in &fragment.dependents {
            if self.remaining[dependent].fetch_sub(1, Ordering::AcqRel) != 1 {
                continue;
            }
            if dependent == self.plan.root() {
                self.complete();
            } else if self.plan.fragments()[dependent].tail_of.is_none() {
                self.dispatch(dependent);
            }
        }
    }

    fn populate(&self) -> PopulatedGraph {
        let mut results = vec![None; self.context.graph.size()];
        let mut job_count = 0;
        for (fragment, slot) in self.plan.fragments().iter().zip(&self.results) {
            let Some(result) = slot.get() else {
                continue;
            };
            job_count += 1;
            for (node, item) in fragment.nodes.iter().zip(result.items()) {
                if let Some(entry) = results.get_mut(node.index()) {
                    *entry = Some(item.clone());
                }
            }
        }
        PopulatedGraph {
            graph: self.context.graph.clone(),
            results,
            job_count,
            duration: self.started.elapsed(),
        }
    }

    fn complete(&self) {
        let populated = Arc::new(self.populate());
        if !self.finish(PlanState::Complete) {
            return;
        }
        self.finished.cancel();
        self.handles.clear();
        self.statistics.graph_executed(
            self.plan.calc_config(),
            self.plan.node_count(),
            populated.job_count(),
            populated.duration(),
        );
        info!(
            calc_config = self.plan.calc_config(),
            cycle = %self.context.cycle_id,
            nodes = self.plan.node_count(),
            jobs = populated.job_count(),
            failed = populated.failed_nodes().len(),
            elapsed_ms = populated.duration().as_millis() as u64,
            "graph execution complete"
        );
        self.outcome.send_replace(Outcome::Complete(populated));
    }

    fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        if !self.close_if_incomplete() {
            return false;
        }
        if !self.finish(PlanState::Cancelled) {
            return false;
        }
        self.finished.cancel();
        let abandoned = self.cancel_jobs(may_interrupt_if_running);
        info!(
            calc_config = self.plan.calc_config(),
            cycle = %self.context.cycle_id,
            executed = self.executed_nodes(),
            total = self.plan.node_count(),
            abandoned,
            "graph execution cancelled"
        );
        self.outcome.send_replace(Outcome::Cancelled);
        true
    }

    fn fail_lost(&self, job_id: JobId, timeout: Duration) {
        self.progress.fetch_or(CLOSED, Ordering::AcqRel);
        if !self.finish(PlanState::Failed) {
            return;
        }
        self.finished.cancel();
        let abandoned = self.cancel_jobs(true);
        warn!(
            calc_config = self.plan.calc_config(),
            %job_id,
            timeout_ms = timeout.as_millis() as u64,
            abandoned,
            "job lost, failing graph execution"
        );
        self.outcome.send_replace(Outcome::Lost { job_id, timeout });
    }

    /// Cancel every outstanding job; returns how many were still running.
    fn cancel_jobs(&self, may_interrupt_if_running: bool) -> usize {
        let job_ids: Vec<JobId> = self.handles.iter().map(|entry| *entry.key()).collect();
        job_ids
            .into_iter()
            .filter_map(|job_id| self.handles.remove(&job_id))
            .filter(|(_, handle)| handle.cancel(may_interrupt_if_running))
            .count()
    }
}

struct PlanReceiver {
    run: Arc<RunState>,
}

impl JobResultReceiver for PlanReceiver {
    fn result_received(&self, result: CalculationJobResult) {
        self.run.job_completed(result);
    }

    fn job_started(&self, job_id: JobId) {
        self.run.job_started(job_id);
    }
}

/// Handle to a running plan: a future of the populated graph that can be
/// waited on and cancelled from any thread.
#[derive(Clone)]
pub struct PlanExecution {
    run: Arc<RunState>,
}

impl std::fmt::Debug for PlanExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecution").finish_non_exhaustive()
    }
}

impl PlanExecution {
    pub fn state(&self) -> PlanState {
        self.run.state()
    }

    pub fn calc_config(&self) -> &str {
        self.run.plan.calc_config()
    }

    pub fn cycle_id(&self) -> CycleId {
        self.run.context.cycle_id
    }

    /// Nodes whose results have been accepted so far.
    pub fn executed_node_count(&self) -> usize {
        self.run.executed_nodes()
    }

    pub fn total_node_count(&self) -> usize {
        self.run.plan.node_count()
    }

    /// Jobs handed to the dispatcher so far, tails not counted.
    pub fn dispatched_job_count(&self) -> usize {
        self.run.dispatched.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Cancel the execution and every job still in flight. Returns `false`
    /// if it already completed, failed or was cancelled.
    pub fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        self.run.cancel(may_interrupt_if_running)
    }

    /// The outcome, if the execution is over.
    pub fn try_result(&self) -> Option<EngineResult<Arc<PopulatedGraph>>> {
        self.run.outcome.borrow().clone().into_result()
    }

    /// Wait for the execution to finish.
    pub async fn wait(&self) -> EngineResult<Arc<PopulatedGraph>> {
        let mut outcome = self.run.outcome.subscribe();
        let finished = outcome
            .wait_for(|outcome| !matches!(outcome, Outcome::Running))
            .await
            .map(|outcome| outcome.clone());
        match finished {
            Ok(outcome) => outcome.into_result().unwrap_or(Err(EngineError::Cancelled)),
            Err(_) => Err(EngineError::Cancelled),
        }
    }

    /// Wait at most `timeout`. Timing out leaves the execution running.
    pub async fn wait_timeout(&self, timeout: Duration) -> EngineResult<Arc<PopulatedGraph>> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }

    /// Block the calling thread for at most `timeout`.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an asynchronous context.
    pub fn get_blocking(&self, timeout: Duration) -> EngineResult<Arc<PopulatedGraph>> {
        self.run.runtime.block_on(self.wait_timeout(timeout))
    }
}

impl Cancelable for PlanExecution {
    fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        self.run.cancel(may_interrupt_if_running)
    }
}

impl ExecutionPlan {
    /// Start executing against `context`'s graph.
    ///
    /// The graph must be structurally identical to the one the plan was
    /// built from. Must be called from within a Tokio runtime.
    pub fn run(
        self: &Arc<Self>,
        context: ExecutionContext,
        statistics: Arc<dyn GraphExecutorStatisticsGatherer>,
    ) -> EngineResult<PlanExecution> {
        if context.graph.size() != self.node_count() {
            return Err(EngineError::PlanMismatch {
                expected: self.node_count(),
                actual: context.graph.size(),
            });
        }

        let fragment_count = self.fragments().len();
        let (outcome, _) = watch::channel(Outcome::Running);
        let run = Arc::new(RunState {
            plan: self.clone(),
            statistics,
            runtime: Handle::current(),
            first_job: JobId::allocate_block(self.root()),
            remaining: self
                .fragments()
                .iter()
                .map(|f| AtomicUsize::new(f.input_count))
                .collect(),
            results: (0..fragment_count).map(|_| OnceLock::new()).collect(),
            progress: AtomicUsize::new(0),
            dispatched: AtomicUsize::new(0),
            state: AtomicU8::new(PlanState::Pending as u8),
            handles: DashMap::new(),
            finished: CancellationToken::new(),
            outcome,
            started: Instant::now(),
            context,
        });
        run.start();
        Ok(PlanExecution { run })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
