//! Cycle Runner
//!
//! A background task that runs valuation cycles one after another.
//!
//! # Overview
//!
//! Each cycle asks the [`CycleSource`] for its graphs, starts a plan
//! execution per graph and waits for all of them. Between cycles the task
//! sleeps until the [`CycleTrigger`] allows the next one, a cycle is
//! requested, or it is terminated.
//!
//! Caches of a cycle are released once the following cycle has completed,
//! so consumers can still read the latest results while the next cycle
//! runs.
//!
//! # Termination
//!
//! [`CycleRunnerHandle::terminate`] is seen while sleeping and while
//! waiting on plan results. In-flight executions are cancelled, which
//! cancels their jobs. The task gets `termination_grace_ms` to wind down
//! and is aborted after that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::calcnode::CycleId;
use crate::config::CycleConfig;
use crate::error::{EngineError, EngineResult};
use crate::exec::{GraphExecutor, PlanExecution, PopulatedGraph};
use crate::graph::DependencyGraph;

use super::trigger::{CycleEligibility, CycleTrigger};

/// What one cycle computes.
#[derive(Debug, Clone)]
pub struct CycleDefinition {
    /// Defaults to the time the cycle starts.
    pub valuation_time: Option<SystemTime>,
    pub function_init_id: u64,
    pub graphs: Vec<Arc<DependencyGraph>>,
}

/// Supplies the work for each cycle.
///
/// Called from the runner task, so implementations should not block for
/// long.
pub trait CycleSource: Send + Sync {
    /// The definition of cycle `cycle_id`, or `None` when there is nothing
    /// left to compute.
    fn next_cycle(&self, cycle_id: CycleId) -> Option<CycleDefinition>;

    /// Results of `cycle_id` are no longer needed.
    fn release_cycle(&self, _cycle_id: CycleId) {}
}

/// Results of one completed cycle.
#[derive(Debug)]
pub struct CycleResult {
    pub cycle_id: CycleId,
    pub valuation_time: SystemTime,
    pub graphs: Vec<Arc<PopulatedGraph>>,
    pub duration: Duration,
}

/// Progress notifications from the runner.
#[derive(Debug, Clone)]
pub enum CycleEvent {
    Started {
        cycle_id: CycleId,
        valuation_time: SystemTime,
    },
    Completed(Arc<CycleResult>),
    Failed {
        cycle_id: CycleId,
        error: String,
    },
    /// The source ran out of cycles; the runner stopped.
    ProcessCompleted,
}

/// Cycle latency totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleLatency {
    pub cycles: u64,
    pub last: Option<Duration>,
    pub total: Duration,
}

impl CycleLatency {
    pub fn average(&self) -> Option<Duration> {
        (self.cycles > 0).then(|| self.total / self.cycles as u32)
    }

    fn record(&mut self, latency: Duration) {
        self.cycles += 1;
        self.last = Some(latency);
        self.total += latency;
    }
}

struct Shared {
    token: CancellationToken,
    wake: Notify,
    cycle_requested: AtomicBool,
    force_cycle: AtomicBool,
    latency: Mutex<CycleLatency>,
}

/// Spawns the cycle loop.
pub struct CycleRunner {
    executor: Arc<GraphExecutor>,
    source: Arc<dyn CycleSource>,
    config: CycleConfig,
    events: mpsc::UnboundedSender<CycleEvent>,
    shared: Arc<Shared>,
}

impl CycleRunner {
    /// Start running cycles on the current Tokio runtime. The first cycle
    /// runs straight away.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn spawn(
        executor: Arc<GraphExecutor>,
        source: Arc<dyn CycleSource>,
        config: CycleConfig,
        events: mpsc::UnboundedSender<CycleEvent>,
    ) -> CycleRunnerHandle {
        let shared = Arc::new(Shared {
            token: CancellationToken::new(),
            wake: Notify::new(),
            cycle_requested: AtomicBool::new(true),
            force_cycle: AtomicBool::new(false),
            latency: Mutex::new(CycleLatency::default()),
        });
        let runner = Self {
            executor,
            source,
            config,
            events,
            shared: shared.clone(),
        };
        CycleRunnerHandle {
            shared,
            grace: config.termination_grace(),
            task: tokio::spawn(runner.run()),
        }
    }

    async fn run(self) {
        let mut trigger = CycleTrigger::from_config(&self.config);
        let mut previous: Option<CycleId> = None;

        while self.wait_for_next_cycle(&trigger).await {
            let cycle_id = CycleId::new();
            let Some(definition) = self.source.next_cycle(cycle_id) else {
                info!("cycle source exhausted");
                let _ = self.events.send(CycleEvent::ProcessCompleted);
                break;
            };
            trigger.cycle_triggered(Instant::now());

            match self.run_cycle(cycle_id, definition).await {
                Ok(result) => {
                    let latency = result.duration;
                    let average = {
                        let mut stats = self.shared.latency.lock();
                        stats.record(latency);
                        stats.average()
                    };
                    info!(
                        cycle = %cycle_id,
                        latency_ms = latency.as_millis() as u64,
                        average_ms = average.map_or(0, |a| a.as_millis() as u64),
                        "cycle complete"
                    );
                    let _ = self.events.send(CycleEvent::Completed(Arc::new(result)));
                    if let Some(released) = previous.replace(cycle_id) {
                        self.release_cycle(released);
                    }
                }
                Err(EngineError::Terminated) => {
                    self.release_cycle(cycle_id);
                    break;
                }
                Err(err) => {
                    warn!(cycle = %cycle_id, error = %err, "cycle failed");
                    let _ = self.events.send(CycleEvent::Failed {
                        cycle_id,
                        error: err.to_string(),
                    });
                    self.release_cycle(cycle_id);
                }
            }
        }

        if let Some(released) = previous {
            self.release_cycle(released);
        }
        debug!("cycle runner stopped");
    }

    fn release_cycle(&self, cycle_id: CycleId) {
        self.executor.release_cycle(cycle_id);
        self.source.release_cycle(cycle_id);
    }

    /// Sleep until a cycle should run. Returns `false` once terminated.
    async fn wait_for_next_cycle(&self, trigger: &CycleTrigger) -> bool {
        loop {
            if self.shared.token.is_cancelled() {
                return false;
            }
            // notify_one leaves a permit when nobody waits, so a request made
            // after this point still wakes the select below.
            let notified = self.shared.wake.notified();

            let result = trigger.query(Instant::now());
            let eligibility = if self.shared.force_cycle.swap(false, Ordering::AcqRel) {
                debug!("cycle triggered manually");
                CycleEligibility::Force
            } else {
                result.eligibility
            };
            let requested = self.shared.cycle_requested.load(Ordering::Acquire);
            if eligibility == CycleEligibility::Force
                || (eligibility == CycleEligibility::Eligible && requested)
            {
                self.shared.cycle_requested.store(false, Ordering::Release);
                return true;
            }

            match result.next_state_change {
                Some(deadline) => {
                    debug!(
                        wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "waiting for next cycle"
                    );
                    tokio::select! {
                        _ = self.shared.token.cancelled() => return false,
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline.into()) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.shared.token.cancelled() => return false,
                        _ = notified => {}
                    }
                }
            }
        }
    }

    async fn run_cycle(
        &self,
        cycle_id: CycleId,
        definition: CycleDefinition,
    ) -> EngineResult<CycleResult> {
        let started = Instant::now();
        let valuation_time = definition.valuation_time.unwrap_or_else(SystemTime::now);
        info!(cycle = %cycle_id, graphs = definition.graphs.len(), "starting cycle");
        let _ = self.events.send(CycleEvent::Started {
            cycle_id,
            valuation_time,
        });

        let mut executions: Vec<PlanExecution> = Vec::with_capacity(definition.graphs.len());
        for graph in definition.graphs {
            let context = self
                .executor
                .context(graph)
                .with_cycle_id(cycle_id)
                .with_valuation_time(valuation_time)
                .with_function_init_id(definition.function_init_id);
            match self.executor.execute(context) {
                Ok(execution) => executions.push(execution),
                Err(err) => {
                    cancel_all(&executions);
                    return Err(err);
                }
            }
        }

        let mut graphs = Vec::with_capacity(executions.len());
        for execution in &executions {
            let outcome = tokio::select! {
                _ = self.shared.token.cancelled() => {
                    let cancelled = cancel_all(&executions);
                    warn!(cycle = %cycle_id, cancelled, "terminated with graph executions in flight");
                    return Err(EngineError::Terminated);
                }
                outcome = execution.wait() => outcome,
            };
            match outcome {
                Ok(graph) => graphs.push(graph),
                Err(err) => {
                    cancel_all(&executions);
                    return Err(err);
                }
            }
        }

        Ok(CycleResult {
            cycle_id,
            valuation_time,
            graphs,
            duration: started.elapsed(),
        })
    }
}

fn cancel_all(executions: &[PlanExecution]) -> usize {
    executions
        .iter()
        .filter(|execution| execution.cancel(true))
        .count()
}

/// Controls a spawned [`CycleRunner`].
pub struct CycleRunnerHandle {
    shared: Arc<Shared>,
    grace: Duration,
    task: JoinHandle<()>,
}

impl CycleRunnerHandle {
    /// Ask for a cycle; it runs once the minimum period has passed.
    pub fn request_cycle(&self) {
        self.shared.cycle_requested.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /// Run a cycle now, whatever the periods say.
    pub fn trigger_cycle(&self) {
        self.shared.force_cycle.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    pub fn latency(&self) -> CycleLatency {
        *self.shared.latency.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the runner to stop by itself.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    /// Stop the runner. Returns `false` if it had to be aborted after the
    /// grace period.
    pub async fn terminate(mut self) -> bool {
        self.shared.token.cancel();
        match tokio::time::timeout(self.grace, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    grace_ms = self.grace.as_millis() as u64,
                    "cycle runner still busy after grace period, aborting"
                );
                self.task.abort();
                false
            }
        }
    }
}
