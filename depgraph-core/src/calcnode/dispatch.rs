//! Job Dispatch
//!
//! How a job reaches a calculation node, and how its results come back.
//!
//! # Overview
//!
//! A [`JobDispatcher`] takes a job and a [`JobResultReceiver`] and returns
//! at once with a [`Cancelable`] handle. Results arrive later on whatever
//! thread the worker runs on, one per job in the tail chain.
//!
//! [`LocalJobDispatcher`] is the in-process implementation: a Tokio
//! runtime, a semaphore bounding concurrent jobs, and the blocking thread
//! pool for the calculation itself.
//!
//! Time a job spends queued for a slot is not part of its run; the
//! dispatcher reports [`JobResultReceiver::job_started`] once a slot is
//! free.
//!
//! # Cancellation
//!
//! Cancellation is cooperative. A cancelled job that has not started never
//! runs; with `may_interrupt_if_running` a running job stops before its
//! next item. Either way it delivers no further results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use super::job::{CalculationJob, CalculationJobResult, JobId};
use super::node::CalculationNode;

/// Handle to something that can be called off.
pub trait Cancelable: Send + Sync {
    /// Ask for cancellation. Returns `false` if it already completed or was
    /// already cancelled.
    fn cancel(&self, may_interrupt_if_running: bool) -> bool;
}

/// Receives job results.
pub trait JobResultReceiver: Send + Sync {
    fn result_received(&self, result: CalculationJobResult);

    /// A worker picked up `job_id`. Only called by dispatchers whose
    /// [`JobDispatcher::reports_job_start`] is `true`.
    fn job_started(&self, _job_id: JobId) {}
}

/// Sends jobs to calculation nodes.
pub trait JobDispatcher: Send + Sync {
    /// Submit `job`; its result and each tail result go to `receiver`.
    fn dispatch_job(
        &self,
        job: CalculationJob,
        receiver: Arc<dyn JobResultReceiver>,
    ) -> Box<dyn Cancelable>;

    /// Whether receivers hear [`JobResultReceiver::job_started`]. If not, a
    /// job counts as started once dispatched.
    fn reports_job_start(&self) -> bool {
        false
    }
}

/// Shared state between a dispatched job and its handle.
#[derive(Debug, Default)]
struct JobControl {
    cancelled: AtomicBool,
    interrupt: AtomicBool,
    finished: AtomicBool,
}

impl JobControl {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// [`Cancelable`] handle of a locally dispatched job.
#[derive(Debug, Clone)]
pub struct LocalJobHandle {
    control: Arc<JobControl>,
}

impl LocalJobHandle {
    /// Whether the job ran to completion or gave up.
    pub fn is_finished(&self) -> bool {
        self.control.finished.load(Ordering::Acquire)
    }
}

impl Cancelable for LocalJobHandle {
    fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        if self.control.finished.load(Ordering::Acquire) {
            return false;
        }
        if self.control.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        if may_interrupt_if_running {
            self.control.interrupt.store(true, Ordering::Release);
        }
        true
    }
}

/// Runs jobs on a [`CalculationNode`] in this process.
pub struct LocalJobDispatcher {
    node: Arc<CalculationNode>,
    slots: Arc<Semaphore>,
    runtime: Handle,
}

impl LocalJobDispatcher {
    /// Dispatch onto `runtime` with at most `worker_count` jobs running at once.
    pub fn new(node: Arc<CalculationNode>, worker_count: usize, runtime: Handle) -> Self {
        Self {
            node,
            slots: Arc::new(Semaphore::new(worker_count.max(1))),
            runtime,
        }
    }

    /// Dispatch onto the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn for_current_runtime(node: Arc<CalculationNode>, worker_count: usize) -> Self {
        Self::new(node, worker_count, Handle::current())
    }

    /// Job slots not currently in use.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn node(&self) -> &Arc<CalculationNode> {
        &self.node
    }
}

impl JobDispatcher for LocalJobDispatcher {
    fn dispatch_job(
        &self,
        job: CalculationJob,
        receiver: Arc<dyn JobResultReceiver>,
    ) -> Box<dyn Cancelable> {
        let control = Arc::new(JobControl::default());
        let handle = LocalJobHandle {
            control: control.clone(),
        };
        let node = self.node.clone();
        let slots = self.slots.clone();
        let job_id = job.job_id();

        self.runtime.spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                error!(%job_id, "job slots closed");
                return;
            };
            if control.is_cancelled() {
                debug!(%job_id, "job cancelled before start");
                control.finished.store(true, Ordering::Release);
                return;
            }
            receiver.job_started(job_id);

            let worker = control.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let interrupted = || worker.interrupt.load(Ordering::Acquire);
                let mut deliver = |result: CalculationJobResult| {
                    if worker.is_cancelled() {
                        debug!(job_id = %result.job_id(), "dropping result of cancelled job");
                    } else {
                        receiver.result_received(result);
                    }
                };
                node.execute_job_chain(&job, &mut deliver, &interrupted)
            })
            .await;

            control.finished.store(true, Ordering::Release);
            match outcome {
                Ok(true) => debug!(%job_id, "job chain finished"),
                Ok(false) => debug!(%job_id, "job chain interrupted"),
                Err(err) => error!(%job_id, error = %err, "calculation worker panicked"),
            }
        });

        Box::new(handle)
    }

    fn reports_job_start(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calcnode::cache::{ComputedValue, InMemoryComputationCacheSource};
    use crate::calcnode::function::FunctionRepository;
    use crate::calcnode::job::{
        CalculationJobItem, CalculationJobSpecification, CycleId, JobId,
    };
    use crate::exec::{CacheSelectHint, FunctionCosts};
    use crate::graph::{FunctionId, TargetSpecification, ValueSpecification};
    use parking_lot::Mutex;
    use std::time::{Duration, SystemTime};
    use tokio::sync::mpsc;

    struct ChannelReceiver(mpsc::UnboundedSender<CalculationJobResult>);

    impl JobResultReceiver for ChannelReceiver {
        fn result_received(&self, result: CalculationJobResult) {
            let _ = self.0.send(result);
        }
    }

    fn node(gate: Arc<Mutex<()>>) -> Arc<CalculationNode> {
        let mut functions = FunctionRepository::new();
        functions.register_fn("wait", move |_, outputs| {
            let _guard = gate.lock();
            Ok(outputs
                .iter()
                .map(|o| ComputedValue::new(o.clone(), serde_json::Value::Null))
                .collect())
        });
        Arc::new(CalculationNode::new(
            "local",
            Arc::new(functions),
            Arc::new(InMemoryComputationCacheSource::new()),
            Arc::new(FunctionCosts::new()),
        ))
    }

    fn job(id: u64, items: usize) -> CalculationJob {
        let items = (0..items)
            .map(|i| {
                CalculationJobItem::new(
                    FunctionId::new("wait"),
                    TargetSpecification::new("T"),
                    Vec::new(),
                    vec![ValueSpecification::new(format!("v{id}-{i}"), "T")],
                )
            })
            .collect();
        CalculationJob::new(
            CalculationJobSpecification::new(
                CycleId::from(1),
                "Default",
                SystemTime::UNIX_EPOCH,
                JobId::from(id),
            ),
            0,
            items,
            Arc::new(CacheSelectHint::all_shared()),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn results_arrive_for_head_and_tails() {
        let dispatcher = LocalJobDispatcher::for_current_runtime(node(Arc::default()), 2);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = dispatcher.dispatch_job(
            job(1, 2).with_tail(vec![job(2, 1)]),
            Arc::new(ChannelReceiver(tx)),
        );

        assert_eq!(rx.recv().await.unwrap().job_id(), JobId::from(1));
        assert_eq!(rx.recv().await.unwrap().job_id(), JobId::from(2));
        // The sender is dropped with the finished task.
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn finished_handle_refuses_cancel() {
        let handle = LocalJobHandle {
            control: Arc::new(JobControl::default()),
        };
        handle.control.finished.store(true, Ordering::Release);
        assert!(handle.is_finished());
        assert!(!handle.cancel(true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_job_delivers_nothing() {
        let gate = Arc::new(Mutex::new(()));
        let dispatcher = LocalJobDispatcher::for_current_runtime(node(gate.clone()), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Hold the gate so the first item blocks inside the worker.
        let guard = gate.lock();
        let handle = dispatcher.dispatch_job(job(1, 3), Arc::new(ChannelReceiver(tx)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handle.cancel(true));
        assert!(!handle.cancel(true));
        drop(guard);

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_job_cancelled_before_start() {
        let gate = Arc::new(Mutex::new(()));
        let dispatcher = LocalJobDispatcher::for_current_runtime(node(gate.clone()), 1);
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        let guard = gate.lock();
        let _first = dispatcher.dispatch_job(job(1, 1), Arc::new(ChannelReceiver(first_tx)));
        let second = dispatcher.dispatch_job(job(2, 1), Arc::new(ChannelReceiver(second_tx)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.available_slots(), 0);

        assert!(second.cancel(false));
        drop(guard);

        assert_eq!(first_rx.recv().await.unwrap().job_id(), JobId::from(1));
        assert!(second_rx.recv().await.is_none());
    }

    #[derive(Default)]
    struct StartRecorder {
        started: Mutex<Vec<JobId>>,
    }

    impl JobResultReceiver for StartRecorder {
        fn result_received(&self, _result: CalculationJobResult) {}

        fn job_started(&self, job_id: JobId) {
            self.started.lock().push(job_id);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_is_reported_when_a_slot_frees() {
        let gate = Arc::new(Mutex::new(()));
        let dispatcher = LocalJobDispatcher::for_current_runtime(node(gate.clone()), 1);
        assert!(dispatcher.reports_job_start());
        let recorder = Arc::new(StartRecorder::default());

        let guard = gate.lock();
        let _first = dispatcher.dispatch_job(job(1, 1), recorder.clone());
        let _second = dispatcher.dispatch_job(job(2, 1), recorder.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*recorder.started.lock(), vec![JobId::from(1)]);

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.started.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*recorder.started.lock(), vec![JobId::from(1), JobId::from(2)]);
    }
}
