//! Work Order Dispatcher
//!
//! Executes a batch of work orders against a [`MeasurementBackend`] and feeds
//! each successful completion to a [`Callback`], which may inject further work.
//!
//! ```text
//!   initial orders ──► worklist ──► rayon pool ──► backend (retries, timeout)
//!                         ▲                              │
//!                         │                         completion
//!                         │                              ▼
//!                     new orders ◄── callback ◄── dispatcher thread (mpsc)
//! ```
//!
//! Completions arrive in any order but are serialized onto the dispatcher
//! thread, so callbacks run one at a time and own their state exclusively.
//! The run ends at quiescence: nothing outstanding and no callback produced
//! new work. A fatal error aborts it: attempts already executing finish, but
//! no queued order or retry starts afterwards.

use crate::backend::MeasurementBackend;
use crate::error::{ContractViolation, RunnerError};
use crate::retry::{FailedWorkOrder, RetryPolicy, execute_with_retries};
use countbench_core::{WorkOrder, WorkOrderId, WorkerOutput};
use fxhash::{FxHashMap, FxHashSet};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Invoked after every successful completion; returns follow-up work
pub trait Callback {
    /// React to `order` finishing with `output`.
    ///
    /// Returned orders are merged into the active run. Errors abort the run.
    fn on_complete(
        &mut self,
        order: &WorkOrder,
        output: &WorkerOutput,
    ) -> Result<Vec<WorkOrder>, ContractViolation>;
}

impl<F> Callback for F
where
    F: FnMut(&WorkOrder, &WorkerOutput) -> Result<Vec<WorkOrder>, ContractViolation>,
{
    fn on_complete(
        &mut self,
        order: &WorkOrder,
        output: &WorkerOutput,
    ) -> Result<Vec<WorkOrder>, ContractViolation> {
        self(order, output)
    }
}

struct NoFollowUp;

impl Callback for NoFollowUp {
    fn on_complete(
        &mut self,
        _order: &WorkOrder,
        _output: &WorkerOutput,
    ) -> Result<Vec<WorkOrder>, ContractViolation> {
        Ok(Vec::new())
    }
}

/// Everything a run produced
#[derive(Debug, Default)]
pub struct RunOutcome {
    results: FxHashMap<WorkOrderId, (WorkOrder, WorkerOutput)>,
    failures: FxHashMap<WorkOrderId, FailedWorkOrder>,
    backend_invocations: u64,
}

impl RunOutcome {
    /// Output for `order`, if it succeeded
    pub fn output(&self, order: &WorkOrder) -> Option<&WorkerOutput> {
        self.results.get(&order.id()).map(|(_, output)| output)
    }

    /// Failure record for `order`, if its budget was exhausted
    pub fn failure(&self, order: &WorkOrder) -> Option<&FailedWorkOrder> {
        self.failures.get(&order.id())
    }

    /// All successful orders with their outputs (unordered)
    pub fn results(&self) -> impl Iterator<Item = (&WorkOrder, &WorkerOutput)> {
        self.results.values().map(|(order, output)| (order, output))
    }

    /// All permanently failed orders (unordered)
    pub fn failures(&self) -> impl Iterator<Item = &FailedWorkOrder> {
        self.failures.values()
    }

    /// Number of successful orders
    pub fn success_count(&self) -> usize {
        self.results.len()
    }

    /// Number of permanently failed orders
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Total backend attempts across all orders
    pub fn backend_invocations(&self) -> u64 {
        self.backend_invocations
    }
}

struct Completion {
    order: WorkOrder,
    result: Result<(WorkerOutput, u32), FailedWorkOrder>,
}

/// Dispatcher for work orders
pub struct Runner<B> {
    backend: Arc<B>,
    jobs: usize,
    retry_policy: RetryPolicy,
    progress: bool,
}

impl<B: MeasurementBackend + 'static> Runner<B> {
    /// Create a runner with one job, immediate retries and no progress bar
    pub fn new(backend: B) -> Self {
        Self::with_shared_backend(Arc::new(backend))
    }

    /// Create a runner around a backend shared with the caller
    pub fn with_shared_backend(backend: Arc<B>) -> Self {
        Self {
            backend,
            jobs: 1,
            retry_policy: RetryPolicy::default(),
            progress: false,
        }
    }

    /// Number of attempts executing concurrently
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Backoff between attempts
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Show a progress bar on stderr
    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    /// Run `orders` to quiescence without follow-up work
    pub fn run(
        &self,
        orders: impl IntoIterator<Item = WorkOrder>,
    ) -> Result<RunOutcome, RunnerError> {
        self.run_with_callback(orders, &mut NoFollowUp)
    }

    /// Run `orders` to quiescence, merging whatever `callback` returns
    pub fn run_with_callback(
        &self,
        orders: impl IntoIterator<Item = WorkOrder>,
        callback: &mut dyn Callback,
    ) -> Result<RunOutcome, RunnerError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .thread_name(|i| format!("countbench-job-{}", i))
            .build()
            .map_err(|e| RunnerError::Pool(e.to_string()))?;

        let (tx, rx) = mpsc::channel();
        let mut worklist = Worklist {
            pool: &pool,
            tx,
            backend: Arc::clone(&self.backend),
            policy: Arc::new(self.retry_policy.clone()),
            submitted: FxHashSet::default(),
            outstanding: 0,
            progress: self.progress_bar(),
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        for order in orders {
            worklist.submit(order)?;
        }

        let start = Instant::now();
        info!(
            orders = worklist.outstanding,
            jobs = self.jobs,
            "dispatching work orders"
        );

        let outcome = drain(&mut worklist, &rx, callback).inspect_err(|e| {
            warn!(error = %e, outstanding = worklist.outstanding, "run aborted");
        })?;

        worklist.progress.finish_and_clear();
        info!(
            succeeded = outcome.success_count(),
            failed = outcome.failure_count(),
            submitted = worklist.submitted.len(),
            attempts = outcome.backend_invocations,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "work graph quiesced"
        );
        Ok(outcome)
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }
}

fn drain<B: MeasurementBackend + 'static>(
    worklist: &mut Worklist<'_, B>,
    rx: &Receiver<Completion>,
    callback: &mut dyn Callback,
) -> Result<RunOutcome, RunnerError> {
    let mut outcome = RunOutcome::default();

    while worklist.outstanding > 0 {
        let Completion { order, result } = rx.recv().map_err(|_| RunnerError::ChannelClosed {
            outstanding: worklist.outstanding,
        })?;
        worklist.outstanding -= 1;
        worklist.progress.inc(1);

        match result {
            Ok((output, attempts)) => {
                outcome.backend_invocations += u64::from(attempts);
                worklist.progress.set_message(order.label().to_string());

                let follow_up = callback.on_complete(&order, &output)?;
                if !follow_up.is_empty() {
                    debug!(order = %order, new_orders = follow_up.len(), "callback injected work");
                }
                outcome.results.insert(order.id(), (order, output));
                for next in follow_up {
                    worklist.submit(next)?;
                }
            }
            Err(failed) => {
                outcome.backend_invocations += u64::from(failed.attempts);
                outcome.failures.insert(order.id(), failed);
            }
        }
    }

    Ok(outcome)
}

struct Worklist<'p, B> {
    pool: &'p ThreadPool,
    tx: Sender<Completion>,
    backend: Arc<B>,
    policy: Arc<RetryPolicy>,
    submitted: FxHashSet<WorkOrderId>,
    outstanding: usize,
    progress: ProgressBar,
    cancelled: Arc<AtomicBool>,
}

impl<B> Drop for Worklist<'_, B> {
    fn drop(&mut self) {
        // Anything still queued belongs to a run that has already returned.
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl<B: MeasurementBackend + 'static> Worklist<'_, B> {
    fn submit(&mut self, order: WorkOrder) -> Result<(), ContractViolation> {
        if !self.submitted.insert(order.id()) {
            return Err(ContractViolation::duplicate_submission(&order));
        }
        self.outstanding += 1;
        self.progress.inc_length(1);

        let tx = self.tx.clone();
        let backend = Arc::clone(&self.backend);
        let policy = Arc::clone(&self.policy);
        let cancelled = Arc::clone(&self.cancelled);
        self.pool.spawn(move || {
            let result = execute_with_retries(backend.as_ref(), &order, &policy, &cancelled);
            // The receiver is gone only if the run already aborted.
            let _ = tx.send(Completion { order, result });
        });
        Ok(())
    }
}
