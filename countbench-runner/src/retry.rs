//! Retry Budget
//!
//! Every work order gets `retries + 1` attempts. Between attempts the runner
//! waits according to a [`RetryPolicy`]; the default retries immediately.
//! No new attempt starts once the run has been cancelled.

use crate::backend::{MeasurementBackend, panic_message};
use crate::error::BackendError;
use countbench_core::{WorkOrder, WorkerOutput};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff between attempts of the same work order
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Wait before the first retry
    pub initial_backoff: Duration,
    /// Growth factor applied per further retry
    pub multiplier: f64,
    /// Upper bound on any single wait
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Wait before retry number `retry` (1 = first retry)
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(retry as i32 - 1);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Work order whose attempt budget was exhausted
#[derive(Debug)]
pub struct FailedWorkOrder {
    /// The order that failed
    pub order: WorkOrder,
    /// Attempts made (`retries + 1` unless the run was cancelled)
    pub attempts: u32,
    /// Error from the final attempt
    pub last_error: BackendError,
}

/// Drive one order through its attempt budget
pub(crate) fn execute_with_retries(
    backend: &dyn MeasurementBackend,
    order: &WorkOrder,
    policy: &RetryPolicy,
    cancelled: &AtomicBool,
) -> Result<(WorkerOutput, u32), FailedWorkOrder> {
    let budget = order.retries().saturating_add(1);
    let mut attempt = 0;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            debug!(order = %order, attempts = attempt, "run cancelled, not measuring");
            return Err(FailedWorkOrder {
                order: order.clone(),
                attempts: attempt,
                last_error: BackendError::Cancelled,
            });
        }
        attempt += 1;
        debug!(order = %order, attempt, budget, "measuring");

        let error = match measure_once(backend, order) {
            Ok(output) => return Ok((output, attempt)),
            Err(e) => e,
        };

        if attempt >= budget {
            warn!(order = %order, attempts = attempt, error = %error, "work order failed permanently");
            return Err(FailedWorkOrder {
                order: order.clone(),
                attempts: attempt,
                last_error: error,
            });
        }

        let wait = policy.backoff(attempt);
        warn!(
            order = %order,
            attempt,
            budget,
            error = %error,
            backoff_ms = wait.as_millis() as u64,
            "attempt failed, retrying"
        );
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

fn measure_once(
    backend: &dyn MeasurementBackend,
    order: &WorkOrder,
) -> Result<WorkerOutput, BackendError> {
    let start = Instant::now();
    let output = match std::panic::catch_unwind(AssertUnwindSafe(|| backend.measure(order))) {
        Ok(result) => result?,
        Err(panic) => {
            return Err(BackendError::WorkerCrashed(format!(
                "backend panicked: {}",
                panic_message(panic)
            )));
        }
    };
    // A result that arrives after the deadline counts as a timeout.
    if start.elapsed() > order.timeout() {
        return Err(BackendError::Timeout(order.timeout()));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use countbench_core::{InstructionCounts, Label, Language, Mode, TimerArgs, WallTime};
    use std::sync::atomic::AtomicU32;

    struct FlakyBackend {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl MeasurementBackend for FlakyBackend {
        fn measure(&self, _order: &WorkOrder) -> Result<WorkerOutput, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(BackendError::WorkerCrashed(format!("call {}", call)))
            } else {
                Ok(WorkerOutput::new(
                    InstructionCounts::exact(10),
                    WallTime::new(vec![1.0]),
                ))
            }
        }
    }

    struct SlowBackend;

    impl MeasurementBackend for SlowBackend {
        fn measure(&self, _order: &WorkOrder) -> Result<WorkerOutput, BackendError> {
            std::thread::sleep(Duration::from_millis(30));
            Ok(WorkerOutput::timing_only(WallTime::new(vec![1.0])))
        }
    }

    fn measure_uncancelled(
        backend: &dyn MeasurementBackend,
        order: &WorkOrder,
    ) -> Result<(WorkerOutput, u32), FailedWorkOrder> {
        execute_with_retries(backend, order, &RetryPolicy::immediate(), &AtomicBool::new(false))
    }

    fn order(retries: u32) -> WorkOrder {
        WorkOrder::builder(
            Label::new(["retry"]),
            Mode::Native,
            TimerArgs::new("x", Language::Native),
        )
        .retries(retries)
        .build()
    }

    #[test]
    fn test_recovers_within_budget() {
        let backend = FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };
        let (_, attempts) = measure_uncancelled(&backend, &order(2)).unwrap();
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_exhausted_budget() {
        let backend = FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        };
        let failed = measure_uncancelled(&backend, &order(2)).unwrap_err();
        assert_eq!(failed.attempts, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(failed.last_error, BackendError::WorkerCrashed(_)));
    }

    #[test]
    fn test_zero_retries_single_attempt() {
        let backend = FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: 1,
        };
        let failed = measure_uncancelled(&backend, &order(0)).unwrap_err();
        assert_eq!(failed.attempts, 1);
    }

    #[test]
    fn test_late_result_is_timeout() {
        let slow = WorkOrder::builder(
            Label::new(["slow"]),
            Mode::Native,
            TimerArgs::new("x", Language::Native),
        )
        .timeout(Duration::from_millis(1))
        .retries(1)
        .build();
        let failed = measure_uncancelled(&SlowBackend, &slow).unwrap_err();
        assert_eq!(failed.attempts, 2);
        assert!(matches!(failed.last_error, BackendError::Timeout(_)));
    }

    /// Fails every attempt and cancels the run on its first call
    struct CancellingBackend<'a> {
        calls: AtomicU32,
        cancel: &'a AtomicBool,
    }

    impl MeasurementBackend for CancellingBackend<'_> {
        fn measure(&self, _order: &WorkOrder) -> Result<WorkerOutput, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cancel.store(true, Ordering::SeqCst);
            Err(BackendError::WorkerCrashed("flaky".to_string()))
        }
    }

    #[test]
    fn test_cancel_stops_retries() {
        let cancel = AtomicBool::new(false);
        let backend = CancellingBackend {
            calls: AtomicU32::new(0),
            cancel: &cancel,
        };
        let failed =
            execute_with_retries(&backend, &order(5), &RetryPolicy::immediate(), &cancel)
                .unwrap_err();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(failed.attempts, 1);
        assert!(matches!(failed.last_error, BackendError::Cancelled));
    }

    #[test]
    fn test_cancelled_order_never_measured() {
        let backend = FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: 0,
        };
        let failed = execute_with_retries(
            &backend,
            &order(2),
            &RetryPolicy::immediate(),
            &AtomicBool::new(true),
        )
        .unwrap_err();
        assert_eq!(failed.attempts, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backoff_growth() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(RetryPolicy::immediate().backoff(4), Duration::ZERO);
    }
}
