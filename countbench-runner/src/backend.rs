//! Measurement Backends
//!
//! The dispatcher never executes snippets itself. It hands each attempt to a
//! [`MeasurementBackend`]:
//!
//! - [`ProcessBackend`](crate::ProcessBackend): a fresh isolated worker process per
//!   attempt, optionally launched inside another environment via `source_cmd`.
//! - [`InProcessBackend`]: runs a [`SnippetExecutor`] in the calling process.
//!   No isolation, so concurrent attempts are serialized. Useful for debugging.

use crate::error::BackendError;
use countbench_core::{WorkOrder, WorkerOutput};
use countbench_ipc::MeasureRequest;
use std::any::Any;
use std::sync::Mutex;
use thiserror::Error;

/// Executes one attempt of a work order
pub trait MeasurementBackend: Send + Sync {
    /// Measure `order` once. Must give up within `order.timeout()`.
    fn measure(&self, order: &WorkOrder) -> Result<WorkerOutput, BackendError>;
}

impl<B: MeasurementBackend + ?Sized> MeasurementBackend for std::sync::Arc<B> {
    fn measure(&self, order: &WorkOrder) -> Result<WorkerOutput, BackendError> {
        (**self).measure(order)
    }
}

/// Error reported by a snippet executor
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SnippetError {
    /// What went wrong
    pub message: String,
}

impl SnippetError {
    /// Create an error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The thing that actually runs a snippet and counts its instructions.
///
/// Implementations live outside countbench; a worker process hosts one via
/// [`WorkerMain`](crate::WorkerMain).
pub trait SnippetExecutor: Send {
    /// Execute the request's snippet and report counts and timings
    fn execute(&mut self, request: &MeasureRequest) -> Result<WorkerOutput, SnippetError>;
}

/// Runs a [`SnippetExecutor`] in-process
pub struct InProcessBackend<E> {
    executor: Mutex<E>,
}

impl<E: SnippetExecutor> InProcessBackend<E> {
    /// Wrap an executor
    pub fn new(executor: E) -> Self {
        Self {
            executor: Mutex::new(executor),
        }
    }
}

impl<E: SnippetExecutor> MeasurementBackend for InProcessBackend<E> {
    fn measure(&self, order: &WorkOrder) -> Result<WorkerOutput, BackendError> {
        let request = MeasureRequest::from(order);
        // A panic in an earlier attempt poisons the lock; the executor is still usable.
        let mut executor = self
            .executor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            executor.execute(&request)
        }));

        match result {
            Ok(Ok(output)) => Ok(respect_collection_flag(&request, output)),
            Ok(Err(e)) => Err(BackendError::Snippet { message: e.message }),
            Err(panic) => Err(BackendError::WorkerCrashed(panic_message(panic))),
        }
    }
}

/// Drop instruction counts the request did not ask for
pub(crate) fn respect_collection_flag(
    request: &MeasureRequest,
    mut output: WorkerOutput,
) -> WorkerOutput {
    if !request.timer_args.collect_instructions {
        output.instructions = None;
    }
    output
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use countbench_core::{InstructionCounts, Label, Language, Mode, TimerArgs, WallTime};

    struct FixedExecutor {
        calls: usize,
    }

    impl SnippetExecutor for FixedExecutor {
        fn execute(&mut self, request: &MeasureRequest) -> Result<WorkerOutput, SnippetError> {
            self.calls += 1;
            match request.timer_args.stmt.as_str() {
                "boom" => panic!("snippet exploded"),
                "bad" => Err(SnippetError::new("syntax error")),
                _ => Ok(WorkerOutput::new(
                    InstructionCounts::exact(500),
                    WallTime::new(vec![2e-6]),
                )),
            }
        }
    }

    fn order(stmt: &str, collect: bool) -> WorkOrder {
        WorkOrder::builder(
            Label::new(["t"]),
            Mode::Native,
            TimerArgs::new(stmt, Language::Native).with_collect_instructions(collect),
        )
        .build()
    }

    #[test]
    fn test_in_process_success() {
        let backend = InProcessBackend::new(FixedExecutor { calls: 0 });
        let output = backend.measure(&order("x", true)).unwrap();
        assert_eq!(output.counts(true), Some(500));
    }

    #[test]
    fn test_in_process_strips_counts_when_not_requested() {
        let backend = InProcessBackend::new(FixedExecutor { calls: 0 });
        let output = backend.measure(&order("x", false)).unwrap();
        assert_eq!(output.instructions, None);
        assert_eq!(output.wall_time.samples(), &[2e-6]);
    }

    #[test]
    fn test_in_process_error_and_panic() {
        let backend = InProcessBackend::new(FixedExecutor { calls: 0 });
        assert!(matches!(
            backend.measure(&order("bad", true)),
            Err(BackendError::Snippet { .. })
        ));
        match backend.measure(&order("boom", true)) {
            Err(BackendError::WorkerCrashed(message)) => {
                assert!(message.contains("snippet exploded"))
            }
            other => panic!("expected crash, got {:?}", other),
        }
        // Still usable after the panic
        assert!(backend.measure(&order("x", true)).is_ok());
    }
}
