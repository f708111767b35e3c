//! Error Taxonomy
//!
//! - [`BackendError`]: one failed attempt. Retried until the order's budget is spent.
//! - [`ContractViolation`]: the work model's invariants are broken. Aborts the run.
//! - [`RunnerError`]: why `Runner::run` could not return an outcome at all.

use countbench_core::{WorkOrder, WorkOrderId};
use countbench_ipc::FrameError;
use std::time::Duration;
use thiserror::Error;

/// A single failed measurement attempt
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Attempt exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Snippet failed: {message}")]
    Snippet { message: String },

    #[error("Worker protocol error: expected {expected}, got {got}")]
    Protocol { expected: String, got: String },

    #[error("Run aborted before the attempt started")]
    Cancelled,
}

impl From<FrameError> for BackendError {
    fn from(e: FrameError) -> Self {
        BackendError::Ipc(e.to_string())
    }
}

/// Broken invariant of the work model. Never recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("Work order {order} ({label}) was submitted twice")]
    DuplicateSubmission { order: WorkOrderId, label: String },

    #[error("Completion for work order {order} ({label}) was reported twice")]
    DuplicateCompletion { order: WorkOrderId, label: String },

    #[error("Work order {order} ({label}) requested instruction counts but the output has none")]
    MissingInstructionCounts { order: WorkOrderId, label: String },

    #[error("Comparison table needs at least one environment")]
    NoEnvironments,

    #[error("Comparison group {group} has {got} members, expected {expected}")]
    MismatchedGroupSize {
        group: usize,
        expected: usize,
        got: usize,
    },

    #[error("Comparison group {group} is misaligned: expected {expected}, got {got}")]
    MisalignedGroup {
        group: usize,
        expected: String,
        got: String,
    },

    #[error("Work order {order} appears more than once in the comparison table")]
    DuplicateTrackedOrder { order: WorkOrderId },

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),
}

impl ContractViolation {
    /// `DuplicateSubmission` for `order`
    pub fn duplicate_submission(order: &WorkOrder) -> Self {
        ContractViolation::DuplicateSubmission {
            order: order.id(),
            label: order.label().to_string(),
        }
    }

    /// `DuplicateCompletion` for `order`
    pub fn duplicate_completion(order: &WorkOrder) -> Self {
        ContractViolation::DuplicateCompletion {
            order: order.id(),
            label: order.label().to_string(),
        }
    }
}

/// Fatal dispatcher errors
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("Failed to build worker pool: {0}")]
    Pool(String),

    #[error("Completion channel closed with {outstanding} work order(s) outstanding")]
    ChannelClosed { outstanding: usize },
}
