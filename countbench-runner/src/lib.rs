#![warn(missing_docs)]
//! Countbench Runner - Work Order Dispatch
//!
//! Executes batches of [`WorkOrder`](countbench_core::WorkOrder)s against a
//! measurement backend:
//! - `Runner`: bounded-parallel dispatcher with retries and a completion callback
//! - `MeasurementBackend`: the seam between dispatch and measurement
//! - `ProcessBackend`: one isolated worker process per attempt (Unix)
//! - `InProcessBackend`: runs a `SnippetExecutor` on the dispatcher's threads
//! - `WorkerMain`: the worker side of the process protocol
//!
//! Completion callbacks always run on the thread that called `run`, one at a
//! time, so they may hold plain mutable state.

mod backend;
mod error;
mod retry;
mod runner;
#[cfg(unix)]
mod supervisor;
mod worker;

pub use backend::{InProcessBackend, MeasurementBackend, SnippetError, SnippetExecutor};
pub use error::{BackendError, ContractViolation, RunnerError};
pub use retry::{FailedWorkOrder, RetryPolicy};
pub use runner::{Callback, RunOutcome, Runner};
#[cfg(unix)]
pub use supervisor::ProcessBackend;
pub use worker::WorkerMain;

pub use countbench_ipc::{MeasureRequest, WORKER_FLAG};

/// Environment variable asking a worker to pin itself to one CPU
pub const PIN_CPU_ENV: &str = "COUNTBENCH_PIN_CPU";
