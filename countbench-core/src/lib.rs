#![warn(missing_docs)]
//! Countbench Core - Work Model
//!
//! Types shared by every layer of countbench:
//! - `WorkOrder`: one schedulable measurement task, tracked by identity
//! - `TimerArgs`: the snippet and collection flags handed to a measurement backend
//! - `WorkerOutput`: instruction counts and wall-time samples for one work order
//!
//! Value types derive both serde (for rendering) and rkyv (for the worker wire).

mod order;
mod output;

pub use order::{
    CostEstimate, Label, Language, Mode, TimerArgs, WorkOrder, WorkOrderBuilder, WorkOrderId,
};
pub use output::{InstructionCounts, WallTime, WorkerOutput};

/// Default per-attempt timeout for benchmark work orders (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 180;

/// Default number of additional attempts after a failed one
pub const DEFAULT_RETRIES: u32 = 2;
