#![warn(missing_docs)]
//! Countbench IPC Protocol
//!
//! Wire protocol between the dispatcher's process backend (supervisor) and a
//! measurement worker. Messages are rkyv archives in length-prefixed frames.
//!
//! One exchange per worker process:
//!
//! ```text
//! worker      → Hello(capabilities)
//! supervisor  → Measure(request)
//! worker      → Measured(output) | Failure
//! supervisor  → Shutdown
//! ```

mod framing;
mod messages;

pub use framing::{FrameError, FrameReader, FrameWriter, MAX_FRAME_SIZE, read_frame, write_frame};
pub use messages::{
    FailureKind, MeasureRequest, SupervisorCommand, WorkerCapabilities, WorkerMessage,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable naming the inherited `<read_fd>,<write_fd>` pair
pub const IPC_FD_ENV: &str = "COUNTBENCH_IPC_FD";

/// Hidden command-line flag that switches a harness binary into worker mode
pub const WORKER_FLAG: &str = "--countbench-worker";
