//! IPC Message Types

use countbench_core::{Label, Mode, TimerArgs, WorkOrder, WorkerOutput};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// What a worker needs to know to execute one work order.
///
/// Timeouts and retries stay on the supervisor side.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct MeasureRequest {
    /// Raw id of the originating work order, echoed back in the reply
    pub order_id: u64,
    /// Benchmark label (for worker-side diagnostics)
    pub label: Label,
    /// Execution strategy
    pub mode: Mode,
    /// Snippet and collection flags
    pub timer_args: TimerArgs,
}

impl From<&WorkOrder> for MeasureRequest {
    fn from(order: &WorkOrder) -> Self {
        Self {
            order_id: order.id().get(),
            label: order.label().clone(),
            mode: order.mode(),
            timer_args: order.timer_args().clone(),
        }
    }
}

/// Worker capabilities advertised during handshake
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct WorkerCapabilities {
    /// Protocol version for compatibility
    pub protocol_version: u32,
    /// Worker process id
    pub pid: u32,
    /// Number of logical CPUs visible to the worker
    pub cpu_count: u32,
    /// CPU model string
    pub cpu_model: String,
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            pid: std::process::id(),
            cpu_count: std::thread::available_parallelism()
                .map(|p| p.get() as u32)
                .unwrap_or(1),
            cpu_model: cpu_model_string(),
        }
    }
}

/// Messages sent from Supervisor to Worker
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum SupervisorCommand {
    /// Execute one measurement
    Measure(MeasureRequest),
    /// Exit the worker loop
    Shutdown,
}

/// Categories of worker-side failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum FailureKind {
    /// The snippet executor panicked
    Panic,
    /// The snippet executor reported an error
    Snippet,
    /// The request could not be handled at all
    Unsupported,
}

/// Messages sent from Worker to Supervisor
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum WorkerMessage {
    /// Initial handshake
    Hello(WorkerCapabilities),

    /// Measurement finished
    Measured {
        /// Echo of `MeasureRequest::order_id`
        order_id: u64,
        /// The measurement
        output: WorkerOutput,
    },

    /// Measurement failed
    Failure {
        /// Echo of `MeasureRequest::order_id`
        order_id: u64,
        /// Error category
        kind: FailureKind,
        /// Human-readable message
        message: String,
        /// Backtrace, when one was captured
        backtrace: Option<String>,
    },
}

fn cpu_model_string() -> String {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/cpuinfo")
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find(|line| line.starts_with("model name"))
                    .and_then(|line| line.split(':').nth(1))
                    .map(|s| s.trim().to_string())
            })
            .unwrap_or_else(|| "Unknown CPU".to_string())
    }

    #[cfg(not(target_os = "linux"))]
    {
        "Unknown CPU".to_string()
    }
}
