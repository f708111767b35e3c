//! Worker Process Entry Point
//!
//! The other half of [`ProcessBackend`](crate::ProcessBackend). A harness binary
//! started with the worker flag hands its [`SnippetExecutor`] to
//! [`WorkerMain`] and lets it answer measurement requests until told to stop.
//!
//! On Unix the transport is the fd pair from `COUNTBENCH_IPC_FD`; otherwise
//! (or if the variable is malformed) stdin/stdout.

use crate::backend::{SnippetExecutor, panic_message, respect_collection_flag};
use countbench_ipc::{
    FailureKind, FrameError, FrameReader, FrameWriter, IPC_FD_ENV, MeasureRequest,
    SupervisorCommand, WorkerCapabilities, WorkerMessage,
};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::io::FromRawFd;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigterm(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(unix)]
fn install_sigterm_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigterm as *const () as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn install_sigterm_handler() {}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) -> std::io::Result<()> {
    Ok(())
}

fn parse_fd_pair(value: &str) -> Option<(i32, i32)> {
    let (read, write) = value.split_once(',')?;
    Some((read.trim().parse().ok()?, write.trim().parse().ok()?))
}

#[cfg(unix)]
fn inherited_transport() -> Option<(Box<dyn Read>, Box<dyn Write>)> {
    let value = std::env::var(IPC_FD_ENV).ok()?;
    let Some((read_fd, write_fd)) = parse_fd_pair(&value) else {
        warn!(
            value = %value,
            "invalid {} (expected <read_fd>,<write_fd>), falling back to stdio",
            IPC_FD_ENV
        );
        return None;
    };
    // The supervisor hands these fds over exclusively to this process.
    let reader = unsafe { std::fs::File::from_raw_fd(read_fd) };
    let writer = unsafe { std::fs::File::from_raw_fd(write_fd) };
    Some((Box::new(reader), Box::new(writer)))
}

#[cfg(not(unix))]
fn inherited_transport() -> Option<(Box<dyn Read>, Box<dyn Write>)> {
    None
}

/// Worker main loop
pub struct WorkerMain<E> {
    executor: E,
    reader: FrameReader<Box<dyn Read>>,
    writer: FrameWriter<Box<dyn Write>>,
}

impl<E: SnippetExecutor> WorkerMain<E> {
    /// Attach to the supervisor using the inherited transport
    pub fn new(executor: E) -> Self {
        match inherited_transport() {
            Some((reader, writer)) => Self::with_transport(executor, reader, writer),
            None => Self::with_transport(
                executor,
                Box::new(std::io::stdin()),
                Box::new(std::io::stdout()),
            ),
        }
    }

    /// Attach to an explicit transport
    pub fn with_transport(executor: E, reader: Box<dyn Read>, writer: Box<dyn Write>) -> Self {
        Self {
            executor,
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    /// Serve requests until `Shutdown`, SIGTERM or the supervisor hangs up
    pub fn run(&mut self) -> Result<(), FrameError> {
        install_sigterm_handler();
        self.writer
            .send(&WorkerMessage::Hello(WorkerCapabilities::default()))?;

        if let Some(cpu) = std::env::var(crate::PIN_CPU_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            if let Err(e) = pin_to_cpu(cpu) {
                warn!(cpu, error = %e, "failed to pin worker");
            }
        }

        while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            let command = match self.reader.recv::<SupervisorCommand>() {
                Ok(command) => command,
                Err(FrameError::EndOfStream) => break,
                Err(e) => return Err(e),
            };

            match command {
                SupervisorCommand::Measure(request) => self.measure(request)?,
                SupervisorCommand::Shutdown => break,
            }
        }
        Ok(())
    }

    fn measure(&mut self, request: MeasureRequest) -> Result<(), FrameError> {
        debug!(order_id = request.order_id, label = %request.label, "executing snippet");
        let order_id = request.order_id;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.executor.execute(&request)
        }));

        let reply = match result {
            Ok(Ok(output)) => WorkerMessage::Measured {
                order_id,
                output: respect_collection_flag(&request, output),
            },
            Ok(Err(e)) => WorkerMessage::Failure {
                order_id,
                kind: FailureKind::Snippet,
                message: e.message,
                backtrace: None,
            },
            Err(panic) => {
                let backtrace = std::backtrace::Backtrace::capture();
                WorkerMessage::Failure {
                    order_id,
                    kind: FailureKind::Panic,
                    message: panic_message(panic),
                    backtrace: match backtrace.status() {
                        std::backtrace::BacktraceStatus::Captured => Some(backtrace.to_string()),
                        _ => None,
                    },
                }
            }
        };
        self.writer.send(&reply)
    }
}
