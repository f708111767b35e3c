//! Process-Isolated Backend
//!
//! Every attempt runs in a fresh worker process so that instruction counts
//! from one measurement never leak into another. When a work order names a
//! `source_cmd` the worker is started through the shell after that command,
//! which is how a measurement lands in a different checkout or environment:
//!
//! ```text
//! sh -c '<source_cmd> && exec "$0" "$@"' <worker> --countbench-worker
//! ```
//!
//! The worker talks over inherited fds 3 (commands in) and 4 (messages out),
//! leaving stdout to the snippet. The whole attempt, handshake included, must
//! finish within the order's timeout; otherwise the worker's process group
//! (the shell and anything `source_cmd` started) gets SIGTERM, a short grace
//! period, then SIGKILL.

use crate::PIN_CPU_ENV;
use crate::backend::MeasurementBackend;
use crate::error::BackendError;
use countbench_core::{WorkOrder, WorkerOutput};
use countbench_ipc::{
    FailureKind, FrameError, FrameReader, FrameWriter, IPC_FD_ENV, MeasureRequest,
    PROTOCOL_VERSION, SupervisorCommand, WORKER_FLAG, WorkerMessage,
};
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const WORKER_CMD_FD: RawFd = 3;
const WORKER_MSG_FD: RawFd = 4;
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Launches a fresh worker process per attempt
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<OsString>,
    shell: PathBuf,
    grace: Duration,
    cpus: Option<CpuSlots>,
}

impl ProcessBackend {
    /// Workers are this same executable re-invoked with the worker flag
    pub fn current_exe() -> Result<Self, BackendError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, [WORKER_FLAG]))
    }

    /// Workers are `program args...`
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            shell: PathBuf::from("/bin/sh"),
            grace: Duration::from_millis(500),
            cpus: None,
        }
    }

    /// Shell used to evaluate `source_cmd` (default `/bin/sh`)
    pub fn shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Time between SIGTERM and SIGKILL on timeout
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Pin each concurrent worker to its own CPU from `cpus`.
    /// Attempts beyond the number of CPUs run unpinned.
    pub fn pin_cpus(mut self, cpus: impl IntoIterator<Item = usize>) -> Self {
        let free: Vec<usize> = cpus.into_iter().collect();
        self.cpus = (!free.is_empty()).then(|| CpuSlots {
            free: Mutex::new(free),
        });
        self
    }

    fn command(&self, source_cmd: Option<&str>) -> Command {
        match source_cmd {
            Some(source) => {
                let mut command = Command::new(&self.shell);
                command
                    .arg("-c")
                    .arg(format!("{} && exec \"$0\" \"$@\"", source))
                    .arg(&self.program)
                    .args(&self.args);
                command
            }
            None => {
                let mut command = Command::new(&self.program);
                command.args(&self.args);
                command
            }
        }
    }
}

impl MeasurementBackend for ProcessBackend {
    fn measure(&self, order: &WorkOrder) -> Result<WorkerOutput, BackendError> {
        let deadline = Instant::now() + order.timeout();
        let lease = self.cpus.as_ref().and_then(CpuSlots::acquire);

        let mut command = self.command(order.source_cmd());
        if let Some(lease) = &lease {
            command.env(PIN_CPU_ENV, lease.cpu.to_string());
        }

        let mut worker = WorkerProcess::spawn(command, self.grace, deadline)?;
        debug!(order = %order, pid = worker.child.id(), "worker spawned");

        let result = worker.measure(order, deadline);
        if matches!(result, Err(BackendError::Timeout(_))) {
            worker.terminate();
        } else {
            worker.shutdown();
        }
        result
    }
}

struct CpuSlots {
    free: Mutex<Vec<usize>>,
}

impl CpuSlots {
    fn acquire(&self) -> Option<CpuLease<'_>> {
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        free.pop().map(|cpu| CpuLease { slots: self, cpu })
    }
}

struct CpuLease<'a> {
    slots: &'a CpuSlots,
    cpu: usize,
}

impl Drop for CpuLease<'_> {
    fn drop(&mut self) {
        let mut free = self.slots.free.lock().unwrap_or_else(|p| p.into_inner());
        free.push(self.cpu);
    }
}

enum Readiness {
    Readable,
    Idle,
    Hangup,
    Failed(std::io::Error),
}

fn wait_readable(fd: RawFd, timeout: Duration) -> Readiness {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if ready < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            Readiness::Idle
        } else {
            Readiness::Failed(err)
        }
    } else if ready == 0 {
        Readiness::Idle
    } else if pollfd.revents & libc::POLLIN != 0 {
        // Data may still be pending behind a hangup; read it first.
        Readiness::Readable
    } else if pollfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
        Readiness::Hangup
    } else {
        Readiness::Idle
    }
}

/// Pipe pair `(read, write)`, both close-on-exec
#[cfg(target_os = "linux")]
fn cloexec_pipe() -> std::io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Pipe pair `(read, write)`, both close-on-exec
#[cfg(not(target_os = "linux"))]
fn cloexec_pipe() -> std::io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

fn close_all(fds: &[RawFd]) {
    for &fd in fds {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Move `fd` to `target` in a freshly forked child and keep it across exec.
///
/// Only async-signal-safe calls: this runs between fork and exec.
unsafe fn install_fd(fd: RawFd, target: RawFd) {
    unsafe {
        if fd != target {
            libc::dup2(fd, target);
            libc::close(fd);
        }
        let flags = libc::fcntl(target, libc::F_GETFD);
        libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
    }
}

/// Message pipe whose reads give up at the attempt deadline, even mid-frame
struct DeadlineReader {
    file: File,
    deadline: Instant,
}

impl Read for DeadlineReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "worker reply deadline passed",
                ));
            }
            match wait_readable(self.file.as_raw_fd(), remaining) {
                // A hangup reads as end of stream.
                Readiness::Readable | Readiness::Hangup => return self.file.read(buf),
                Readiness::Idle => continue,
                Readiness::Failed(e) => return Err(e),
            }
        }
    }
}

struct WorkerProcess {
    child: Child,
    reader: FrameReader<DeadlineReader>,
    writer: FrameWriter<File>,
    msg_fd: RawFd,
    grace: Duration,
}

impl WorkerProcess {
    fn spawn(
        mut command: Command,
        grace: Duration,
        deadline: Instant,
    ) -> Result<Self, BackendError> {
        let (cmd_read, cmd_write) = cloexec_pipe()?;
        let (msg_read, msg_write) = match cloexec_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                close_all(&[cmd_read, cmd_write]);
                return Err(BackendError::Spawn(e));
            }
        };

        command
            .env(IPC_FD_ENV, format!("{},{}", WORKER_CMD_FD, WORKER_MSG_FD))
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        unsafe {
            // The supervisor's ends are close-on-exec and vanish with the exec.
            command.pre_exec(move || {
                // Installing fd 3 first must not clobber the message end.
                let msg_write = if msg_write == WORKER_CMD_FD {
                    let moved = libc::fcntl(msg_write, libc::F_DUPFD_CLOEXEC, WORKER_MSG_FD + 1);
                    if moved < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    moved
                } else {
                    msg_write
                };
                install_fd(cmd_read, WORKER_CMD_FD);
                install_fd(msg_write, WORKER_MSG_FD);
                Ok(())
            });
        }

        let child = command.spawn();
        // The child owns its ends now (or never will).
        close_all(&[cmd_read, msg_write]);
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                close_all(&[cmd_write, msg_read]);
                return Err(BackendError::Spawn(e));
            }
        };

        let writer = unsafe { File::from_raw_fd(cmd_write) };
        let reader = unsafe { File::from_raw_fd(msg_read) };

        Ok(Self {
            child,
            reader: FrameReader::new(DeadlineReader {
                file: reader,
                deadline,
            }),
            writer: FrameWriter::new(writer),
            msg_fd: msg_read,
            grace,
        })
    }

    fn measure(
        &mut self,
        order: &WorkOrder,
        deadline: Instant,
    ) -> Result<WorkerOutput, BackendError> {
        let timeout = order.timeout();

        match self.recv_before(deadline, timeout)? {
            WorkerMessage::Hello(caps) if caps.protocol_version == PROTOCOL_VERSION => {}
            WorkerMessage::Hello(caps) => {
                return Err(BackendError::Protocol {
                    expected: format!("protocol version {}", PROTOCOL_VERSION),
                    got: format!("protocol version {}", caps.protocol_version),
                });
            }
            other => {
                return Err(BackendError::Protocol {
                    expected: "Hello".to_string(),
                    got: describe(&other),
                });
            }
        }

        let request = MeasureRequest::from(order);
        let expected_id = request.order_id;
        self.writer.send(&SupervisorCommand::Measure(request))?;

        match self.recv_before(deadline, timeout)? {
            WorkerMessage::Measured { order_id, output } if order_id == expected_id => Ok(output),
            WorkerMessage::Failure {
                order_id,
                kind,
                message,
                ..
            } if order_id == expected_id => Err(match kind {
                FailureKind::Panic => BackendError::WorkerCrashed(message),
                FailureKind::Snippet | FailureKind::Unsupported => {
                    BackendError::Snippet { message }
                }
            }),
            other => Err(BackendError::Protocol {
                expected: format!("reply for order {}", expected_id),
                got: describe(&other),
            }),
        }
    }

    fn recv_before(
        &mut self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<WorkerMessage, BackendError> {
        while !self.reader.has_buffered_data() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BackendError::Timeout(timeout));
            }
            match wait_readable(self.msg_fd, remaining.min(POLL_SLICE)) {
                Readiness::Readable => break,
                Readiness::Idle => {
                    if !self.is_alive() {
                        return Err(BackendError::WorkerCrashed(
                            "worker exited before replying".to_string(),
                        ));
                    }
                }
                Readiness::Hangup => {
                    return Err(BackendError::WorkerCrashed(
                        "worker closed its message pipe".to_string(),
                    ));
                }
                Readiness::Failed(e) => return Err(BackendError::Ipc(e.to_string())),
            }
        }

        match self.reader.recv::<WorkerMessage>() {
            Ok(message) => Ok(message),
            Err(FrameError::EndOfStream) => Err(BackendError::WorkerCrashed(
                "worker closed connection".to_string(),
            )),
            Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(BackendError::Timeout(timeout))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask politely, then reap
    fn shutdown(&mut self) {
        let _ = self.writer.send(&SupervisorCommand::Shutdown);
        self.reap_within(self.grace);
    }

    /// SIGTERM to the group, grace period, SIGKILL to whatever is left
    fn terminate(&mut self) {
        self.signal_group(libc::SIGTERM);
        self.reap_within(self.grace);
        self.signal_group(libc::SIGKILL);
    }

    fn reap_within(&mut self, grace: Duration) {
        let give_up = Instant::now() + grace;
        while Instant::now() < give_up {
            if !self.is_alive() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.signal_group(libc::SIGKILL);
        let _ = self.child.wait();
    }

    /// The worker leads its own process group, so its pid is the group id.
    fn signal_group(&self, signal: libc::c_int) {
        unsafe {
            libc::killpg(self.child.id() as libc::pid_t, signal);
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.signal_group(libc::SIGKILL);
            let _ = self.child.wait();
        }
    }
}

fn describe(message: &WorkerMessage) -> String {
    match message {
        WorkerMessage::Hello(_) => "Hello".to_string(),
        WorkerMessage::Measured { order_id, .. } => format!("Measured for order {}", order_id),
        WorkerMessage::Failure { order_id, .. } => format!("Failure for order {}", order_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use countbench_core::{Label, Language, Mode, TimerArgs};

    fn order(timeout: Duration) -> WorkOrder {
        WorkOrder::builder(
            Label::new(["proc"]),
            Mode::Native,
            TimerArgs::new("x", Language::Native),
        )
        .timeout(timeout)
        .build()
    }

    #[test]
    fn test_command_without_source() {
        let backend = ProcessBackend::new("/opt/worker", ["--countbench-worker"]);
        let command = backend.command(None);
        assert_eq!(command.get_program(), "/opt/worker");
        let args: Vec<_> = command.get_args().collect();
        assert_eq!(args, ["--countbench-worker"]);
    }

    #[test]
    fn test_command_with_source() {
        let backend = ProcessBackend::new("/opt/worker", ["--countbench-worker"]);
        let command = backend.command(Some("source activate env_a"));
        assert_eq!(command.get_program(), "/bin/sh");
        let args: Vec<_> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "-c",
                "source activate env_a && exec \"$0\" \"$@\"",
                "/opt/worker",
                "--countbench-worker",
            ]
        );
    }

    #[test]
    fn test_silent_worker_times_out() {
        // `sleep` never says Hello.
        let backend = ProcessBackend::new("sleep", ["5"]).grace_period(Duration::from_millis(50));
        let start = Instant::now();
        let result = backend.measure(&order(Duration::from_millis(200)));
        assert!(matches!(result, Err(BackendError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    /// Pids of live processes whose arguments, joined by spaces, equal `cmdline`
    #[cfg(target_os = "linux")]
    fn live_pids(cmdline: &str) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| {
                std::fs::read(format!("/proc/{}/cmdline", pid))
                    .map(|raw| {
                        raw.split(|b| *b == 0)
                            .filter(|arg| !arg.is_empty())
                            .map(|arg| String::from_utf8_lossy(arg).into_owned())
                            .collect::<Vec<_>>()
                            .join(" ")
                            == cmdline
                    })
                    .unwrap_or(false)
            })
            .collect()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_timeout_kills_source_cmd_processes() {
        let backend = ProcessBackend::new("true", Vec::<String>::new())
            .grace_period(Duration::from_millis(50));
        let stalled = WorkOrder::builder(
            Label::new(["proc"]),
            Mode::Native,
            TimerArgs::new("x", Language::Native),
        )
        .source_cmd(Some("sleep 41.2317".to_string()))
        .timeout(Duration::from_millis(300))
        .build();

        let result = backend.measure(&stalled);
        assert!(matches!(result, Err(BackendError::Timeout(_))));

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(live_pids("sleep 41.2317"), Vec::<u32>::new());
    }

    #[test]
    fn test_partial_frame_times_out() {
        // Half a length prefix, then silence.
        let backend = ProcessBackend::new("sh", ["-c", "printf ab >&4; sleep 5"])
            .grace_period(Duration::from_millis(50));
        let start = Instant::now();
        let result = backend.measure(&order(Duration::from_millis(300)));
        assert!(matches!(result, Err(BackendError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_exiting_worker_is_crash() {
        let backend = ProcessBackend::new("true", Vec::<String>::new());
        let result = backend.measure(&order(Duration::from_secs(5)));
        assert!(matches!(result, Err(BackendError::WorkerCrashed(_))));
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let backend = ProcessBackend::new("/nonexistent/countbench-worker", ["x"]);
        let result = backend.measure(&order(Duration::from_secs(1)));
        assert!(matches!(result, Err(BackendError::Spawn(_))));
    }

    #[test]
    fn test_cpu_slots_lease_returns() {
        let backend = ProcessBackend::new("w", ["x"]).pin_cpus([2]);
        let slots = backend.cpus.as_ref().unwrap();
        {
            let lease = slots.acquire().unwrap();
            assert_eq!(lease.cpu, 2);
            assert!(slots.acquire().is_none());
        }
        assert!(slots.acquire().is_some());
    }
}
