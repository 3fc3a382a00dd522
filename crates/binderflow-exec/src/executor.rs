//! Stage executor: runs a single external program and classifies the outcome.
//!
//! Every invocation is exactly one attempt. The program is spawned directly
//! (no shell) in its own process group so that a timeout, a cancellation or a
//! dropped future terminates the whole tree the tool started.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use binderflow_types::{BinderflowError, Cancellation, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::truncation::truncate_output;

/// Default per-invocation timeout: one hour.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Captured stderr/stdout embedded in errors is bounded to this many characters.
const MAX_CAPTURED_CHARS: usize = 2000;
/// Stdout preview length in logs.
const LOG_PREVIEW_CHARS: usize = 500;

/// One fully-rendered external command.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Human-readable label used in logs and error messages,
    /// e.g. "ProteinMPNN sequence design for scaffold 2".
    pub description: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(description: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program and arguments joined with spaces, for logging.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output of a successful invocation.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Runs invocations. The controller only depends on this trait so tests can
/// substitute a fake that writes artifacts directly.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation, cancel: &Cancellation) -> Result<ExecOutput>;
}

/// Runs invocations as local child processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    grace_period: Duration,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
        }
    }

    /// Time allowed between SIGTERM and SIGKILL when terminating a process group.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    async fn terminate(&self, child: &mut tokio::process::Child, group: &ProcessGroup) {
        group.signal(Signal::Term);
        tokio::select! {
            _ = child.wait() => {}
            _ = tokio::time::sleep(self.grace_period) => {
                group.signal(Signal::Kill);
                let _ = child.kill().await;
            }
        }
    }

    /// Await a stream reader, giving up after the grace period when a
    /// grandchild that escaped the process group still holds the pipe open.
    async fn drain(&self, task: JoinHandle<Vec<u8>>, description: &str) -> String {
        match tokio::time::timeout(self.grace_period, task).await {
            Ok(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
            Ok(Err(e)) => {
                tracing::warn!(description = %description, error = %e, "Output reader task failed");
                String::new()
            }
            Err(_) => {
                tracing::warn!(
                    description = %description,
                    "Output stream still open after exit, discarding"
                );
                String::new()
            }
        }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled(String),
}

#[async_trait]
impl StageRunner for ProcessExecutor {
    async fn run(&self, invocation: &Invocation, cancel: &Cancellation) -> Result<ExecOutput> {
        let description = invocation.description.as_str();
        cancel.check(description)?;

        tracing::info!(
            description = %description,
            command = %invocation.command_line(),
            cwd = %invocation.working_dir.display(),
            timeout_ms = invocation.timeout.as_millis() as u64,
            "Running external command"
        );

        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // On Unix, use process_group for clean kill
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let start = tokio::time::Instant::now();
        let mut child = cmd.spawn().map_err(|e| BinderflowError::LaunchFailed {
            description: description.to_string(),
            message: e.to_string(),
        })?;
        let mut group = ProcessGroup::new(child.id());

        // Drain both pipes while the child runs so a chatty tool can never
        // block on a full pipe buffer.
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            _ = tokio::time::sleep(invocation.timeout) => Exit::TimedOut,
            reason = cancel.cancelled() => Exit::Cancelled(reason),
        };
        if !matches!(exit, Exit::Status(_)) {
            self.terminate(&mut child, &group).await;
        }
        group.disarm();

        let stdout = self.drain(stdout_task, description).await;
        let stderr = self.drain(stderr_task, description).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match exit {
            Exit::Status(Ok(status)) if status.success() => {
                tracing::info!(
                    description = %description,
                    duration_ms,
                    stdout_len = stdout.len(),
                    stderr_len = stderr.len(),
                    "External command completed"
                );
                if !stdout.is_empty() {
                    tracing::debug!(
                        description = %description,
                        output = %truncate_output(&stdout, LOG_PREVIEW_CHARS),
                        "Command output"
                    );
                }
                Ok(ExecOutput {
                    stdout,
                    stderr,
                    duration_ms,
                })
            }
            Exit::Status(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                tracing::error!(
                    description = %description,
                    exit_code,
                    duration_ms,
                    "External command failed"
                );
                Err(BinderflowError::ProcessFailed {
                    description: description.to_string(),
                    exit_code,
                    stderr: truncate_output(stderr.trim_end(), MAX_CAPTURED_CHARS),
                    stdout: truncate_output(stdout.trim_end(), MAX_CAPTURED_CHARS),
                })
            }
            Exit::Status(Err(e)) => Err(BinderflowError::Io(e)),
            Exit::TimedOut => {
                let timeout_ms = invocation.timeout.as_millis() as u64;
                tracing::error!(
                    description = %description,
                    timeout_ms,
                    "External command timed out"
                );
                Err(BinderflowError::ProcessTimedOut {
                    description: description.to_string(),
                    timeout_ms,
                    stderr: truncate_output(stderr.trim_end(), MAX_CAPTURED_CHARS),
                })
            }
            Exit::Cancelled(reason) => {
                tracing::warn!(
                    description = %description,
                    reason = %reason,
                    "External command cancelled"
                );
                Err(BinderflowError::Cancelled {
                    description: description.to_string(),
                    reason,
                })
            }
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

// ---------------------------------------------------------------------------
// ProcessGroup - kills the child's process group unless disarmed
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

struct ProcessGroup {
    pid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    /// Called once the child has been reaped; the group id may be reused afterwards.
    fn disarm(&mut self) {
        self.pid = None;
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) {
        if let Some(pid) = self.pid {
            let sig = match signal {
                Signal::Term => libc::SIGTERM,
                Signal::Kill => libc::SIGKILL,
            };
            // The child was spawned with process_group(0), so its pid is the pgid.
            unsafe {
                libc::kill(-(pid as i32), sig);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: Signal) {}
}

impl Drop for ProcessGroup {
    // Reached when the invocation future is dropped mid-flight (a sibling in the
    // same stage failed). kill_on_drop only covers the direct child.
    fn drop(&mut self) {
        self.signal(Signal::Kill);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
