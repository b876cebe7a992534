//! Process runner for external workers.
//!
//! # Responsibilities
//! - Spawn the worker with stdout piped and stderr captured separately
//! - Expose stdout as a cancellable `AsyncRead`
//! - Kill and reap the child exactly once, whatever the exit path
//!
//! # Design Decisions
//! - `kill_on_drop(true)`: a dropped handle never leaks a running child
//! - Cancellation is a `CancellationToken` owned by the request
//! - `wait` is cached, so calling it twice is a no-op

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Bytes of stderr kept for error reports.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// How long `wait` lingers for the stderr reader after the child exits.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker binary not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to start worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("worker stdout was not captured")]
    MissingStdout,

    #[error("failed to read worker output: {0}")]
    Read(#[source] io::Error),

    #[error("failed to wait for worker: {0}")]
    Wait(#[source] io::Error),

    #[error("worker exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },

    #[error("worker was cancelled")]
    Cancelled,
}

/// Program and argument list for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }
}

/// Last few KiB of a worker's stderr.
#[derive(Debug, Clone, Default)]
struct StderrTail(Arc<Mutex<Vec<u8>>>);

impl StderrTail {
    fn push(&self, line: &[u8]) {
        let mut buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        buf.extend_from_slice(line);
        if buf.len() > STDERR_TAIL_BYTES {
            let excess = buf.len() - STDERR_TAIL_BYTES;
            buf.drain(..excess);
        }
    }

    fn text(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).trim().to_string()
    }
}

fn spawn_stderr_reader(stderr: ChildStderr, tail: StderrTail, pid: Option<u32>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    tracing::debug!(
                        target: "worker",
                        pid = ?pid,
                        "{}",
                        String::from_utf8_lossy(&line).trim_end()
                    );
                    tail.push(&line);
                }
            }
        }
    })
}

#[derive(Debug)]
enum ProcessState {
    Running(Child),
    Exited(ExitStatus),
}

/// Handle to one running worker invocation.
#[derive(Debug)]
pub struct WorkerProcess {
    state: ProcessState,
    cancel: CancellationToken,
    killed: bool,
    pid: Option<u32>,
    stderr: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    /// Spawn `command`. The child is killed as soon as `cancel` fires and the
    /// output stream or `wait` is being polled.
    pub fn start(
        command: &WorkerCommand,
        cancel: CancellationToken,
    ) -> Result<(WorkerOutput, WorkerProcess), WorkerError> {
        let mut child = Command::new(command.program())
            .args(command.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    WorkerError::NotFound(command.program().to_path_buf())
                } else {
                    WorkerError::Spawn(e)
                }
            })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or(WorkerError::MissingStdout)?;

        let stderr = StderrTail::default();
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| spawn_stderr_reader(pipe, stderr.clone(), pid));

        tracing::debug!(
            pid = ?pid,
            program = %command.program().display(),
            "Worker started"
        );

        let output = WorkerOutput::new(stdout, cancel.clone());
        let process = WorkerProcess {
            state: ProcessState::Running(child),
            cancel,
            killed: false,
            pid,
            stderr,
            stderr_task,
        };
        Ok((output, process))
    }

    /// Run to completion and collect stdout. Non-zero exit is an error.
    pub async fn run_to_completion(
        command: &WorkerCommand,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, WorkerError> {
        let (mut output, mut process) = Self::start(command, cancel.clone())?;

        let mut stdout = Vec::new();
        if let Err(e) = output.read_to_end(&mut stdout).await {
            let _ = process.finish().await;
            return Err(if cancel.is_cancelled() {
                WorkerError::Cancelled
            } else {
                WorkerError::Read(e)
            });
        }

        let status = process.wait().await?;
        if cancel.is_cancelled() && !status.success() {
            return Err(WorkerError::Cancelled);
        }
        process.check_status(status)?;
        Ok(stdout)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the invocation's cancellation token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the exit status has been collected.
    pub fn is_reaped(&self) -> bool {
        matches!(self.state, ProcessState::Exited(_))
    }

    /// Send the terminating signal. No-op if already killed or reaped.
    pub fn kill(&mut self) {
        if self.killed {
            return;
        }
        if let ProcessState::Running(child) = &mut self.state {
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid = ?self.pid, error = %e, "Worker already gone when killed");
            }
            self.killed = true;
        }
    }

    /// Reap the child and return its status. Later calls return the cached status.
    ///
    /// If the request is cancelled while waiting, the child is killed first,
    /// so this never blocks past cancellation.
    pub async fn wait(&mut self) -> Result<ExitStatus, WorkerError> {
        let child = match &mut self.state {
            ProcessState::Exited(status) => return Ok(*status),
            ProcessState::Running(child) => child,
        };

        let result = tokio::select! {
            result = child.wait() => result,
            _ = self.cancel.cancelled() => {
                if !self.killed {
                    let _ = child.start_kill();
                    self.killed = true;
                }
                child.wait().await
            }
        };
        let status = result.map_err(WorkerError::Wait)?;
        self.state = ProcessState::Exited(status);

        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
        }

        tracing::debug!(pid = ?self.pid, status = %status, killed = self.killed, "Worker reaped");
        Ok(status)
    }

    /// Kill then reap. Used on every abnormal exit path.
    pub async fn finish(&mut self) -> Result<ExitStatus, WorkerError> {
        self.kill();
        self.wait().await
    }

    /// Turn a non-success status into an error carrying the stderr tail.
    pub fn check_status(&self, status: ExitStatus) -> Result<(), WorkerError> {
        if status.success() {
            Ok(())
        } else {
            Err(WorkerError::Exit {
                status,
                stderr: self.stderr.text(),
            })
        }
    }
}

/// A worker's stdout. Reads fail with `Interrupted` ("operation canceled")
/// once the invocation's cancellation token fires.
pub struct WorkerOutput {
    stdout: ChildStdout,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl WorkerOutput {
    fn new(stdout: ChildStdout, cancel: CancellationToken) -> Self {
        let cancelled = Box::pin(cancel.clone().cancelled_owned());
        Self {
            stdout,
            cancel,
            cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for WorkerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOutput")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl AsyncRead for WorkerOutput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "operation canceled",
            )));
        }
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}
