//! Transports that move strips between the coordinator and worker processes.
//!
//! - [`pipe`]: one worker process per strip, one frame each way over stdin/stdout.
//! - [`pool`]: a fixed number of long-lived worker processes fed from a task queue.
//! - [`shared`]: workers write results into a memory-mapped [`SharedBuffer`].
//!
//! Every transport returns results index-aligned with its input and aborts the whole
//! batch on the first failure. Each one races its waits against a
//! [`CancellationToken`]; on cancellation all in-flight workers are killed and
//! reaped before [`StripError::Cancelled`] is returned.
//!
//! [`SharedBuffer`]: crate::shared_buffer::SharedBuffer

pub mod pipe;
pub mod pool;
pub mod shared;

use crate::error::{StripError, StripResult};
use crate::filter::FilterSpec;
use crate::raster::Strip;
use crate::shared_buffer::LayoutKind;
use crate::wire::{read_strip, write_strip};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long to wait for an exit status after a worker closed its channel early.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Which transport carries strips to and from workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One process and one duplex pipe per strip.
    Pipe,
    /// Fixed-size process pool consuming a task queue.
    Pool,
    /// Results written into a memory-mapped shared buffer.
    Shared,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Pipe => "pipe",
            TransportKind::Pool => "pool",
            TransportKind::Shared => "shared",
        })
    }
}

/// Knobs shared by all transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Upper bound on any single send, receive, or join.
    pub receive_timeout: Duration,
    /// Pool lane cap; 0 means one lane per strip.
    pub pool_size: usize,
    /// Shared buffer layout.
    pub layout: LayoutKind,
    /// Directory for shared buffer backing files.
    pub shared_dir: Option<PathBuf>,
}

impl TransportOptions {
    /// Number of pool lanes for a batch of `strips`.
    pub fn pool_lanes(&self, strips: usize) -> usize {
        match self.pool_size {
            0 => strips,
            cap => cap.min(strips),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(30),
            pool_size: 0,
            layout: LayoutKind::Packed,
            shared_dir: None,
        }
    }
}

/// Program and arguments used to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    /// Run `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// `program worker <filter args> --log-level <level>`.
    pub fn for_filter(program: impl Into<PathBuf>, filter: &FilterSpec, log_level: &str) -> Self {
        Self::new(program)
            .arg("worker")
            .args(filter.to_args())
            .args(["--log-level", log_level])
    }

    /// Worker command pointing at the running executable.
    pub fn current_exe(filter: &FilterSpec, log_level: &str) -> StripResult<Self> {
        Ok(Self::for_filter(std::env::current_exe()?, filter, log_level))
    }

    /// Program path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Start a worker for strip (or lane) `index` with extra trailing arguments.
    pub fn spawn(
        &self,
        index: usize,
        extra: &[OsString],
        timeout: Duration,
    ) -> StripResult<WorkerHandle> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(extra)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StripError::transport(
                    index,
                    format!("failed to start {}: {}", self.program.display(), e),
                )
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        debug!(index, pid = ?child.id(), "Worker spawned");
        Ok(WorkerHandle {
            index,
            child,
            stdin,
            stdout,
            timeout,
        })
    }
}

/// One running worker process and its pipe endpoints.
///
/// Dropping the handle kills the process.
pub struct WorkerHandle {
    index: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    timeout: Duration,
}

impl WorkerHandle {
    /// Strip or lane this worker was spawned for.
    pub fn index(&self) -> usize {
        self.index
    }

    /// OS process id, while the process is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Write one strip frame to the worker's stdin.
    pub async fn send(&mut self, strip: &Strip) -> StripResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| StripError::transport(strip.index, "input channel already closed"))?;
        match tokio::time::timeout(self.timeout, write_strip(stdin, strip)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self
                .closed_early(strip.index, &format!("rejected its input ({err})"))
                .await),
            Err(_) => Err(StripError::transport(
                strip.index,
                format!("worker did not accept input within {:?}", self.timeout),
            )),
        }
    }

    /// Close stdin so the worker sees end-of-stream.
    pub fn close_input(&mut self) {
        self.stdin.take();
    }

    /// Read the one result frame answering `expected`.
    ///
    /// Blocks until the whole frame has arrived. A worker that closes its output,
    /// sends a truncated frame, answers for a different strip, or stays silent past
    /// the timeout yields [`StripError::WorkerTransport`].
    pub async fn receive(&mut self, expected: &Strip) -> StripResult<Strip> {
        let index = expected.index;
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| StripError::transport(index, "output channel already closed"))?;
        let frame = match tokio::time::timeout(self.timeout, read_strip(stdout)).await {
            Ok(Ok(Some(strip))) => strip,
            Ok(Ok(None)) => {
                return Err(self
                    .closed_early(index, "closed its channel before sending a result")
                    .await)
            }
            Ok(Err(err)) => {
                return Err(self
                    .closed_early(index, &format!("sent an incomplete result ({err})"))
                    .await)
            }
            Err(_) => {
                return Err(StripError::transport(
                    index,
                    format!("no result within {:?}", self.timeout),
                ))
            }
        };
        check_result(expected, &frame)?;
        Ok(frame)
    }

    /// Close stdin and wait for a successful exit.
    ///
    /// On cancellation the worker is terminated and [`StripError::Cancelled`] returned.
    pub async fn join(mut self, cancel: &CancellationToken) -> StripResult<()> {
        self.close_input();
        let index = self.index;
        let timeout = self.timeout;
        let status = tokio::select! {
            waited = tokio::time::timeout(timeout, self.child.wait()) => waited,
            _ = cancel.cancelled() => {
                self.terminate().await;
                return Err(StripError::Cancelled);
            }
        };
        match status {
            Ok(Ok(status)) if status.success() => {
                debug!(index, "Worker exited cleanly");
                Ok(())
            }
            Ok(Ok(status)) => Err(StripError::transport(
                index,
                format!("worker exited with {status}"),
            )),
            Ok(Err(err)) => Err(StripError::transport(
                index,
                format!("failed to wait for worker: {err}"),
            )),
            Err(_) => {
                self.terminate().await;
                Err(StripError::transport(
                    index,
                    format!("worker did not exit within {timeout:?}"),
                ))
            }
        }
    }

    /// Kill the worker and reap it.
    pub async fn terminate(mut self) {
        self.stdin.take();
        self.stdout.take();
        if let Err(err) = self.child.start_kill() {
            debug!(index = self.index, error = %err, "Kill skipped");
        }
        match self.child.wait().await {
            Ok(status) => debug!(index = self.index, %status, "Worker terminated"),
            Err(err) => warn!(index = self.index, error = %err, "Error waiting for worker to stop"),
        }
    }

    async fn closed_early(&mut self, index: usize, what: &str) -> StripError {
        let status = match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => format!(" ({status})"),
            _ => String::new(),
        };
        StripError::transport(index, format!("worker {what}{status}"))
    }
}

/// Verify a worker answered for the strip it was given, with the same shape.
pub(crate) fn check_result(expected: &Strip, got: &Strip) -> StripResult<()> {
    if got.index != expected.index
        || got.offset_x != expected.offset_x
        || got.shape() != expected.shape()
    {
        return Err(StripError::transport(
            expected.index,
            format!(
                "worker answered with strip {} at x={} shaped {}, expected strip {} at x={} shaped {}",
                got.index,
                got.offset_x,
                got.shape(),
                expected.index,
                expected.offset_x,
                expected.shape()
            ),
        ));
    }
    Ok(())
}

/// Remember the first real failure of a batch.
///
/// Cancellations caused by aborting the batch never displace a genuine error.
pub(crate) fn keep_first(slot: &mut Option<StripError>, err: StripError) {
    let replace = match slot {
        None => true,
        Some(existing) => existing.is_cancelled() && !err.is_cancelled(),
    };
    if replace {
        *slot = Some(err);
    }
}

/// Final outcome of a batch whose tasks have all finished.
///
/// Once the run is cancelled the result is [`StripError::Cancelled`], even when
/// workers died of the same interrupt and reported their own exit first.
pub(crate) fn settle(failure: Option<StripError>, cancel: &CancellationToken) -> StripResult<()> {
    match failure {
        None => Ok(()),
        Some(_) if cancel.is_cancelled() => Err(StripError::Cancelled),
        Some(err) => Err(err),
    }
}

/// Join every worker; the first failure terminates the rest.
pub async fn join_all(handles: Vec<WorkerHandle>, cancel: &CancellationToken) -> StripResult<()> {
    let batch = cancel.child_token();
    let mut set = JoinSet::new();
    for handle in handles {
        let batch = batch.clone();
        let index = handle.index();
        set.spawn(async move { (index, handle.join(&batch).await) });
    }

    let mut failure = None;
    while let Some(joined) = set.join_next().await {
        let outcome = match joined {
            Ok((_, outcome)) => outcome,
            Err(err) => Err(StripError::transport(
                usize::MAX,
                format!("join task failed: {err}"),
            )),
        };
        if let Err(err) = outcome {
            batch.cancel();
            keep_first(&mut failure, err);
        }
    }
    settle(failure, cancel)
}

/// Run `strips` through the chosen transport.
pub async fn process(
    kind: TransportKind,
    strips: Vec<Strip>,
    command: &WorkerCommand,
    options: &TransportOptions,
    cancel: &CancellationToken,
) -> StripResult<Vec<Strip>> {
    match kind {
        TransportKind::Pipe => pipe::process_via_pipes(strips, command, options, cancel).await,
        TransportKind::Pool => pool::process_via_pool(strips, command, options, cancel).await,
        TransportKind::Shared => shared::process_via_shared(strips, command, options, cancel).await,
    }
}
