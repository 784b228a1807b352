//! Worker process supervision
//!
//! Spawns the downloader, turns its output into progress events, and kills
//! it on cancellation or timeout. Terminal events are left to the caller,
//! which decides the outcome from the returned [`WorkerExit`].

use super::args::{build_worker_command, WorkerInvocation};
use crate::emitter::ProgressEmitter;
use crate::jobs::JobStatus;
use crate::progress::{is_merge_line, parse_progress_line, FilterDecision, ProgressFilter};
use fetch_relay_daemon_config::{Config, ProgressConfig};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How long a killed worker gets to be reaped.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Error type for worker supervision
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker binary could not be started
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting on the worker failed
    #[error("failed to wait for worker: {0}")]
    Wait(#[source] std::io::Error),

    /// A pipe requested at spawn time was not available
    #[error("worker {0} pipe unavailable")]
    MissingPipe(&'static str),

    /// A passthrough worker exited before writing any media
    #[error("worker produced no output (exit code {0:?})")]
    NoOutput(Option<i32>),
}

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exit status 0
    Completed { saw_completion: bool },
    /// Non-zero exit; `None` when terminated by a signal
    Failed { code: Option<i32> },
    /// Cancel token fired
    Cancelled,
    /// Job timeout elapsed
    TimedOut,
}

/// Runs worker processes for jobs.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    binary: String,
    cookies_from_browser: Option<String>,
    min_interval: Duration,
    fragment_threshold: u64,
    job_timeout: Option<Duration>,
}

impl ProcessSupervisor {
    pub fn new(binary: &str, progress: &ProgressConfig, job_timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.to_string(),
            cookies_from_browser: None,
            min_interval: Duration::from_millis(progress.min_interval_ms),
            fragment_threshold: progress.fragment_threshold_bytes,
            job_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let timeout = match config.limits.job_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self::new(&config.worker.binary, &config.progress, timeout)
            .with_cookies(config.worker.cookies_from_browser.clone())
    }

    pub fn with_cookies(mut self, browser: Option<String>) -> Self {
        self.cookies_from_browser = browser;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn cookies_from_browser(&self) -> Option<String> {
        self.cookies_from_browser.clone()
    }

    pub(crate) fn command(&self, invocation: &WorkerInvocation) -> Command {
        let mut cmd = Command::from(build_worker_command(&self.binary, invocation));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run the worker to completion, forwarding non-terminal progress
    /// through `emitter`.
    ///
    /// Stdout and stderr are read concurrently, line by line. A 100% reading
    /// is not forwarded here; the caller reports it with the terminal event.
    pub async fn run(
        &self,
        invocation: &WorkerInvocation,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<WorkerExit, SupervisorError> {
        let job_id = emitter.job_id().to_string();
        if cancel.is_cancelled() {
            return Ok(WorkerExit::Cancelled);
        }

        let mut child = self.command(invocation).spawn().map_err(SupervisorError::Spawn)?;
        info!(job_id = %job_id, pid = ?child.id(), "worker started");

        let stdout = child.stdout.take().ok_or(SupervisorError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SupervisorError::MissingPipe("stderr"))?;
        let mut out_lines = LineReader::new(stdout);
        let mut err_lines = LineReader::new(stderr);

        let mut filter = ProgressFilter::new(self.min_interval, self.fragment_threshold);
        let deadline = self
            .job_timeout
            .map(|t| tokio::time::Instant::now() + t);
        let timeout = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout);

        while !(out_lines.done && err_lines.done) {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(job_id = %job_id, "cancellation requested, killing worker");
                    terminate(&mut child).await;
                    return Ok(WorkerExit::Cancelled);
                }
                _ = &mut timeout => {
                    warn!(job_id = %job_id, "job timeout elapsed, killing worker");
                    terminate(&mut child).await;
                    return Ok(WorkerExit::TimedOut);
                }
                lines = out_lines.next(), if !out_lines.done => {
                    for line in lines {
                        self.handle_line(&line, &mut filter, emitter).await;
                    }
                }
                lines = err_lines.next(), if !err_lines.done => {
                    for line in lines {
                        self.handle_line(&line, &mut filter, emitter).await;
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Ok(WorkerExit::Cancelled);
            }
            _ = &mut timeout => {
                terminate(&mut child).await;
                return Ok(WorkerExit::TimedOut);
            }
            status = child.wait() => status.map_err(SupervisorError::Wait)?,
        };

        if cancel.is_cancelled() {
            return Ok(WorkerExit::Cancelled);
        }

        debug!(job_id = %job_id, status = %status, "worker exited");
        if status.success() {
            Ok(WorkerExit::Completed {
                saw_completion: filter.saw_completion(),
            })
        } else {
            Ok(WorkerExit::Failed {
                code: status.code(),
            })
        }
    }

    async fn handle_line(&self, line: &str, filter: &mut ProgressFilter, emitter: &ProgressEmitter) {
        trace!(job_id = %emitter.job_id(), line, "worker output");

        if is_merge_line(line) {
            let percent = filter.last_accepted().unwrap_or(0.0);
            emitter
                .progress(JobStatus::Merging, percent, Some("Merging formats"))
                .await;
            return;
        }

        let Some(sample) = parse_progress_line(line) else {
            return;
        };

        match filter.offer(sample, Instant::now()) {
            FilterDecision::Forward(percent) => {
                emitter.progress(JobStatus::Downloading, percent, None).await;
            }
            FilterDecision::Completion => {
                debug!(job_id = %emitter.job_id(), "worker reported 100%");
            }
            FilterDecision::Throttled | FilterDecision::Discard => {}
        }
    }
}

/// Kill the worker and reap it within [`KILL_GRACE`].
pub(crate) async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill signal not delivered");
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!(pid = ?child.id(), "worker did not exit within grace period");
    }
}

/// Splits a pipe into lines on `\n` and `\r`, decoding lossily.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            done: false,
        }
    }

    /// Next chunk of lines; empty and `done` once the pipe closes.
    ///
    /// Bytes from a read interrupted by `select!` stay in `buf` and are
    /// completed by the next call.
    async fn next(&mut self) -> Vec<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) => {
                self.done = true;
                self.take_lines()
            }
            Ok(_) => self.take_lines(),
            Err(e) => {
                debug!(error = %e, "worker pipe read failed");
                self.done = true;
                Vec::new()
            }
        }
    }

    fn take_lines(&mut self) -> Vec<String> {
        let lines = String::from_utf8_lossy(&self.buf)
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.buf.clear();
        lines
    }
}
