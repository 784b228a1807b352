//! Job executor module for the Fetch Relay Daemon
//!
//! Admits download requests and drives each admitted job through its
//! lifecycle: wait for a consumer, wait for a slot, run the worker, then
//! report exactly one terminal event.

use crate::bus::ProgressBus;
use crate::classify::{canonicalize_url, classify_platform, PlatformInfo};
use crate::emitter::ProgressEmitter;
use crate::jobs::{unix_timestamp_secs, DownloadResult, Job, JobRequest, JobStatus};
use crate::metadata::{ChainResolver, MediaInfo, MetadataError, MetadataResolver};
use crate::metrics::SharedMetrics;
use crate::quality::{concurrent_fragments, select_format_chain};
use crate::registry::RequestRegistry;
use crate::slots::SlotLimiter;
use crate::storage::{
    ensure_dir, estimate_cleanup_at, output_file_name, output_size, public_url,
};
use crate::worker::{ProcessSupervisor, WorkerExit, WorkerInvocation};
use fetch_relay_daemon_config::{Config, StorageConfig};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const QUEUED_MESSAGE: &str = "Too many downloads. Waiting for slot...";
const INITIALIZING_MESSAGE: &str = "Preparing download";
const ABORTED_MESSAGE: &str = "Download aborted";
const ABANDONED_MESSAGE: &str = "No consumer attached";
const SPAWN_FAILED_MESSAGE: &str = "Failed to start downloader";
const DOWNLOAD_FAILED_MESSAGE: &str = "Download failed";
const TIMED_OUT_MESSAGE: &str = "Download timed out";
const OUTPUT_MISSING_MESSAGE: &str = "Downloaded file not found";
const INTERNAL_ERROR_MESSAGE: &str = "Internal error";

/// Error type for synchronous admission failures
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Request is malformed
    #[error("invalid request: {0}")]
    Validation(String),

    /// URL could not be classified or its platform is not handled
    #[error("unsupported url: {reason}")]
    Unsupported { reason: String },

    /// No metadata source could describe the URL
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl AdmissionError {
    /// Stable reason code for API responses.
    pub fn code(&self) -> &str {
        match self {
            AdmissionError::Validation(_) => "invalid_request",
            AdmissionError::Unsupported { reason } => reason.as_str(),
            AdmissionError::Metadata(_) => "metadata_unavailable",
        }
    }
}

/// What the client gets back when a job is admitted.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub request_id: String,
    pub media_info: MediaInfo,
    pub platform: PlatformInfo,
}

/// How a job task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Aborted,
    /// No consumer attached in time; reported as an error, no work was done
    Abandoned,
}

/// Owns the shared engine state and runs admitted jobs.
pub struct JobExecutor {
    slots: SlotLimiter,
    registry: Arc<RequestRegistry>,
    bus: Arc<ProgressBus>,
    supervisor: ProcessSupervisor,
    resolver: Arc<dyn MetadataResolver>,
    metrics: SharedMetrics,
    storage: StorageConfig,
    sink_wait: Duration,
}

impl JobExecutor {
    /// Build the executor and its collaborators from configuration.
    pub fn new(config: &Config, bus: Arc<ProgressBus>, metrics: SharedMetrics) -> Self {
        Self {
            slots: SlotLimiter::new(config.limits.max_concurrent_jobs as usize),
            registry: Arc::clone(bus.registry()),
            bus,
            supervisor: ProcessSupervisor::from_config(config),
            resolver: Arc::new(ChainResolver::from_config(config)),
            metrics,
            storage: config.storage.clone(),
            sink_wait: Duration::from_secs(config.transport.sink_wait_secs),
        }
    }

    /// Replace the metadata resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn MetadataResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn slots(&self) -> &SlotLimiter {
        &self.slots
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.bus
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// Validate, classify and describe a request, then start its job.
    ///
    /// Returns as soon as the job task is spawned; progress is delivered to
    /// whichever sink attaches under the returned request id.
    pub async fn admit(self: &Arc<Self>, request: JobRequest) -> Result<Admission, AdmissionError> {
        let quality = validate(&request)?;

        let url = canonicalize_url(request.url.trim());
        let platform = classify_platform(&url);
        if !platform.is_supported {
            let reason = platform
                .reason
                .clone()
                .unwrap_or_else(|| "unsupported_platform".to_string());
            info!(url = %url, reason = %reason, "request rejected");
            return Err(AdmissionError::Unsupported { reason });
        }

        let media_info = self.resolver.resolve(&url).await?;

        let job = Job::new(
            url,
            quality,
            platform.clone(),
            &media_info.title,
            request.audio_only,
            request.tag,
        );
        let cancel = CancellationToken::new();
        self.registry.register(&job.id, cancel.clone());
        self.metrics.write().await.track_job(&job);

        info!(
            job_id = %job.id,
            platform = %job.platform.platform,
            method = %job.method,
            quality = %job.quality,
            audio_only = job.audio_only,
            tag = ?job.tag,
            "job admitted"
        );

        let request_id = job.id.clone();
        self.spawn_job(job, cancel);

        Ok(Admission {
            request_id,
            media_info,
            platform,
        })
    }

    /// Explicitly cancel a job. Returns `false` if the id is unknown or the
    /// job already finished.
    pub fn abort(&self, job_id: &str) -> bool {
        if !self.registry.trigger(job_id) {
            return false;
        }
        self.registry.mark_aborted(job_id);
        info!(job_id, "abort requested");
        true
    }

    fn spawn_job(self: &Arc<Self>, job: Job, cancel: CancellationToken) {
        let emitter = Arc::new(ProgressEmitter::new(
            &job.id,
            Arc::clone(&self.bus),
            Some(Arc::clone(&self.metrics)),
        ));
        let job_id = job.id.clone();

        let executor = Arc::clone(self);
        let task_emitter = Arc::clone(&emitter);
        let handle = tokio::spawn(async move { executor.run_job(job, &task_emitter, cancel).await });

        // A panicking job task still owes its consumer a terminal event.
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            match handle.await {
                Ok(outcome) => debug!(job_id = %job_id, outcome = ?outcome, "job task finished"),
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "job task failed");
                    emitter.fail(INTERNAL_ERROR_MESSAGE).await;
                    executor.finish(&job_id).await;
                }
            }
        });
    }

    async fn run_job(&self, job: Job, emitter: &ProgressEmitter, cancel: CancellationToken) -> JobOutcome {
        // Partial output of failed or aborted jobs is left for the sweeper.
        let outcome = self.drive(&job, emitter, &cancel).await;
        self.finish(&job.id).await;
        info!(job_id = %job.id, outcome = ?outcome, "job finished");
        outcome
    }

    async fn drive(&self, job: &Job, emitter: &ProgressEmitter, cancel: &CancellationToken) -> JobOutcome {
        if !self.bus.wait_for_sink(&job.id, self.sink_wait, cancel).await {
            if self.was_aborted(&job.id, cancel) {
                emitter.abort(ABORTED_MESSAGE).await;
                return JobOutcome::Aborted;
            }
            warn!(job_id = %job.id, wait_secs = self.sink_wait.as_secs(), "no consumer attached, abandoning job");
            emitter.fail(ABANDONED_MESSAGE).await;
            return JobOutcome::Abandoned;
        }

        if self.was_aborted(&job.id, cancel) {
            emitter.abort(ABORTED_MESSAGE).await;
            return JobOutcome::Aborted;
        }

        let chain = select_format_chain(&job.quality, job.platform.kind);
        debug!(job_id = %job.id, format = %chain.expression(), status = ?chain.status, "format chain selected");

        if self.slots.is_full() {
            emitter.progress(JobStatus::Queued, 0.0, Some(QUEUED_MESSAGE)).await;
        }

        let mut slot = tokio::select! {
            slot = self.slots.acquire() => match slot {
                Ok(slot) => slot,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "slot acquisition failed");
                    emitter.fail(INTERNAL_ERROR_MESSAGE).await;
                    return JobOutcome::Failed;
                }
            },
            _ = cancel.cancelled() => {
                emitter.abort(ABORTED_MESSAGE).await;
                return JobOutcome::Aborted;
            }
        };

        emitter
            .progress(JobStatus::Initializing, 0.0, Some(INITIALIZING_MESSAGE))
            .await;

        if let Err(e) = ensure_dir(&self.storage.downloads_dir).await {
            slot.release();
            error!(job_id = %job.id, error = %e, "cannot create downloads directory");
            emitter.fail(SPAWN_FAILED_MESSAGE).await;
            return JobOutcome::Failed;
        }

        let file_name = output_file_name(&job.title, job.short_id(), job.audio_only);
        let output = self.storage.downloads_dir.join(&file_name);
        let fragments = concurrent_fragments(self.slots.in_use(), &job.quality);
        let invocation = WorkerInvocation::for_job(
            job,
            &chain,
            fragments,
            &output,
            self.supervisor.cookies_from_browser(),
        );

        let exit = self.supervisor.run(&invocation, emitter, cancel).await;
        slot.release();

        match exit {
            Ok(WorkerExit::Completed { saw_completion }) => {
                debug!(job_id = %job.id, saw_completion, "worker exited cleanly");
                self.complete(job, emitter, &output, file_name).await
            }
            Ok(WorkerExit::Failed { code }) => {
                warn!(job_id = %job.id, code = ?code, "worker failed");
                emitter.fail(DOWNLOAD_FAILED_MESSAGE).await;
                JobOutcome::Failed
            }
            Ok(WorkerExit::Cancelled) => {
                emitter.abort(ABORTED_MESSAGE).await;
                JobOutcome::Aborted
            }
            Ok(WorkerExit::TimedOut) => {
                warn!(job_id = %job.id, "worker timed out");
                emitter.abort(TIMED_OUT_MESSAGE).await;
                JobOutcome::Aborted
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "worker could not run");
                emitter.fail(SPAWN_FAILED_MESSAGE).await;
                JobOutcome::Failed
            }
        }
    }

    async fn complete(
        &self,
        job: &Job,
        emitter: &ProgressEmitter,
        output: &Path,
        file_name: String,
    ) -> JobOutcome {
        let size = match output_size(output).await {
            Ok(size) => size,
            Err(e) => {
                warn!(job_id = %job.id, path = %output.display(), error = %e, "worker exited without output");
                emitter.fail(OUTPUT_MISSING_MESSAGE).await;
                return JobOutcome::Failed;
            }
        };

        let result = DownloadResult {
            request_id: job.id.clone(),
            file_path: output.to_path_buf(),
            download_url: public_url(&self.storage.public_prefix, &file_name),
            file_name,
            title: job.title.clone(),
            cleanup_at: estimate_cleanup_at(
                size,
                self.storage.min_throughput_kbps,
                self.storage.cleanup_buffer_secs,
                unix_timestamp_secs(),
            ),
        };

        self.metrics.write().await.record_bytes(size);
        info!(job_id = %job.id, bytes = size, file = %result.file_name, "download complete");
        emitter.complete(result).await;
        JobOutcome::Completed
    }

    fn was_aborted(&self, job_id: &str, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.registry.is_aborted(job_id)
    }

    async fn finish(&self, job_id: &str) {
        self.registry.cleanup(job_id);
        self.registry.clear_aborted(job_id);
        self.bus.close(job_id).await;
    }
}

/// Returns the quality tier to use; audio jobs ignore quality.
fn validate(request: &JobRequest) -> Result<String, AdmissionError> {
    if request.url.trim().is_empty() {
        return Err(AdmissionError::Validation("url is required".to_string()));
    }
    let quality = request
        .quality
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if request.audio_only {
        return Ok(quality.to_string());
    }
    if quality.is_empty() {
        return Err(AdmissionError::Validation("quality is required".to_string()));
    }
    Ok(quality.to_string())
}
