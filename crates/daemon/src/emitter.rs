//! Per-job event emission with a single terminal transition.
//!
//! Every event a job produces goes through one [`ProgressEmitter`]. It
//! keeps percents non-decreasing and lets exactly one terminal event
//! through, whichever path (completion, failure, abort, panic) gets there
//! first.

use crate::bus::ProgressBus;
use crate::jobs::{clamp_percent, DownloadResult, JobStatus, ProgressEvent};
use crate::metrics::SharedMetrics;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct EmitterState {
    last_percent: f32,
    terminal_sent: bool,
}

pub struct ProgressEmitter {
    job_id: String,
    bus: Arc<ProgressBus>,
    metrics: Option<SharedMetrics>,
    state: Mutex<EmitterState>,
}

impl ProgressEmitter {
    pub fn new(job_id: &str, bus: Arc<ProgressBus>, metrics: Option<SharedMetrics>) -> Self {
        Self {
            job_id: job_id.to_string(),
            bus,
            metrics,
            state: Mutex::new(EmitterState::default()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().terminal_sent
    }

    pub fn last_percent(&self) -> f32 {
        self.state.lock().last_percent
    }

    /// Emit a non-terminal update. Terminal statuses go through
    /// [`complete`](Self::complete), [`fail`](Self::fail) or
    /// [`abort`](Self::abort).
    pub async fn progress(&self, status: JobStatus, percent: f32, message: Option<&str>) -> bool {
        debug_assert!(!status.is_terminal());
        if status.is_terminal() {
            return false;
        }
        self.emit(status, percent, message, None).await
    }

    pub async fn complete(&self, result: DownloadResult) -> bool {
        self.emit(JobStatus::Completed, 100.0, Some("Download complete"), Some(result))
            .await
    }

    pub async fn fail(&self, message: &str) -> bool {
        self.emit(JobStatus::Error, 0.0, Some(message), None).await
    }

    pub async fn abort(&self, message: &str) -> bool {
        self.emit(JobStatus::Aborted, 0.0, Some(message), None).await
    }

    async fn emit(
        &self,
        status: JobStatus,
        percent: f32,
        message: Option<&str>,
        result: Option<DownloadResult>,
    ) -> bool {
        let event = {
            let mut state = self.state.lock();
            if state.terminal_sent {
                debug!(job_id = %self.job_id, status = %status, "event after terminal suppressed");
                return false;
            }
            if status.is_terminal() {
                state.terminal_sent = true;
            }
            let percent = clamp_percent(percent).max(state.last_percent);
            state.last_percent = percent;

            let mut event = ProgressEvent::new(&self.job_id, status, percent, message);
            event.result = result;
            event
        };

        if status.is_terminal() {
            info!(job_id = %self.job_id, status = %status, "job reached terminal state");
        }

        if let Some(metrics) = &self.metrics {
            metrics.write().await.apply_event(&event);
        }
        self.bus.send(&self.job_id, event).await;
        true
    }
}
