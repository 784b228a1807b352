//! Job model and progress wire types.
//!
//! A job is created once per admitted request and lives only as long as the
//! request does; nothing here is persisted.

use crate::classify::{DownloadMethod, PlatformInfo};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Status tag carried by every progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a free slot.
    Queued,
    /// Slot acquired, worker being prepared.
    Initializing,
    /// Worker is transferring media.
    Downloading,
    /// Worker is merging or post-processing streams.
    Merging,
    /// Output is ready.
    Completed,
    /// Job failed.
    Error,
    /// Job was cancelled by its consumer.
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Initializing => "initializing",
            JobStatus::Downloading => "downloading",
            JobStatus::Merging => "merging",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Aborted => "aborted",
        }
    }

    /// Completed, error and aborted end a job's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Aborted
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result attached to the terminal `completed` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadResult {
    pub request_id: String,
    /// Server-local path of the finished file
    pub file_path: PathBuf,
    pub file_name: String,
    pub title: String,
    /// Public URL the file is served under
    pub download_url: String,
    /// Unix seconds after which the file may be swept
    pub cleanup_at: i64,
}

/// One progress update as delivered to a job's consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub request_id: String,
    pub status: JobStatus,
    pub percent: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp_unix_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DownloadResult>,
}

impl ProgressEvent {
    pub fn new(request_id: &str, status: JobStatus, percent: f32, message: Option<&str>) -> Self {
        Self {
            request_id: request_id.to_string(),
            status,
            percent: clamp_percent(percent),
            message: message.map(str::to_string),
            timestamp_unix_ms: unix_timestamp_ms(),
            result: None,
        }
    }

    pub fn with_result(mut self, result: DownloadResult) -> Self {
        self.result = Some(result);
        self
    }
}

/// Clamp into [0, 100]; NaN collapses to 0.
pub fn clamp_percent(percent: f32) -> f32 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// Inbound admission payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobRequest {
    pub url: String,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub audio_only: bool,
    /// Free-form user or session tag, only used for logging
    #[serde(default)]
    pub tag: Option<String>,
}

/// An admitted media fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Opaque, unguessable identifier handed to the client
    pub id: String,
    /// Canonicalized source URL
    pub url: String,
    /// Requested quality tier as sent by the client
    pub quality: String,
    pub platform: PlatformInfo,
    pub method: DownloadMethod,
    pub title: String,
    pub audio_only: bool,
    pub tag: Option<String>,
    pub created_at: i64,
}

impl Job {
    pub fn new(
        url: String,
        quality: String,
        platform: PlatformInfo,
        title: &str,
        audio_only: bool,
        tag: Option<String>,
    ) -> Self {
        let id = generate_job_id();
        let title = derive_title(title, &id);
        Self {
            method: platform.method,
            id,
            url,
            quality,
            platform,
            title,
            audio_only,
            tag,
            created_at: unix_timestamp_ms(),
        }
    }

    /// First eight characters of the id, used in file names and fallbacks.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(8);
        &self.id[..end]
    }
}

/// 128 random bits rendered as 32 lowercase hex characters.
pub fn generate_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn derive_title(title: &str, id: &str) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        format!("fetch_{}", &id[..id.len().min(8)])
    } else {
        trimmed.to_string()
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn unix_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Get current timestamp in seconds since Unix epoch.
pub fn unix_timestamp_secs() -> i64 {
    unix_timestamp_ms() / 1000
}
