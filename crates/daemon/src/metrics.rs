//! Metrics module for the Fetch Relay Daemon
//!
//! Live job table, slot usage, terminal counters and host load, kept in one
//! snapshot behind an async RwLock and served as JSON.

use crate::jobs::{unix_timestamp_ms, Job, JobStatus, ProgressEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job metrics for a job that has not reached a terminal state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub platform: String,
    pub title: String,
    pub method: String,
    pub audio_only: bool,
    pub status: JobStatus,
    pub percent: f32,
    pub created_unix_ms: i64,
    pub updated_unix_ms: i64,
}

impl JobMetrics {
    pub fn for_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            platform: job.platform.platform.clone(),
            title: job.title.clone(),
            method: job.method.to_string(),
            audio_only: job.audio_only,
            status: JobStatus::Queued,
            percent: 0.0,
            created_unix_ms: job.created_at,
            updated_unix_ms: job.created_at,
        }
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including jobs, system, and aggregate stats
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub slot_capacity: usize,
    pub slots_in_use: usize,
    pub queued_jobs: usize,
    pub active_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub aborted_jobs: u64,
    pub total_bytes_downloaded: u64,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            mem_usage_percent: 0.0,
            load_avg_1: 0.0,
            load_avg_5: 0.0,
            load_avg_15: 0.0,
        }
    }
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            jobs: Vec::new(),
            system: SystemMetrics::default(),
            slot_capacity: 0,
            slots_in_use: 0,
            queued_jobs: 0,
            active_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            aborted_jobs: 0,
            total_bytes_downloaded: 0,
        }
    }
}

impl MetricsSnapshot {
    /// Add a freshly admitted job.
    pub fn track_job(&mut self, job: &Job) {
        self.jobs.retain(|j| j.id != job.id);
        self.jobs.push(JobMetrics::for_job(job));
        self.recount();
    }

    /// Fold one emitted event into the job table and counters.
    ///
    /// Terminal events remove the job from the table.
    pub fn apply_event(&mut self, event: &ProgressEvent) {
        if event.status.is_terminal() {
            self.jobs.retain(|j| j.id != event.request_id);
            match event.status {
                JobStatus::Completed => self.completed_jobs += 1,
                JobStatus::Error => self.failed_jobs += 1,
                JobStatus::Aborted => self.aborted_jobs += 1,
                _ => {}
            }
        } else if let Some(job) = self.jobs.iter_mut().find(|j| j.id == event.request_id) {
            job.status = event.status;
            job.percent = event.percent;
            job.updated_unix_ms = event.timestamp_unix_ms;
        }
        self.recount();
    }

    pub fn record_bytes(&mut self, bytes: u64) {
        self.total_bytes_downloaded = self.total_bytes_downloaded.saturating_add(bytes);
    }

    fn recount(&mut self) {
        self.queued_jobs = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Queued)
            .count();
        self.active_jobs = self.jobs.len() - self.queued_jobs;
        self.timestamp_unix_ms = unix_timestamp_ms();
    }
}

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_platform;
    use proptest::prelude::*;

    fn job() -> Job {
        Job::new(
            "https://vimeo.com/1".to_string(),
            "720p".to_string(),
            classify_platform("https://vimeo.com/1"),
            "clip",
            false,
            None,
        )
    }

    #[test]
    fn test_job_lifecycle_counters() {
        let mut snapshot = MetricsSnapshot::default();
        let job = job();
        snapshot.track_job(&job);
        assert_eq!(snapshot.queued_jobs, 1);
        assert_eq!(snapshot.active_jobs, 0);

        snapshot.apply_event(&ProgressEvent::new(&job.id, JobStatus::Downloading, 40.0, None));
        assert_eq!(snapshot.queued_jobs, 0);
        assert_eq!(snapshot.active_jobs, 1);
        assert_eq!(snapshot.jobs[0].percent, 40.0);

        snapshot.apply_event(&ProgressEvent::new(&job.id, JobStatus::Completed, 100.0, None));
        assert!(snapshot.jobs.is_empty());
        assert_eq!(snapshot.completed_jobs, 1);
        assert_eq!(snapshot.active_jobs, 0);
    }

    #[test]
    fn test_terminal_counters_are_separate() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.apply_event(&ProgressEvent::new("a", JobStatus::Error, 0.0, None));
        snapshot.apply_event(&ProgressEvent::new("b", JobStatus::Aborted, 0.0, None));
        assert_eq!(snapshot.failed_jobs, 1);
        assert_eq!(snapshot.aborted_jobs, 1);
        assert_eq!(snapshot.completed_jobs, 0);
    }

    #[test]
    fn test_events_for_unknown_jobs_do_not_create_rows() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.apply_event(&ProgressEvent::new("ghost", JobStatus::Downloading, 10.0, None));
        assert!(snapshot.jobs.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_metrics_snapshot_round_trip(
            timestamp in any::<i64>(),
            slot_capacity in 1usize..100,
            slots_in_use in 0usize..100,
            completed_jobs in any::<u64>(),
            failed_jobs in any::<u64>(),
            aborted_jobs in any::<u64>(),
            total_bytes in any::<u64>(),
            cpu_usage in 0.0f32..100.0,
            mem_usage in 0.0f32..100.0,
            job_count in 0usize..5,
        ) {
            let jobs: Vec<JobMetrics> = (0..job_count).map(|i| JobMetrics {
                id: format!("job-{}", i),
                platform: "YouTube".to_string(),
                title: format!("clip {}", i),
                method: "separate_av".to_string(),
                audio_only: i % 2 == 0,
                status: JobStatus::Downloading,
                percent: 42.5,
                created_unix_ms: 1_700_000_000_000,
                updated_unix_ms: 1_700_000_001_000,
            }).collect();

            let snapshot = MetricsSnapshot {
                timestamp_unix_ms: timestamp,
                queued_jobs: 0,
                active_jobs: jobs.len(),
                jobs,
                system: SystemMetrics {
                    cpu_usage_percent: cpu_usage,
                    mem_usage_percent: mem_usage,
                    load_avg_1: 1.0,
                    load_avg_5: 0.5,
                    load_avg_15: 0.25,
                },
                slot_capacity,
                slots_in_use,
                completed_jobs,
                failed_jobs,
                aborted_jobs,
                total_bytes_downloaded: total_bytes,
            };

            let json = serde_json::to_string(&snapshot).expect("serialization should succeed");
            let deserialized: MetricsSnapshot = serde_json::from_str(&json)
                .expect("deserialization should succeed");
            prop_assert_eq!(snapshot, deserialized);
        }
    }
}
