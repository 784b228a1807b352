//! Per-job cancellation handles and abort flags.
//!
//! Two independently locked maps: live cancel handles, and abort flags
//! recorded when a consumer goes away. Handles are always cancelled after
//! the lock is released.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Abort flags older than this are pruned on the next insert.
pub const ABORT_FLAG_TTL: Duration = Duration::from_secs(600);

/// Owns every in-flight job's cancel handle.
#[derive(Debug)]
pub struct RequestRegistry {
    handles: Mutex<HashMap<String, CancellationToken>>,
    aborted: Mutex<HashMap<String, Instant>>,
    abort_ttl: Duration,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::with_abort_ttl(ABORT_FLAG_TTL)
    }

    pub fn with_abort_ttl(abort_ttl: Duration) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            aborted: Mutex::new(HashMap::new()),
            abort_ttl,
        }
    }

    /// Store `handle` for `job_id`, replacing any previous one.
    pub fn register(&self, job_id: &str, handle: CancellationToken) {
        self.handles.lock().insert(job_id.to_string(), handle);
    }

    /// Remove and cancel the handle. Returns whether a handle was present.
    pub fn trigger(&self, job_id: &str) -> bool {
        let handle = self.handles.lock().remove(job_id);
        match handle {
            Some(handle) => {
                debug!(job_id, "cancel handle triggered");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the handle without cancelling it.
    pub fn cleanup(&self, job_id: &str) {
        self.handles.lock().remove(job_id);
    }

    pub fn is_registered(&self, job_id: &str) -> bool {
        self.handles.lock().contains_key(job_id)
    }

    pub fn mark_aborted(&self, job_id: &str) {
        let now = Instant::now();
        let ttl = self.abort_ttl;
        let mut aborted = self.aborted.lock();
        aborted.retain(|_, marked_at| now.duration_since(*marked_at) < ttl);
        aborted.insert(job_id.to_string(), now);
    }

    pub fn is_aborted(&self, job_id: &str) -> bool {
        self.aborted.lock().contains_key(job_id)
    }

    pub fn clear_aborted(&self, job_id: &str) {
        self.aborted.lock().remove(job_id);
    }

    pub fn active_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn aborted_count(&self) -> usize {
        self.aborted.lock().len()
    }
}
