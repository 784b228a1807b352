//! Job-id → consumer routing for progress events.
//!
//! A job has at most one sink at a time: a push socket ([`push`]) or a
//! bounded pull queue ([`pull`]). Registering a new sink supersedes the old
//! one. A push write that fails or times out counts as a consumer
//! disconnect and cancels the job.

pub mod pull;
pub mod push;

use crate::jobs::ProgressEvent;
use crate::registry::RequestRegistry;
use fetch_relay_daemon_config::TransportConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use pull::{PullReceiver, PullSink};
pub use push::{FrameWriter, PushSink};

/// Errors surfaced by a sink write.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("sink is closed")]
    Closed,

    #[error("pull queue is full")]
    QueueFull,

    #[error("socket error: {0}")]
    Socket(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Timing knobs for sinks, taken from `[transport]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub sink_wait: Duration,
    pub write_timeout: Duration,
    pub keepalive_interval: Duration,
    pub liveness_timeout: Duration,
    pub pull_buffer: usize,
    pub read_limit_bytes: usize,
}

impl From<&TransportConfig> for TransportSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            sink_wait: Duration::from_secs(config.sink_wait_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs.max(1)),
            liveness_timeout: Duration::from_secs(config.liveness_timeout_secs.max(1)),
            pull_buffer: config.pull_buffer.max(1),
            read_limit_bytes: config.read_limit_bytes,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

/// A registered consumer.
#[derive(Clone)]
pub enum Sink {
    Push(PushSink),
    Pull(PullSink),
}

impl Sink {
    pub fn id(&self) -> u64 {
        match self {
            Sink::Push(sink) => sink.id(),
            Sink::Pull(sink) => sink.id(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Sink::Push(_) => "push",
            Sink::Pull(_) => "pull",
        }
    }
}

/// Routes events from jobs to whichever sink is attached.
pub struct ProgressBus {
    sinks: Mutex<HashMap<String, Sink>>,
    attached: Notify,
    registry: Arc<RequestRegistry>,
    settings: TransportSettings,
    next_sink_id: AtomicU64,
}

impl ProgressBus {
    pub fn new(registry: Arc<RequestRegistry>, settings: TransportSettings) -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            attached: Notify::new(),
            registry,
            settings,
            next_sink_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Unique id for a sink about to be registered.
    pub fn next_sink_id(&self) -> u64 {
        self.next_sink_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Attach `sink` to `job_id`, retiring any sink it replaces.
    pub fn register(&self, job_id: &str, sink: Sink) {
        debug!(job_id, sink = sink.kind(), sink_id = sink.id(), "sink registered");
        let previous = self.sinks.lock().insert(job_id.to_string(), sink);
        if let Some(previous) = previous {
            debug!(job_id, sink_id = previous.id(), "previous sink superseded");
            retire(previous);
        }
        self.attached.notify_waiters();
    }

    /// Detach the sink only if `sink_id` is still the current mapping.
    pub fn unregister(&self, job_id: &str, sink_id: u64) -> bool {
        let mut sinks = self.sinks.lock();
        match sinks.get(job_id) {
            Some(current) if current.id() == sink_id => {
                sinks.remove(job_id);
                true
            }
            _ => false,
        }
    }

    pub fn has_sink(&self, job_id: &str) -> bool {
        self.sinks.lock().contains_key(job_id)
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Wait up to `timeout` for a sink to attach to `job_id`.
    ///
    /// Returns `false` on timeout or when `cancel` fires first.
    pub async fn wait_for_sink(
        &self,
        job_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.attached.notified();
            tokio::pin!(notified);
            // Register interest before checking so a concurrent register
            // between the check and the await is not missed.
            notified.as_mut().enable();

            if self.has_sink(job_id) {
                return true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.has_sink(job_id),
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Deliver `event` to the job's current sink, if any.
    ///
    /// Pull sinks drop progress events when their queue is full; the terminal
    /// event is always kept. A failed push
    /// write detaches the sink and cancels the job.
    pub async fn send(&self, job_id: &str, event: ProgressEvent) {
        let sink = self.sinks.lock().get(job_id).cloned();
        match sink {
            None => {
                debug!(job_id, status = %event.status, "no sink attached, event dropped");
            }
            Some(Sink::Pull(sink)) => {
                if let Err(err) = sink.offer(event) {
                    debug!(job_id, error = %err, "pull sink did not take event");
                }
            }
            Some(Sink::Push(sink)) => {
                if let Err(err) = sink.send_event(&event).await {
                    warn!(job_id, error = %err, "push write failed, treating as disconnect");
                    sink.drop_connection();
                    self.disconnect(job_id, sink.id());
                }
            }
        }
    }

    /// End of a job: detach its sink and close the transport.
    pub async fn close(&self, job_id: &str) {
        let sink = self.sinks.lock().remove(job_id);
        match sink {
            Some(Sink::Push(sink)) => sink.finish().await,
            // Dropping the last sender ends the pull stream.
            Some(Sink::Pull(_)) => {}
            None => {}
        }
    }

    /// A consumer went away. If `sink_id` was the job's current sink, the
    /// job is cancelled and flagged as aborted.
    pub fn disconnect(&self, job_id: &str, sink_id: u64) -> bool {
        if !self.unregister(job_id, sink_id) {
            return false;
        }
        debug!(job_id, sink_id, "consumer disconnected");
        self.registry.trigger(job_id);
        self.registry.mark_aborted(job_id);
        true
    }
}

fn retire(sink: Sink) {
    match sink {
        Sink::Push(sink) => sink.retire(),
        Sink::Pull(_) => {}
    }
}
