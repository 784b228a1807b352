//! Pull sink: a bounded queue drained by a streaming HTTP response.
//!
//! Producers never block. When the queue is full a progress event is
//! dropped, so a slow reader loses intermediate updates rather than stalling
//! the job. The terminal event travels on its own one-shot slot and is
//! yielded after everything queued before it, so it survives a full queue.

use super::{ProgressBus, Sink, TransportError};
use crate::jobs::ProgressEvent;
use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Clone)]
pub struct PullSink {
    id: u64,
    tx: mpsc::Sender<ProgressEvent>,
    terminal: Arc<Mutex<Option<oneshot::Sender<ProgressEvent>>>>,
}

impl PullSink {
    pub fn channel(id: u64, capacity: usize) -> (Self, PullReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (terminal_tx, terminal_rx) = oneshot::channel();
        let sink = Self {
            id,
            tx,
            terminal: Arc::new(Mutex::new(Some(terminal_tx))),
        };
        let receiver = PullReceiver {
            rx,
            terminal: Some(terminal_rx),
        };
        (sink, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Non-blocking enqueue.
    ///
    /// Progress events are dropped with [`TransportError::QueueFull`] when the
    /// queue is full. A terminal event is always accepted once.
    pub fn offer(&self, event: ProgressEvent) -> Result<(), TransportError> {
        if event.status.is_terminal() {
            let sender = self.terminal.lock().take().ok_or(TransportError::Closed)?;
            return sender.send(event).map_err(|_| TransportError::Closed);
        }

        self.tx.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// Reading half of a [`PullSink`].
pub struct PullReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
    terminal: Option<oneshot::Receiver<ProgressEvent>>,
}

impl PullReceiver {
    /// Next event in send order. Returns `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        let Some(terminal) = self.terminal.as_mut() else {
            // Nothing is delivered after the terminal event.
            while self.rx.recv().await.is_some() {}
            return None;
        };
        let event = tokio::select! {
            biased;
            Some(event) = self.rx.recv() => return Some(event),
            event = terminal => event.ok(),
        };
        self.terminal = None;
        event
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        if let Ok(event) = self.rx.try_recv() {
            return Some(event);
        }
        let event = self.terminal.as_mut()?.try_recv().ok()?;
        self.terminal = None;
        Some(event)
    }
}

/// Detaches the sink when the response stream is dropped.
///
/// A reader that goes away before seeing a terminal event counts as a
/// consumer disconnect.
struct StreamGuard {
    job_id: String,
    sink_id: u64,
    bus: Arc<ProgressBus>,
    saw_terminal: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.saw_terminal {
            self.bus.unregister(&self.job_id, self.sink_id);
        } else if self.bus.disconnect(&self.job_id, self.sink_id) {
            info!(job_id = %self.job_id, "pull consumer left before completion, job cancelled");
        }
    }
}

/// Register a pull sink for `job_id` and return its event stream.
///
/// The stream ends once the job closes the queue or the sink is superseded.
pub fn subscribe(bus: Arc<ProgressBus>, job_id: &str) -> impl Stream<Item = ProgressEvent> + Send {
    let capacity = bus.settings().pull_buffer;
    let (sink, rx) = PullSink::channel(bus.next_sink_id(), capacity);
    let guard = StreamGuard {
        job_id: job_id.to_string(),
        sink_id: sink.id(),
        bus: bus.clone(),
        saw_terminal: false,
    };
    bus.register(job_id, Sink::Pull(sink));
    debug!(job_id, sink_id = guard.sink_id, "pull consumer connected");

    stream::unfold((rx, guard), |(mut rx, mut guard)| async move {
        let event = rx.recv().await?;
        if event.status.is_terminal() {
            guard.saw_terminal = true;
        }
        Some((event, (rx, guard)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TransportSettings;
    use crate::jobs::JobStatus;
    use crate::registry::RequestRegistry;
    use futures_util::StreamExt;
    use tokio_util::sync::CancellationToken;

    fn bus(pull_buffer: usize) -> Arc<ProgressBus> {
        let settings = TransportSettings {
            pull_buffer,
            ..TransportSettings::default()
        };
        Arc::new(ProgressBus::new(Arc::new(RequestRegistry::new()), settings))
    }

    fn event(status: JobStatus, percent: f32) -> ProgressEvent {
        ProgressEvent::new("job", status, percent, None)
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (sink, mut rx) = PullSink::channel(1, 2);
        assert!(sink.offer(event(JobStatus::Downloading, 1.0)).is_ok());
        assert!(sink.offer(event(JobStatus::Downloading, 2.0)).is_ok());
        assert!(matches!(
            sink.offer(event(JobStatus::Downloading, 3.0)),
            Err(TransportError::QueueFull)
        ));

        assert_eq!(rx.try_recv().map(|e| e.percent), Some(1.0));
        assert_eq!(rx.try_recv().map(|e| e.percent), Some(2.0));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_offer_after_receiver_dropped() {
        let (sink, rx) = PullSink::channel(1, 2);
        drop(rx);
        assert!(matches!(
            sink.offer(event(JobStatus::Downloading, 1.0)),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_terminal_survives_full_queue() {
        let (sink, mut rx) = PullSink::channel(1, 1);
        assert!(sink.offer(event(JobStatus::Downloading, 10.0)).is_ok());
        assert!(sink.offer(event(JobStatus::Downloading, 20.0)).is_err());
        assert!(sink.offer(event(JobStatus::Completed, 100.0)).is_ok());
        assert!(matches!(
            sink.offer(event(JobStatus::Error, 0.0)),
            Err(TransportError::Closed)
        ));
        drop(sink);

        assert_eq!(rx.recv().await.map(|e| e.percent), Some(10.0));
        assert_eq!(rx.recv().await.map(|e| e.status), Some(JobStatus::Completed));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stalled_reader_still_gets_terminal_last() {
        let bus = bus(2);
        let stream = subscribe(bus.clone(), "job");

        // Nothing reads until the job has closed the sink.
        bus.send("job", event(JobStatus::Queued, 0.0)).await;
        bus.send("job", event(JobStatus::Downloading, 10.0)).await;
        bus.send("job", event(JobStatus::Downloading, 55.0)).await;
        bus.send("job", event(JobStatus::Completed, 100.0)).await;
        bus.close("job").await;

        let statuses: Vec<JobStatus> = stream.map(|e| e.status).collect().await;
        assert_eq!(
            statuses,
            vec![JobStatus::Queued, JobStatus::Downloading, JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_stream_ends_when_job_closes() {
        let bus = bus(20);
        let stream = subscribe(bus.clone(), "job");
        futures_util::pin_mut!(stream);

        bus.send("job", event(JobStatus::Downloading, 10.0)).await;
        bus.send("job", event(JobStatus::Completed, 100.0)).await;
        bus.close("job").await;

        let events: Vec<ProgressEvent> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_dropping_stream_before_terminal_cancels_job() {
        let bus = bus(20);
        let token = CancellationToken::new();
        bus.registry().register("job", token.clone());

        let stream = subscribe(bus.clone(), "job");
        assert!(bus.has_sink("job"));
        drop(stream);

        assert!(token.is_cancelled());
        assert!(bus.registry().is_aborted("job"));
        assert!(!bus.has_sink("job"));
    }

    #[tokio::test]
    async fn test_dropping_stream_after_terminal_is_quiet() {
        let bus = bus(20);
        let token = CancellationToken::new();
        bus.registry().register("job", token.clone());

        let mut stream = Box::pin(subscribe(bus.clone(), "job"));
        bus.send("job", event(JobStatus::Aborted, 0.0)).await;
        let last = stream.next().await.unwrap();
        assert_eq!(last.status, JobStatus::Aborted);
        drop(stream);

        assert!(!token.is_cancelled());
        assert!(!bus.registry().is_aborted("job"));
    }
}
