//! Push sink over a full-duplex socket.
//!
//! The job side writes events through [`PushSink`]; the connection side runs
//! [`run_session`], which keeps the socket alive with pings, enforces the
//! liveness window and reports a disconnect to the bus when the client goes
//! away.

use super::{ProgressBus, Sink, TransportError, TransportSettings};
use crate::jobs::ProgressEvent;
use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, Stream, StreamExt};
use futures_util::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

/// Outbound half of a socket.
#[async_trait]
pub trait FrameWriter: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn send_ping(&mut self) -> Result<(), TransportError>;
    async fn send_close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl FrameWriter for SplitSink<WebSocket, Message> {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }

    async fn send_close(&mut self) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "done".into(),
        };
        self.send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }
}

enum Frame {
    Text(String),
    Ping,
}

struct PushInner {
    id: u64,
    writer: Mutex<Box<dyn FrameWriter>>,
    write_timeout: Duration,
    /// Fires when the session should stop: finished, retired or failed.
    dropped: CancellationToken,
    finished: AtomicBool,
    close_sent: AtomicBool,
}

/// Cloneable handle to one socket's outbound half.
#[derive(Clone)]
pub struct PushSink {
    inner: Arc<PushInner>,
}

impl PushSink {
    pub fn new(id: u64, writer: Box<dyn FrameWriter>, write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PushInner {
                id,
                writer: Mutex::new(writer),
                write_timeout,
                dropped: CancellationToken::new(),
                finished: AtomicBool::new(false),
                close_sent: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Serialize and write one event within the write deadline.
    pub async fn send_event(&self, event: &ProgressEvent) -> Result<(), TransportError> {
        let text = serde_json::to_string(event)?;
        self.write(Frame::Text(text)).await
    }

    pub async fn ping(&self) -> Result<(), TransportError> {
        self.write(Frame::Ping).await
    }

    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        if self.inner.close_sent.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        let op = async {
            match frame {
                Frame::Text(text) => writer.send_text(text).await,
                Frame::Ping => writer.send_ping().await,
            }
        };
        match tokio::time::timeout(self.inner.write_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::WriteTimeout(self.inner.write_timeout)),
        }
    }

    /// Job finished normally: send a close frame and end the session.
    pub async fn finish(&self) {
        self.inner.finished.store(true, Ordering::Release);
        self.send_close().await;
        self.inner.dropped.cancel();
    }

    /// Superseded by a newer sink for the same job.
    pub fn retire(&self) {
        self.inner.dropped.cancel();
    }

    /// A write failed; the session should tear the socket down.
    pub fn drop_connection(&self) {
        self.inner.dropped.cancel();
    }

    pub fn is_dropped(&self) -> bool {
        self.inner.dropped.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> WaitForCancellationFuture<'_> {
        self.inner.dropped.cancelled()
    }

    /// Send the close frame once; later calls do nothing.
    async fn send_close(&self) {
        if self.inner.close_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.inner.writer.lock().await;
        match tokio::time::timeout(self.inner.write_timeout, writer.send_close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(sink_id = self.inner.id, error = %err, "close frame not sent"),
            Err(_) => debug!(sink_id = self.inner.id, "close frame timed out"),
        }
    }
}

/// Attach a connected socket to `job_id` and serve it until it goes away.
pub async fn serve_socket(socket: WebSocket, job_id: String, bus: Arc<ProgressBus>) {
    let (writer, reader) = socket.split();
    let settings = *bus.settings();
    let sink = PushSink::new(bus.next_sink_id(), Box::new(writer), settings.write_timeout);
    run_session(reader, sink, job_id, bus).await;
}

/// Session loop for one push sink.
///
/// Any inbound frame refreshes the liveness deadline. The loop ends when
/// the client closes, the deadline passes, a ping fails, or the job side
/// drops the sink. If this sink was still attached at that point, the job
/// is cancelled and flagged aborted.
pub async fn run_session<S, E>(mut inbound: S, sink: PushSink, job_id: String, bus: Arc<ProgressBus>)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let settings: TransportSettings = *bus.settings();
    bus.register(&job_id, Sink::Push(sink.clone()));
    info!(job_id = %job_id, sink_id = sink.id(), "push consumer connected");

    let mut keepalive = tokio::time::interval_at(
        Instant::now() + settings.keepalive_interval,
        settings.keepalive_interval,
    );
    let liveness = tokio::time::sleep(settings.liveness_timeout);
    tokio::pin!(liveness);

    loop {
        tokio::select! {
            _ = sink.dropped() => {
                debug!(job_id = %job_id, "push sink dropped by job side");
                break;
            }
            _ = &mut liveness => {
                warn!(job_id = %job_id, "no frames within liveness window");
                break;
            }
            _ = keepalive.tick() => {
                if let Err(err) = sink.ping().await {
                    warn!(job_id = %job_id, error = %err, "keepalive ping failed");
                    break;
                }
            }
            frame = inbound.next() => match frame {
                Some(Ok(Message::Close(_))) | None => {
                    debug!(job_id = %job_id, "client closed socket");
                    break;
                }
                Some(Ok(_)) => {
                    liveness.as_mut().reset(Instant::now() + settings.liveness_timeout);
                }
                Some(Err(err)) => {
                    debug!(job_id = %job_id, error = %err, "socket read failed");
                    break;
                }
            },
        }
    }

    if bus.disconnect(&job_id, sink.id()) {
        info!(job_id = %job_id, "push consumer left before completion, job cancelled");
    }
    sink.send_close().await;
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingWriter;
    use super::*;
    use crate::registry::RequestRegistry;
    use tokio::sync::mpsc;

    fn bus(settings: TransportSettings) -> Arc<ProgressBus> {
        Arc::new(ProgressBus::new(Arc::new(RequestRegistry::new()), settings))
    }

    fn fast_settings() -> TransportSettings {
        TransportSettings {
            write_timeout: Duration::from_millis(50),
            keepalive_interval: Duration::from_millis(20),
            liveness_timeout: Duration::from_millis(80),
            ..TransportSettings::default()
        }
    }

    type Inbound = futures_util::stream::BoxStream<'static, Result<Message, String>>;

    fn channel_stream() -> (mpsc::UnboundedSender<Result<Message, String>>, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, stream.boxed())
    }

    #[tokio::test]
    async fn test_client_close_cancels_running_job() {
        let bus = bus(fast_settings());
        let token = CancellationToken::new();
        bus.registry().register("job", token.clone());

        let (tx, inbound) = channel_stream();
        let sink = PushSink::new(bus.next_sink_id(), Box::new(RecordingWriter::new()), Duration::from_millis(50));
        let session = tokio::spawn(run_session(inbound, sink, "job".to_string(), bus.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bus.has_sink("job"));

        tx.send(Ok(Message::Close(None))).unwrap();
        session.await.unwrap();

        assert!(token.is_cancelled());
        assert!(bus.registry().is_aborted("job"));
        assert!(!bus.has_sink("job"));
    }

    #[tokio::test]
    async fn test_liveness_timeout_ends_session() {
        let bus = bus(fast_settings());
        let token = CancellationToken::new();
        bus.registry().register("job", token.clone());

        let writer = RecordingWriter::new();
        let frames = writer.frames();
        let sink = PushSink::new(bus.next_sink_id(), Box::new(writer), Duration::from_millis(50));
        let (_tx, inbound) = channel_stream();

        tokio::time::timeout(
            Duration::from_secs(2),
            run_session(inbound, sink, "job".to_string(), bus.clone()),
        )
        .await
        .expect("session should end on liveness timeout");

        assert!(token.is_cancelled());
        assert!(frames.lock().iter().any(|f| f == "<ping>"));
    }

    #[tokio::test]
    async fn test_pongs_keep_session_alive() {
        let bus = bus(fast_settings());
        let (tx, inbound) = channel_stream();
        let sink = PushSink::new(bus.next_sink_id(), Box::new(RecordingWriter::new()), Duration::from_millis(50));
        let session = tokio::spawn(run_session(inbound, sink, "job".to_string(), bus.clone()));

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            tx.send(Ok(Message::Pong(Vec::new()))).unwrap();
        }
        assert!(!session.is_finished());
        assert!(bus.has_sink("job"));

        drop(tx);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_job_does_not_abort() {
        let bus = bus(fast_settings());
        let token = CancellationToken::new();
        bus.registry().register("job", token.clone());

        let (_tx, inbound) = channel_stream();
        let sink = PushSink::new(bus.next_sink_id(), Box::new(RecordingWriter::new()), Duration::from_millis(50));
        let session = tokio::spawn(run_session(inbound, sink, "job".to_string(), bus.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.close("job").await;
        session.await.unwrap();

        assert!(!token.is_cancelled());
        assert!(!bus.registry().is_aborted("job"));
    }

    #[tokio::test]
    async fn test_superseded_session_does_not_abort() {
        let bus = bus(fast_settings());
        let token = CancellationToken::new();
        bus.registry().register("job", token.clone());

        let (_tx, inbound) = channel_stream();
        let old = PushSink::new(bus.next_sink_id(), Box::new(RecordingWriter::new()), Duration::from_millis(50));
        let session = tokio::spawn(run_session(inbound, old, "job".to_string(), bus.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let newer = PushSink::new(bus.next_sink_id(), Box::new(RecordingWriter::new()), Duration::from_millis(50));
        bus.register("job", Sink::Push(newer.clone()));
        session.await.unwrap();

        assert!(!token.is_cancelled());
        assert!(bus.has_sink("job"));
    }

    #[tokio::test]
    async fn test_write_after_close_is_rejected() {
        let sink = PushSink::new(1, Box::new(RecordingWriter::new()), Duration::from_millis(50));
        sink.finish().await;
        let event = ProgressEvent::new("job", crate::jobs::JobStatus::Downloading, 1.0, None);
        assert!(matches!(sink.send_event(&event).await, Err(TransportError::Closed)));
    }
}
