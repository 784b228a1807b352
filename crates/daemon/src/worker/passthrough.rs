//! Raw passthrough: the worker writes media to stdout and the bytes are
//! relayed straight to the HTTP client.

use super::args::WorkerInvocation;
use super::supervisor::{ProcessSupervisor, SupervisorError};
use crate::slots::Slot;
use axum::body::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// A running passthrough worker whose first chunk has already arrived.
pub struct PassthroughStream {
    child: Child,
    reader: ReaderStream<ChildStdout>,
    first: Bytes,
}

impl ProcessSupervisor {
    /// Start a passthrough worker and wait for its first chunk of media.
    ///
    /// A worker that exits without writing anything is reported as
    /// [`SupervisorError::NoOutput`] so the caller can fail the request
    /// before sending headers.
    pub async fn spawn_passthrough(&self, url: &str) -> Result<PassthroughStream, SupervisorError> {
        let invocation = WorkerInvocation::passthrough(url, self.cookies_from_browser());
        let mut child = self.command(&invocation).spawn().map_err(SupervisorError::Spawn)?;
        info!(url, pid = ?child.id(), "passthrough worker started");

        let stdout = child.stdout.take().ok_or(SupervisorError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "passthrough worker stderr");
                }
            });
        }

        let mut reader = ReaderStream::new(stdout);
        match reader.next().await {
            Some(Ok(first)) => Ok(PassthroughStream {
                child,
                reader,
                first,
            }),
            Some(Err(e)) => Err(SupervisorError::Wait(e)),
            None => {
                let status = child.wait().await.map_err(SupervisorError::Wait)?;
                Err(SupervisorError::NoOutput(status.code()))
            }
        }
    }
}

impl PassthroughStream {
    /// Body stream for the response. The worker is killed if the stream is
    /// dropped early; `slot` is held until the stream ends.
    pub fn into_body(self, slot: Option<Slot>) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        let Self {
            child,
            reader,
            first,
        } = self;

        let rest = stream::unfold(
            (reader, child, slot),
            |(mut reader, mut child, slot)| async move {
                match reader.next().await {
                    Some(chunk) => Some((chunk, (reader, child, slot))),
                    None => {
                        match child.wait().await {
                            Ok(status) => debug!(status = %status, "passthrough worker exited"),
                            Err(e) => debug!(error = %e, "passthrough worker wait failed"),
                        }
                        drop(slot);
                        None
                    }
                }
            },
        );

        stream::once(async move { Ok(first) }).chain(rest)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::fake_worker;
    use fetch_relay_daemon_config::ProgressConfig;
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir, body: &str) -> ProcessSupervisor {
        let bin = fake_worker(dir.path(), body);
        ProcessSupervisor::new(bin.to_str().unwrap(), &ProgressConfig::default(), None)
    }

    #[tokio::test]
    async fn test_relays_all_bytes() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "printf 'abc'\nprintf 'def'");

        let stream = sup.spawn_passthrough("https://vimeo.com/1").await.unwrap();
        let chunks: Vec<Bytes> = stream
            .into_body(None)
            .map(|c| c.unwrap())
            .collect()
            .await;
        let body: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(body, b"abcdef");
    }

    #[tokio::test]
    async fn test_no_output_is_an_error() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "echo 'ERROR: nope' >&2\nexit 1");

        let result = sup.spawn_passthrough("https://vimeo.com/1").await;
        assert!(matches!(result, Err(SupervisorError::NoOutput(Some(1)))));
    }
}
