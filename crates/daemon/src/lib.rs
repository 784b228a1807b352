//! Fetch Relay Daemon
//!
//! Media-download orchestration service: admits fetch requests, runs the
//! external downloader under a global concurrency limit and streams
//! per-job progress to exactly one consumer.

pub mod bus;
pub mod classify;
pub mod daemon;
pub mod emitter;
pub mod job_executor;
pub mod jobs;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod progress;
pub mod quality;
pub mod registry;
pub mod server;
pub mod slots;
pub mod startup;
pub mod storage;
pub mod worker;

#[cfg(all(test, unix))]
mod test_support;

pub use fetch_relay_daemon_config as config;
pub use fetch_relay_daemon_config::Config;
pub use bus::{
    ProgressBus, PullReceiver, PullSink, PushSink, Sink, TransportError, TransportSettings,
};
pub use classify::{
    canonicalize_url, classify_platform, method_for, Confidence, ContentKind, DownloadMethod,
    PlatformInfo,
};
pub use daemon::{Daemon, DaemonError};
pub use emitter::ProgressEmitter;
pub use job_executor::{Admission, AdmissionError, JobExecutor, JobOutcome};
pub use jobs::{DownloadResult, Job, JobRequest, JobStatus, ProgressEvent};
pub use logging::init_logging;
pub use metadata::{
    ChainResolver, IframelyResolver, MediaInfo, MetadataError, MetadataResolver,
    WorkerMetadataResolver,
};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics,
    SystemMetrics,
};
pub use progress::{parse_progress_line, FilterDecision, ProgressFilter, ProgressSample};
pub use quality::{concurrent_fragments, select_format_chain, ChainStatus, FormatChain};
pub use registry::RequestRegistry;
pub use server::{create_router, run_server, ApiError, AppState, ServerError};
pub use slots::{Slot, SlotError, SlotLimiter};
pub use startup::{
    check_ffmpeg_available, check_worker_available, parse_ffmpeg_version, run_startup_checks,
    StartupError,
};
pub use worker::{
    build_worker_command, ArgTemplate, PassthroughStream, ProcessSupervisor, SupervisorError,
    WorkerExit, WorkerInvocation,
};
