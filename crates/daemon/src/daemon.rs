//! Daemon startup and background tasks for the Fetch Relay Daemon
//!
//! Wires the engine together, then runs the HTTP server alongside the
//! metrics updater and the downloads sweeper.

use crate::bus::{ProgressBus, TransportSettings};
use crate::config::{Config, ConfigError};
use crate::job_executor::JobExecutor;
use crate::jobs::unix_timestamp_ms;
use crate::metrics::{collect_system_metrics, MetricsSnapshot, SharedMetrics};
use crate::registry::RequestRegistry;
use crate::server::{create_router, parse_bind, run_server, AppState, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use crate::storage::sweep_older_than;
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Metrics refresh period.
const METRICS_REFRESH: Duration = Duration::from_millis(500);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    /// Admits and runs download jobs
    pub executor: Arc<JobExecutor>,
}

impl Daemon {
    /// Load configuration from `config_path`, run startup checks and build
    /// the daemon.
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::new(config)
    }

    /// Run startup checks against `config`, then build the daemon.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config))
    }

    /// Build the daemon without running startup checks
    ///
    /// Useful for testing when the downloader and ffmpeg are not installed.
    pub fn new_without_checks(config: Config) -> Self {
        let metrics: SharedMetrics = Arc::new(RwLock::new(MetricsSnapshot {
            slot_capacity: config.limits.max_concurrent_jobs.max(1) as usize,
            ..MetricsSnapshot::default()
        }));
        let bus = Arc::new(ProgressBus::new(
            Arc::new(RequestRegistry::new()),
            TransportSettings::from(&config.transport),
        ));
        let executor = Arc::new(JobExecutor::new(&config, bus, metrics.clone()));

        Self {
            config,
            metrics,
            executor,
        }
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Router serving every endpoint of the daemon.
    pub fn router(&self) -> Router {
        create_router(AppState {
            executor: Arc::clone(&self.executor),
        })
    }

    /// Start the metrics update task
    ///
    /// Periodically refreshes system metrics and slot usage in the shared
    /// state.
    pub fn start_metrics_updater(&self) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let slots = self.executor.slots().clone();
        tokio::spawn(async move {
            loop {
                let system_metrics = collect_system_metrics();
                {
                    let mut snapshot = metrics.write().await;
                    snapshot.system = system_metrics;
                    snapshot.slot_capacity = slots.capacity();
                    snapshot.slots_in_use = slots.in_use();
                    snapshot.timestamp_unix_ms = unix_timestamp_ms();
                }
                tokio::time::sleep(METRICS_REFRESH).await;
            }
        })
    }

    /// Start the downloads sweeper
    ///
    /// Deletes files older than `storage.retention_hours` every
    /// `storage.sweep_interval_secs`.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let dir = self.config.storage.downloads_dir.clone();
        let max_age = Duration::from_secs(self.config.storage.retention_hours * 3600);
        let period = Duration::from_secs(self.config.storage.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let dir = dir.clone();
                match tokio::task::spawn_blocking(move || sweep_older_than(&dir, max_age)).await {
                    Ok(Ok(report)) if report.removed > 0 || report.failed > 0 => {
                        info!(removed = report.removed, failed = report.failed, "downloads swept");
                    }
                    Ok(Ok(_)) => debug!("downloads sweep found nothing to remove"),
                    Ok(Err(e)) => warn!(error = %e, "downloads sweep failed"),
                    Err(e) => warn!(error = %e, "downloads sweep task failed"),
                }
            }
        })
    }

    /// Run the daemon with all background tasks
    ///
    /// Starts the metrics updater and sweeper, then serves HTTP until the
    /// server stops.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let addr = parse_bind(&self.config.server.bind)?;

        let updater = self.start_metrics_updater();
        let sweeper = self.start_sweeper();

        info!(
            %addr,
            max_concurrent_jobs = self.executor.slots().capacity(),
            downloads_dir = %self.config.storage.downloads_dir.display(),
            "daemon starting"
        );
        let result = run_server(addr, self.router()).await;

        updater.abort();
        sweeper.abort();
        result.map_err(DaemonError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.limits.max_concurrent_jobs = 3;
        config.storage.downloads_dir = dir.path().join("downloads");
        config
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let daemon = Daemon::new_without_checks(config.clone());

        assert_eq!(daemon.config, config);
        assert_eq!(daemon.executor.slots().capacity(), 3);
        assert_eq!(daemon.executor.slots().available(), 3);
    }

    #[tokio::test]
    async fn test_daemon_metrics_initialized() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(&dir));

        let metrics = daemon.metrics.read().await;
        assert_eq!(metrics.jobs.len(), 0);
        assert_eq!(metrics.slot_capacity, 3);
        assert_eq!(metrics.completed_jobs, 0);
        assert_eq!(metrics.failed_jobs, 0);
    }

    #[tokio::test]
    async fn test_metrics_updater_refreshes_snapshot() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(&dir));
        let _slot = daemon.executor.slots().try_acquire().unwrap();

        let handle = daemon.start_metrics_updater();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        let metrics = daemon.metrics.read().await;
        assert!(metrics.timestamp_unix_ms > 1577836800000);
        assert_eq!(metrics.slots_in_use, 1);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_files() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.storage.retention_hours = 0;
        config.storage.sweep_interval_secs = 1;
        std::fs::create_dir_all(&config.storage.downloads_dir).unwrap();
        let stale = config.storage.downloads_dir.join("Old_ab12cd34.mp4");
        std::fs::write(&stale, b"x").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let daemon = Daemon::new_without_checks(config);
        let handle = daemon.start_sweeper();

        tokio::time::timeout(Duration::from_secs(5), async {
            while stale.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        handle.abort();
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.server.bind = "not-an-address".to_string();
        let daemon = Daemon::new_without_checks(config);

        let err = daemon.run_with_server().await.unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Server(ServerError::InvalidAddress(_))
        ));
    }
}
