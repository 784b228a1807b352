//! Startup checks module for the Fetch Relay Daemon
//!
//! Preflight checks run before the server binds:
//! - Downloader availability (`<worker> --version`)
//! - FFmpeg availability, needed by the worker for merging and audio extraction
//! - Downloads directory is creatable and writable

use fetch_relay_daemon_config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Downloader not available: {0}")]
    WorkerUnavailable(String),

    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("Downloads directory unusable: {0}")]
    DownloadsDir(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Check the downloader runs and return its reported version.
pub fn check_worker_available(binary: &str) -> Result<String, StartupError> {
    let output = Command::new(binary).arg("--version").output().map_err(|e| {
        StartupError::WorkerUnavailable(format!(
            "{} --version failed; is it installed and in PATH? Error: {}",
            binary, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::WorkerUnavailable(format!(
            "{} --version exited with {}",
            binary, output.status
        )));
    }

    let version = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    Ok(version)
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
/// - Distro builds: "ffmpeg version 4.4.2-0ubuntu0.22.04.1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Check FFmpeg runs; returns its major version when it can be parsed.
pub fn check_ffmpeg_available(binary: &str) -> Result<Option<u32>, StartupError> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::FfmpegUnavailable(format!("Failed to run {} -version: {}", binary, e)))?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} -version exited with {}",
            binary, output.status
        )));
    }

    Ok(parse_ffmpeg_version(&String::from_utf8_lossy(&output.stdout)))
}

/// Create the downloads directory if needed and make sure files can be
/// written into it.
pub fn check_downloads_dir(dir: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| StartupError::DownloadsDir(format!("cannot create {}: {}", dir.display(), e)))?;

    let probe = dir.join(".write-probe");
    std::fs::write(&probe, b"")
        .map_err(|e| StartupError::DownloadsDir(format!("cannot write to {}: {}", dir.display(), e)))?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Downloads directory
/// 2. Downloader availability
/// 3. FFmpeg availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_downloads_dir(&cfg.storage.downloads_dir)?;

    let version = check_worker_available(&cfg.worker.binary)?;
    info!(binary = %cfg.worker.binary, version = %version, "downloader available");

    let ffmpeg_major = check_ffmpeg_available(&cfg.worker.ffmpeg_binary)?;
    info!(binary = %cfg.worker.ffmpeg_binary, major = ?ffmpeg_major, "ffmpeg available");

    Ok(())
}
