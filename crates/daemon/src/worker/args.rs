//! Worker argument templates
//!
//! Builds the downloader command line for each method family. Nothing here
//! spawns a process, so the argument lists can be checked directly.

use crate::classify::DownloadMethod;
use crate::jobs::Job;
use crate::quality::FormatChain;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Fragment count for audio extraction, independent of load.
pub const AUDIO_FRAGMENTS: u32 = 4;

/// Container the merge template produces.
pub const MERGE_CONTAINER: &str = "mp4";

/// Audio format the extraction template produces.
pub const AUDIO_FORMAT: &str = "mp3";

/// Selector used for raw passthrough streaming.
pub const PASSTHROUGH_SELECTOR: &str = "bv*+ba/b";

/// Argument template family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgTemplate {
    /// Best audio only, converted to mp3.
    ExtractAudio,
    /// Format chain download merged into an mp4 container.
    MergeFormats,
    /// Media written to stdout for relaying to the client.
    Passthrough,
}

/// Everything needed to run the worker once.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInvocation {
    pub url: String,
    pub template: ArgTemplate,
    /// Format selector expression (`-f`)
    pub format: String,
    pub concurrent_fragments: Option<u32>,
    /// Write segmented streams as MPEG-TS while downloading
    pub hls_use_mpegts: bool,
    /// Destination file; `None` means stdout
    pub output: Option<PathBuf>,
    pub cookies_from_browser: Option<String>,
}

impl WorkerInvocation {
    /// Invocation for an admitted job.
    ///
    /// Audio jobs always extract; video jobs merge. Direct single-stream
    /// sources skip fragment concurrency, segmented sources also keep
    /// MPEG-TS fragments.
    pub fn for_job(
        job: &Job,
        chain: &FormatChain,
        fragments: u32,
        output: &Path,
        cookies_from_browser: Option<String>,
    ) -> Self {
        if job.audio_only {
            return Self {
                url: job.url.clone(),
                template: ArgTemplate::ExtractAudio,
                format: "bestaudio".to_string(),
                concurrent_fragments: Some(AUDIO_FRAGMENTS),
                hls_use_mpegts: false,
                output: Some(output.to_path_buf()),
                cookies_from_browser,
            };
        }

        let (concurrent_fragments, hls_use_mpegts) = match job.method {
            DownloadMethod::Direct => (None, false),
            DownloadMethod::SeparateAv => (Some(fragments), false),
            DownloadMethod::Streaming => (Some(fragments), true),
        };

        Self {
            url: job.url.clone(),
            template: ArgTemplate::MergeFormats,
            format: chain.expression(),
            concurrent_fragments,
            hls_use_mpegts,
            output: Some(output.to_path_buf()),
            cookies_from_browser,
        }
    }

    /// Invocation that streams the best available media to stdout.
    pub fn passthrough(url: &str, cookies_from_browser: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            template: ArgTemplate::Passthrough,
            format: PASSTHROUGH_SELECTOR.to_string(),
            concurrent_fragments: None,
            hls_use_mpegts: false,
            output: None,
            cookies_from_browser,
        }
    }
}

/// Build the worker command for `invocation`.
///
/// The URL always comes last, after `--`, so it can never be read as an
/// option.
pub fn build_worker_command(binary: &str, invocation: &WorkerInvocation) -> Command {
    let mut cmd = Command::new(binary);

    cmd.arg("--no-playlist");
    match invocation.template {
        // Progress lines are parsed, so one per line.
        ArgTemplate::ExtractAudio | ArgTemplate::MergeFormats => {
            cmd.arg("--newline");
        }
        // stdout carries media; keep stderr quiet.
        ArgTemplate::Passthrough => {
            cmd.arg("--quiet").arg("--no-warnings");
        }
    }

    if let Some(browser) = &invocation.cookies_from_browser {
        cmd.arg("--cookies-from-browser").arg(browser);
    }

    cmd.arg("-f").arg(&invocation.format);

    match invocation.template {
        ArgTemplate::ExtractAudio => {
            cmd.arg("--extract-audio")
                .arg("--audio-format")
                .arg(AUDIO_FORMAT);
        }
        ArgTemplate::MergeFormats | ArgTemplate::Passthrough => {
            cmd.arg("--merge-output-format").arg(MERGE_CONTAINER);
        }
    }

    if let Some(n) = invocation.concurrent_fragments {
        cmd.arg("--concurrent-fragments").arg(n.to_string());
    }
    if invocation.hls_use_mpegts {
        cmd.arg("--hls-use-mpegts");
    }

    match &invocation.output {
        Some(path) => cmd.arg("-o").arg(path),
        None => cmd.arg("-o").arg("-"),
    };

    cmd.arg("--").arg(&invocation.url);
    cmd
}
