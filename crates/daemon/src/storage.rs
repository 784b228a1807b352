//! Downloads directory management.
//!
//! File naming, public URLs, retention estimates and the age-based sweeper.

use lazy_static::lazy_static;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use url::Url;
use walkdir::WalkDir;

lazy_static! {
    static ref UNSAFE_CHARS: Regex = Regex::new(r"[^\w\- ]+").expect("file name regex is valid");
}

/// Extensions of worker scratch files. Failed and aborted jobs leave them
/// behind for the sweeper; they are never served.
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".temp", ".ytdl"];

/// Create the downloads directory if missing.
pub async fn ensure_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

/// Replace runs of anything but letters, digits, `-`, `_` and spaces with
/// a single `_`. Letters include non-Latin scripts.
pub fn sanitize_file_name(name: &str) -> String {
    UNSAFE_CHARS.replace_all(name, "_").trim().to_string()
}

/// `<title>_<tag>.<ext>`; the tag keeps concurrent jobs with equal titles
/// apart and lets scratch files be found again.
pub fn output_file_name(title: &str, tag: &str, audio_only: bool) -> String {
    let ext = if audio_only { "mp3" } else { "mp4" };
    let mut stem = sanitize_file_name(title);
    if stem.is_empty() {
        stem = "fetch".to_string();
    }
    format!("{}_{}.{}", stem, tag, ext)
}

/// URL path under which `file_name` is served.
pub fn public_url(prefix: &str, file_name: &str) -> String {
    let segments: Vec<&str> = prefix.split('/').filter(|s| !s.is_empty()).collect();
    let encoded = Url::parse("http://localhost/").ok().and_then(|mut base| {
        base.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(segments.iter().copied())
            .push(file_name);
        Some(base.path().to_string())
    });
    encoded.unwrap_or_else(|| format!("/{}/{}", segments.join("/"), file_name))
}

/// Unix time after which a file of `size_bytes` may be deleted.
///
/// Transfer time at `min_kbps` KiB/s plus a fixed buffer.
pub fn estimate_cleanup_at(size_bytes: u64, min_kbps: u64, buffer_secs: u64, now_secs: i64) -> i64 {
    let rate = min_kbps.max(1) * 1024;
    let transfer = size_bytes / rate;
    now_secs + (transfer + buffer_secs) as i64
}

/// Size of a finished output, failing if it is missing or empty.
pub async fn output_size(path: &Path) -> io::Result<u64> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() || meta.len() == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is empty or not a file", path.display()),
        ));
    }
    Ok(meta.len())
}

/// Map a requested name to a file directly inside `dir`.
///
/// Anything with a path separator or parent reference is rejected.
pub fn resolve_served_file(dir: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
        || PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    {
        return None;
    }
    let path = dir.join(name);
    path.is_file().then_some(path)
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Delete regular files directly inside `dir` not modified for `max_age`.
pub fn sweep_older_than(dir: &Path, max_age: Duration) -> io::Result<SweepReport> {
    if !dir.exists() {
        return Ok(SweepReport::default());
    }
    let now = SystemTime::now();
    let mut report = SweepReport::default();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(modified) => modified,
            None => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= max_age {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                info!(path = %entry.path().display(), "removed expired download");
                report.removed += 1;
            }
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "failed to remove expired download");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("My Video: Part 1/2"), "My Video_ Part 1_2");
        assert_eq!(sanitize_file_name("  a<>b  "), "a_b");
        assert_eq!(sanitize_file_name("ویدیو جدید"), "ویدیو جدید");
        assert_eq!(sanitize_file_name("???"), "_");
        assert_eq!(sanitize_file_name(""), "");
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name("Clip", "ab12cd34", false), "Clip_ab12cd34.mp4");
        assert_eq!(output_file_name("Song", "ab12cd34", true), "Song_ab12cd34.mp3");
        assert_eq!(output_file_name("   ", "ab12cd34", false), "fetch_ab12cd34.mp4");
    }

    #[test]
    fn test_public_url_encodes_name() {
        assert_eq!(public_url("/downloads", "Clip_1.mp4"), "/downloads/Clip_1.mp4");
        assert_eq!(public_url("downloads/", "My Clip.mp4"), "/downloads/My%20Clip.mp4");
    }

    #[test]
    fn test_estimate_cleanup_at() {
        // 10 MiB at 50 KiB/s is 204 s, plus 120 s buffer.
        assert_eq!(estimate_cleanup_at(10 * 1024 * 1024, 50, 120, 1_000), 1_000 + 204 + 120);
        assert_eq!(estimate_cleanup_at(0, 50, 120, 0), 120);
        // Zero rate is treated as 1 KiB/s instead of dividing by zero.
        assert_eq!(estimate_cleanup_at(2048, 0, 0, 0), 2);
    }

    #[test]
    fn test_resolve_served_file_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ok.mp4"), b"x").unwrap();

        assert!(resolve_served_file(dir.path(), "ok.mp4").is_some());
        assert!(resolve_served_file(dir.path(), "missing.mp4").is_none());
        assert!(resolve_served_file(dir.path(), "../ok.mp4").is_none());
        assert!(resolve_served_file(dir.path(), "a/ok.mp4").is_none());
        assert!(resolve_served_file(dir.path(), ".hidden").is_none());
        assert!(resolve_served_file(dir.path(), "").is_none());
    }

    #[test]
    fn test_resolve_served_file_skips_partial_output() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Clip_ab12cd34.mp4.part"), b"x").unwrap();
        std::fs::write(dir.path().join("Clip_ab12cd34.f137.mp4.ytdl"), b"x").unwrap();

        assert!(resolve_served_file(dir.path(), "Clip_ab12cd34.mp4.part").is_none());
        assert!(resolve_served_file(dir.path(), "Clip_ab12cd34.f137.mp4.ytdl").is_none());
    }

    #[test]
    fn test_sweep_removes_only_old_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old.mp4"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let report = sweep_older_than(dir.path(), Duration::from_millis(10)).unwrap();
        assert_eq!(report, SweepReport { removed: 1, failed: 0 });
        assert!(dir.path().join("nested").exists());

        std::fs::write(dir.path().join("fresh.mp4"), b"x").unwrap();
        let report = sweep_older_than(dir.path(), Duration::from_secs(3600)).unwrap();
        assert_eq!(report.removed, 0);
        assert!(dir.path().join("fresh.mp4").exists());
    }

    #[test]
    fn test_sweep_missing_dir() {
        let report = sweep_older_than(Path::new("/nonexistent/downloads"), Duration::ZERO).unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_output_size_rejects_empty() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.mp4");
        std::fs::write(&empty, b"").unwrap();
        assert!(output_size(&empty).await.is_err());
        assert!(output_size(&dir.path().join("missing.mp4")).await.is_err());

        let full = dir.path().join("full.mp4");
        std::fs::write(&full, b"12345").unwrap();
        assert_eq!(output_size(&full).await.unwrap(), 5);
    }
}
