//! Worker output parsing and progress filtering.
//!
//! [`parse_progress_line`] is a pure line → sample function. [`ProgressFilter`]
//! applies the fragment, monotonicity and rate-limit rules; it takes the
//! current instant as an argument so it can be driven deterministically.

use lazy_static::lazy_static;
use regex::Regex;
use std::time::{Duration, Instant};

lazy_static! {
    // Accepts "%%" as well as "%", and an optional "of [~] <size><unit>".
    static ref PROGRESS_RE: Regex = Regex::new(
        r"(?P<pct>\d+(?:\.\d+)?)%+(?:\s+of\s+~?\s*(?P<size>\d+(?:\.\d+)?)\s*(?P<unit>[KMGT]i?B|B)\b)?"
    )
    .expect("progress regex is valid");
}

/// Minimum interval between forwarded non-final updates.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// A 100% sample with a smaller size than this is a sub-fragment.
pub const DEFAULT_FRAGMENT_THRESHOLD: u64 = 1024 * 1024;

/// One percentage reading extracted from a worker line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub percent: f32,
    pub size_bytes: Option<u64>,
}

/// Extract a percentage and optional transfer size from a worker line.
///
/// Returns `None` for lines without a percentage or with a percentage
/// outside [0, 100].
pub fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    let caps = PROGRESS_RE.captures(line)?;
    let percent: f32 = caps.name("pct")?.as_str().parse().ok()?;
    if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
        return None;
    }

    let size_bytes = match (caps.name("size"), caps.name("unit")) {
        (Some(size), Some(unit)) => parse_size(size.as_str(), unit.as_str()),
        _ => None,
    };

    Some(ProgressSample {
        percent,
        size_bytes,
    })
}

fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let multiplier: f64 = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

/// Lines announcing the merge / post-processing phase.
pub fn is_merge_line(line: &str) -> bool {
    line.contains("[Merger]") || line.contains("[ExtractAudio]")
}

/// What to do with an accepted sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterDecision {
    /// Send a `downloading` event at this percent.
    Forward(f32),
    /// Genuine 100%; reported by the terminal event once the worker exits.
    Completion,
    /// Accepted for monotonicity but not sent (rate limit).
    Throttled,
    /// Rejected as a fragment completion or a regression.
    Discard,
}

/// Stateful per-job filter.
#[derive(Debug, Clone)]
pub struct ProgressFilter {
    min_interval: Duration,
    fragment_threshold: u64,
    last_accepted: Option<f32>,
    last_forwarded_at: Option<Instant>,
    saw_completion: bool,
}

impl Default for ProgressFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL, DEFAULT_FRAGMENT_THRESHOLD)
    }
}

impl ProgressFilter {
    pub fn new(min_interval: Duration, fragment_threshold: u64) -> Self {
        Self {
            min_interval,
            fragment_threshold,
            last_accepted: None,
            last_forwarded_at: None,
            saw_completion: false,
        }
    }

    pub fn offer(&mut self, sample: ProgressSample, now: Instant) -> FilterDecision {
        let percent = sample.percent;

        if percent >= 100.0 {
            if let Some(size) = sample.size_bytes {
                if size < self.fragment_threshold {
                    return FilterDecision::Discard;
                }
            }
        }

        if let Some(last) = self.last_accepted {
            if percent < last {
                return FilterDecision::Discard;
            }
        }
        self.last_accepted = Some(percent);

        if percent >= 100.0 {
            self.saw_completion = true;
            return FilterDecision::Completion;
        }

        let due = match self.last_forwarded_at {
            Some(at) => now.saturating_duration_since(at) >= self.min_interval,
            None => true,
        };
        if !due {
            return FilterDecision::Throttled;
        }

        self.last_forwarded_at = Some(now);
        FilterDecision::Forward(percent)
    }

    pub fn last_accepted(&self) -> Option<f32> {
        self.last_accepted
    }

    pub fn saw_completion(&self) -> bool {
        self.saw_completion
    }
}
