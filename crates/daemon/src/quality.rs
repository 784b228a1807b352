//! Format-chain selection from a requested quality tier.

use crate::classify::{Confidence, ContentKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Selector used when nothing better matches; always ends a chain.
pub const BEST_EFFORT_SELECTOR: &str = "bv*+ba/b";

/// Known tiers, highest first, with their height caps.
pub const QUALITY_TIERS: &[(&str, u32)] = &[
    ("1440p", 1440),
    ("1080p", 1080),
    ("720p", 720),
    ("480p", 480),
    ("360p", 360),
    ("240p", 240),
    ("144p", 144),
];

/// Whether the requested tier was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Matched,
    FallbackBest,
}

/// Ordered worker format selectors, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatChain {
    pub selectors: Vec<String>,
    pub status: ChainStatus,
    pub confidence: Confidence,
}

impl FormatChain {
    /// Selectors joined into the single `/`-separated fallback expression.
    pub fn expression(&self) -> String {
        self.selectors.join("/")
    }
}

fn tier_selector(height: u32) -> String {
    format!("bv*[height<={h}]+ba/b[height<={h}]", h = height)
}

fn tier_position(requested: &str) -> Option<usize> {
    let requested = requested.trim().to_ascii_lowercase();
    QUALITY_TIERS.iter().position(|(name, _)| *name == requested)
}

/// Build the fallback chain for `requested`.
///
/// A known tier yields its selector, every lower tier's selector, then the
/// best-effort selector. Anything else yields only the best-effort
/// selector. The chain is never empty.
pub fn select_format_chain(requested: &str, kind: ContentKind) -> FormatChain {
    let chain = match tier_position(requested) {
        Some(start) => {
            let mut selectors: Vec<String> = QUALITY_TIERS[start..]
                .iter()
                .map(|(_, height)| tier_selector(*height))
                .collect();
            selectors.push(BEST_EFFORT_SELECTOR.to_string());
            FormatChain {
                selectors,
                status: ChainStatus::Matched,
                confidence: Confidence::High,
            }
        }
        None => FormatChain {
            selectors: vec![BEST_EFFORT_SELECTOR.to_string()],
            status: ChainStatus::FallbackBest,
            confidence: Confidence::Low,
        },
    };

    debug!(
        requested,
        kind = %kind,
        status = ?chain.status,
        chain = %chain.expression(),
        "selected format chain"
    );
    chain
}

/// Concurrent fragment count for the worker, from current load and tier.
///
/// 4 when at most one job is active, 3 for up to three, 2 beyond that;
/// tiers up to 480p are capped at 3.
pub fn concurrent_fragments(active_jobs: usize, quality: &str) -> u32 {
    let by_load = match active_jobs {
        0..=1 => 4,
        2..=3 => 3,
        _ => 2,
    };

    let cap = match tier_position(quality).map(|i| QUALITY_TIERS[i].1) {
        Some(height) if height <= 480 => 3,
        _ => 4,
    };

    by_load.min(cap)
}
