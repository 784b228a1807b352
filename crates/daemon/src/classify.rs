//! Classifier module for categorizing media source URLs.
//!
//! Maps a URL to the platform hosting it, a short-form / long-form content
//! hint with a confidence tier, and the download method family the worker
//! should use for it. All decisions come from the static tables below.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Platform name reported for hosts missing from the host table.
pub const UNKNOWN_PLATFORM: &str = "Unknown";

/// Content-type hint for a classified URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Reels, shorts, clips and similar vertical content.
    ShortForm,
    /// Regular videos, streams and talks.
    LongForm,
}

impl Default for ContentKind {
    fn default() -> Self {
        Self::LongForm
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentKind::ShortForm => write!(f, "short_form"),
            ContentKind::LongForm => write!(f, "long_form"),
        }
    }
}

/// How sure the classifier is about its content hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Download method family; selects the worker argument template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMethod {
    /// Single progressive stream, no merge needed.
    Direct,
    /// Segmented (HLS-style) delivery.
    Streaming,
    /// Separate audio and video tracks that must be merged.
    SeparateAv,
}

impl std::fmt::Display for DownloadMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadMethod::Direct => write!(f, "direct"),
            DownloadMethod::Streaming => write!(f, "streaming"),
            DownloadMethod::SeparateAv => write!(f, "separate_av"),
        }
    }
}

/// Result of classifying one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub platform: String,
    pub kind: ContentKind,
    pub confidence: Confidence,
    pub method: DownloadMethod,
    pub is_supported: bool,
    /// Machine-readable rejection reason for unsupported URLs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PlatformInfo {
    fn unsupported(reason: &str) -> Self {
        Self {
            platform: UNKNOWN_PLATFORM.to_string(),
            kind: ContentKind::LongForm,
            confidence: Confidence::Low,
            method: DownloadMethod::SeparateAv,
            is_supported: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Per-platform path rules. Short-form patterns are checked first.
struct PlatformRule {
    short_paths: &'static [&'static str],
    long_paths: &'static [&'static str],
    default_kind: ContentKind,
    default_confidence: Confidence,
}

const HOST_TABLE: &[(&str, &str)] = &[
    ("youtube.com", "YouTube"),
    ("m.youtube.com", "YouTube"),
    ("music.youtube.com", "YouTube"),
    ("youtu.be", "YouTube"),
    ("vimeo.com", "Vimeo"),
    ("player.vimeo.com", "Vimeo"),
    ("facebook.com", "Facebook"),
    ("m.facebook.com", "Facebook"),
    ("web.facebook.com", "Facebook"),
    ("fb.watch", "Facebook"),
    ("dailymotion.com", "Dailymotion"),
    ("m.dailymotion.com", "Dailymotion"),
    ("dai.ly", "Dailymotion"),
    ("instagram.com", "Instagram"),
    ("m.instagram.com", "Instagram"),
    ("instagr.am", "Instagram"),
    ("ig.me", "Instagram"),
    ("twitter.com", "Twitter"),
    ("mobile.twitter.com", "Twitter"),
    ("x.com", "Twitter"),
    ("tiktok.com", "TikTok"),
    ("m.tiktok.com", "TikTok"),
    ("vm.tiktok.com", "TikTok"),
    ("vt.tiktok.com", "TikTok"),
    ("t.tiktok.com", "TikTok"),
    ("twitch.tv", "Twitch"),
    ("m.twitch.tv", "Twitch"),
    ("clips.twitch.tv", "Twitch"),
    ("reddit.com", "Reddit"),
    ("m.reddit.com", "Reddit"),
    ("redd.it", "Reddit"),
    ("v.redd.it", "Reddit"),
    ("pinterest.com", "Pinterest"),
    ("pin.it", "Pinterest"),
    ("linkedin.com", "LinkedIn"),
    ("m.linkedin.com", "LinkedIn"),
    ("vk.com", "VK"),
    ("m.vk.com", "VK"),
    ("vkontakte.ru", "VK"),
    ("rutube.ru", "Rutube"),
    ("m.rutube.ru", "Rutube"),
    ("ok.ru", "OK.ru"),
    ("m.ok.ru", "OK.ru"),
    ("peertube.com", "PeerTube"),
    ("peertube.cpy.re", "PeerTube"),
    ("video.cpy.re", "PeerTube"),
    ("bandcamp.com", "Bandcamp"),
    ("bitchute.com", "BitChute"),
    ("m.bitchute.com", "BitChute"),
    ("rumble.com", "Rumble"),
    ("vine.co", "Vine"),
    ("ted.com", "TED"),
    ("streamable.com", "Streamable"),
    ("bilibili.tv", "Bilibili"),
    ("m.bilibili.tv", "Bilibili"),
    ("bilibili.com", "Bilibili"),
    ("mastodon.social", "Mastodon"),
];

const PLATFORM_RULES: &[(&str, PlatformRule)] = &[
    (
        "YouTube",
        PlatformRule {
            short_paths: &["/shorts"],
            long_paths: &["/watch", "/embed", "/live"],
            default_kind: ContentKind::LongForm,
            default_confidence: Confidence::Medium,
        },
    ),
    (
        "Instagram",
        PlatformRule {
            short_paths: &["/reel", "/reels"],
            long_paths: &["/tv", "/p"],
            default_kind: ContentKind::ShortForm,
            default_confidence: Confidence::Medium,
        },
    ),
    (
        "Facebook",
        PlatformRule {
            short_paths: &["/reel", "/reels"],
            long_paths: &["/watch", "/video", "/videos"],
            default_kind: ContentKind::LongForm,
            default_confidence: Confidence::Medium,
        },
    ),
    (
        "TikTok",
        PlatformRule {
            short_paths: &[],
            long_paths: &[],
            default_kind: ContentKind::ShortForm,
            default_confidence: Confidence::High,
        },
    ),
    (
        "Twitter",
        PlatformRule {
            short_paths: &["/status"],
            long_paths: &[],
            default_kind: ContentKind::ShortForm,
            default_confidence: Confidence::High,
        },
    ),
    (
        "Twitch",
        PlatformRule {
            short_paths: &["/clip", "/clips"],
            long_paths: &["/videos"],
            default_kind: ContentKind::LongForm,
            default_confidence: Confidence::Medium,
        },
    ),
    (
        "Reddit",
        PlatformRule {
            short_paths: &[],
            long_paths: &[],
            default_kind: ContentKind::ShortForm,
            default_confidence: Confidence::Medium,
        },
    ),
    (
        "Dailymotion",
        PlatformRule {
            short_paths: &[],
            long_paths: &["/video"],
            default_kind: ContentKind::LongForm,
            default_confidence: Confidence::High,
        },
    ),
    (
        "Vimeo",
        PlatformRule {
            short_paths: &[],
            long_paths: &[],
            default_kind: ContentKind::LongForm,
            default_confidence: Confidence::High,
        },
    ),
    (
        "Bilibili",
        PlatformRule {
            short_paths: &["/video/bv", "/video/av"],
            long_paths: &["/video"],
            default_kind: ContentKind::LongForm,
            default_confidence: Confidence::High,
        },
    ),
    (
        "Pinterest",
        PlatformRule {
            short_paths: &[],
            long_paths: &[],
            default_kind: ContentKind::ShortForm,
            default_confidence: Confidence::Medium,
        },
    ),
    (
        "LinkedIn",
        PlatformRule {
            short_paths: &[],
            long_paths: &["/posts", "/feed"],
            default_kind: ContentKind::LongForm,
            default_confidence: Confidence::Medium,
        },
    ),
    (
        "Rumble",
        PlatformRule {
            short_paths: &[],
            long_paths: &[],
            default_kind: ContentKind::LongForm,
            default_confidence: Confidence::High,
        },
    ),
    (
        "Streamable",
        PlatformRule {
            short_paths: &[],
            long_paths: &[],
            default_kind: ContentKind::LongForm,
            default_confidence: Confidence::High,
        },
    ),
    (
        "TED",
        PlatformRule {
            short_paths: &[],
            long_paths: &["/talks"],
            default_kind: ContentKind::LongForm,
            default_confidence: Confidence::High,
        },
    ),
];

/// Platforms missing here use [`DownloadMethod::SeparateAv`].
const METHOD_TABLE: &[(&str, DownloadMethod)] = &[
    ("TikTok", DownloadMethod::Direct),
    ("Twitter", DownloadMethod::Direct),
    ("Pinterest", DownloadMethod::Direct),
    ("Streamable", DownloadMethod::Direct),
    ("Vine", DownloadMethod::Direct),
    ("Mastodon", DownloadMethod::Direct),
    ("Bandcamp", DownloadMethod::Direct),
    ("BitChute", DownloadMethod::Direct),
    ("PeerTube", DownloadMethod::Direct),
    ("Twitch", DownloadMethod::Streaming),
    ("Rumble", DownloadMethod::Streaming),
    ("VK", DownloadMethod::Streaming),
    ("OK.ru", DownloadMethod::Streaming),
    ("Rutube", DownloadMethod::Streaming),
];

/// Hosts whose URLs get rewritten to a canonical watch URL.
const CANONICAL_YOUTUBE_HOSTS: &[&str] = &["youtube.com", "m.youtube.com", "music.youtube.com", "youtu.be"];

lazy_static! {
    static ref HOSTS: HashMap<&'static str, &'static str> = HOST_TABLE.iter().copied().collect();
    static ref RULES: HashMap<&'static str, &'static PlatformRule> =
        PLATFORM_RULES.iter().map(|(name, rule)| (*name, rule)).collect();
}

/// Classify a raw URL.
///
/// Unparseable input or a missing scheme/host is rejected with reason
/// `invalid_url`; a host outside the host table is rejected with
/// `unsupported_platform`. A known host without path rules is accepted
/// with low confidence.
pub fn classify_platform(raw: &str) -> PlatformInfo {
    let parsed = match Url::parse(raw.trim()) {
        Ok(url) if !url.scheme().is_empty() && url.host_str().is_some() => url,
        _ => return PlatformInfo::unsupported("invalid_url"),
    };

    let host = match normalized_host(&parsed) {
        Some(host) => host,
        None => return PlatformInfo::unsupported("invalid_url"),
    };

    let platform = match HOSTS.get(host.as_str()) {
        Some(platform) => *platform,
        None => return PlatformInfo::unsupported("unsupported_platform"),
    };

    let method = method_for(platform);
    let path = parsed.path().to_lowercase();

    let (kind, confidence) = match RULES.get(platform) {
        Some(rule) => classify_path(rule, &path),
        None => (ContentKind::LongForm, Confidence::Low),
    };

    PlatformInfo {
        platform: platform.to_string(),
        kind,
        confidence,
        method,
        is_supported: true,
        reason: None,
    }
}

fn classify_path(rule: &PlatformRule, path: &str) -> (ContentKind, Confidence) {
    if rule.short_paths.iter().any(|p| path.contains(p)) {
        return (ContentKind::ShortForm, Confidence::High);
    }
    if rule.long_paths.iter().any(|p| path.contains(p)) {
        return (ContentKind::LongForm, Confidence::High);
    }
    (rule.default_kind, rule.default_confidence)
}

/// Download method family for a platform name.
pub fn method_for(platform: &str) -> DownloadMethod {
    METHOD_TABLE
        .iter()
        .find(|(name, _)| *name == platform)
        .map(|(_, method)| *method)
        .unwrap_or(DownloadMethod::SeparateAv)
}

fn normalized_host(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Rewrite YouTube links to `https://www.youtube.com/watch?v=<id>`.
///
/// Handles `youtu.be/<id>`, `/shorts/<id>`, `/embed/<id>`, `/live/<id>`
/// and `watch?v=<id>` (dropping playlist and tracking parameters). Any
/// other URL is returned trimmed but otherwise untouched.
pub fn canonicalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let parsed = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => return trimmed.to_string(),
    };
    let host = match normalized_host(&parsed) {
        Some(host) => host,
        None => return trimmed.to_string(),
    };
    if !CANONICAL_YOUTUBE_HOSTS.contains(&host.as_str()) {
        return trimmed.to_string();
    }

    match youtube_video_id(&parsed, &host) {
        Some(id) => format!("https://www.youtube.com/watch?v={}", id),
        None => trimmed.to_string(),
    }
}

fn youtube_video_id(url: &Url, host: &str) -> Option<String> {
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());

    let id = if host == "youtu.be" {
        segments.next().map(str::to_string)
    } else {
        match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            Some("shorts") | Some("embed") | Some("live") => segments.next().map(str::to_string),
            _ => None,
        }
    }?;

    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_youtube_shorts_is_short_form_high() {
        let info = classify_platform("https://www.youtube.com/shorts/abc123");
        assert_eq!(info.platform, "YouTube");
        assert_eq!(info.kind, ContentKind::ShortForm);
        assert_eq!(info.confidence, Confidence::High);
        assert_eq!(info.method, DownloadMethod::SeparateAv);
        assert!(info.is_supported);
        assert!(info.reason.is_none());
    }

    #[test]
    fn test_not_a_url_is_unsupported() {
        let info = classify_platform("not a url");
        assert_eq!(info.platform, UNKNOWN_PLATFORM);
        assert_eq!(info.confidence, Confidence::Low);
        assert!(!info.is_supported);
        assert_eq!(info.reason.as_deref(), Some("invalid_url"));
    }

    #[test]
    fn test_unknown_host_is_unsupported() {
        let info = classify_platform("https://example.org/watch?v=1");
        assert!(!info.is_supported);
        assert_eq!(info.confidence, Confidence::Low);
        assert_eq!(info.reason.as_deref(), Some("unsupported_platform"));
    }

    #[test]
    fn test_host_is_normalized() {
        let info = classify_platform("HTTPS://WWW.YouTube.COM/watch?v=abc");
        assert_eq!(info.platform, "YouTube");
        assert_eq!(info.kind, ContentKind::LongForm);
        assert_eq!(info.confidence, Confidence::High);
    }

    #[test]
    fn test_rule_default_applies_when_no_path_matches() {
        let info = classify_platform("https://www.youtube.com/@channel");
        assert_eq!(info.kind, ContentKind::LongForm);
        assert_eq!(info.confidence, Confidence::Medium);

        let info = classify_platform("https://www.tiktok.com/@user/video/123");
        assert_eq!(info.platform, "TikTok");
        assert_eq!(info.kind, ContentKind::ShortForm);
        assert_eq!(info.confidence, Confidence::High);
        assert_eq!(info.method, DownloadMethod::Direct);
    }

    #[test]
    fn test_known_host_without_rules_is_low_confidence() {
        let info = classify_platform("https://vk.com/video-1_2");
        assert_eq!(info.platform, "VK");
        assert!(info.is_supported);
        assert_eq!(info.kind, ContentKind::LongForm);
        assert_eq!(info.confidence, Confidence::Low);
        assert_eq!(info.method, DownloadMethod::Streaming);
    }

    #[test]
    fn test_short_patterns_win_over_long_patterns() {
        // "/video/bv..." also contains "/video"
        let info = classify_platform("https://www.bilibili.com/video/BV1xx411c7mD");
        assert_eq!(info.kind, ContentKind::ShortForm);
        assert_eq!(info.confidence, Confidence::High);

        let info = classify_platform("https://www.instagram.com/reel/Cabc/");
        assert_eq!(info.kind, ContentKind::ShortForm);
    }

    #[test]
    fn test_method_table() {
        assert_eq!(method_for("YouTube"), DownloadMethod::SeparateAv);
        assert_eq!(method_for("Twitch"), DownloadMethod::Streaming);
        assert_eq!(method_for("Twitter"), DownloadMethod::Direct);
        assert_eq!(method_for("Nonexistent"), DownloadMethod::SeparateAv);
    }

    #[test]
    fn test_every_ruled_platform_has_a_host() {
        for (name, _) in PLATFORM_RULES {
            assert!(
                HOST_TABLE.iter().any(|(_, platform)| platform == name),
                "rule for {} has no host",
                name
            );
        }
    }

    #[test]
    fn test_canonicalize_youtube_forms() {
        let expected = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
        for raw in [
            "https://youtu.be/dQw4w9WgXcQ?si=tracking",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ&list=PL123&index=2",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "  https://youtube.com/live/dQw4w9WgXcQ  ",
        ] {
            assert_eq!(canonicalize_url(raw), expected, "input: {}", raw);
        }
    }

    #[test]
    fn test_canonicalize_leaves_other_urls() {
        assert_eq!(
            canonicalize_url(" https://vimeo.com/12345 "),
            "https://vimeo.com/12345"
        );
        assert_eq!(
            canonicalize_url("https://www.youtube.com/@channel"),
            "https://www.youtube.com/@channel"
        );
        assert_eq!(canonicalize_url("not a url"), "not a url");
    }
}
