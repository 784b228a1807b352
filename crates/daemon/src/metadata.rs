//! Media metadata lookup performed at admission time.
//!
//! Resolvers are tried in order by [`ChainResolver`]: an Iframely-style
//! HTTP service when one is configured, then the worker binary's JSON dump.

use async_trait::async_trait;
use fetch_relay_daemon_config::Config;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Upper bound for a `-j` metadata dump.
pub const WORKER_METADATA_TIMEOUT: Duration = Duration::from_secs(60);

/// Error type for metadata resolution
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metadata service returned status {0}")]
    Status(u16),

    #[error("metadata has no title")]
    EmptyTitle,

    #[error("failed to run worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker metadata dump failed: {0}")]
    WorkerFailed(String),

    #[error("worker metadata dump timed out")]
    Timeout,

    #[error("failed to parse metadata: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("all metadata sources failed: {}", .0.join("; "))]
    AllFailed(Vec<String>),
}

/// Title and display details for a media URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MediaInfo {
    pub title: String,
    pub thumbnail: String,
    pub uploader: String,
    pub views: i64,
    /// Which resolver produced this
    pub source: String,
    #[serde(rename = "downloadUrl", default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(rename = "likes", default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    /// Page the metadata was resolved for
    pub url: String,
}

#[async_trait]
pub trait MetadataResolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, url: &str) -> Result<MediaInfo, MetadataError>;
}

#[derive(Debug, Deserialize, Default)]
struct IframelyResponse {
    #[serde(default)]
    meta: IframelyMeta,
    #[serde(default)]
    links: Vec<IframelyLink>,
}

#[derive(Debug, Deserialize, Default)]
struct IframelyMeta {
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IframelyLink {
    #[serde(default)]
    href: String,
    #[serde(default)]
    rel: Vec<String>,
}

/// HTTP metadata service speaking the Iframely response format.
pub struct IframelyResolver {
    endpoint: String,
    client: reqwest::Client,
}

impl IframelyResolver {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

#[async_trait]
impl MetadataResolver for IframelyResolver {
    fn name(&self) -> &'static str {
        "iframely"
    }

    async fn resolve(&self, url: &str) -> Result<MediaInfo, MetadataError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("url", url)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        parse_iframely(&body, url)
    }
}

/// Map an Iframely JSON body to [`MediaInfo`].
pub fn parse_iframely(body: &[u8], page: &str) -> Result<MediaInfo, MetadataError> {
    let raw: IframelyResponse = serde_json::from_slice(body)?;
    if raw.meta.title.trim().is_empty() {
        return Err(MetadataError::EmptyTitle);
    }

    let thumbnail = raw
        .links
        .iter()
        .find(|link| link.rel.iter().any(|r| r == "thumbnail"))
        .map(|link| link.href.clone())
        .unwrap_or_default();

    Ok(MediaInfo {
        title: raw.meta.title,
        thumbnail,
        uploader: raw.meta.author,
        views: 0,
        source: "iframely".to_string(),
        download_url: None,
        description: raw.meta.description,
        upload_date: None,
        like_count: None,
        url: page.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct WorkerDump {
    #[serde(default)]
    title: String,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    view_count: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    upload_date: Option<String>,
    #[serde(default)]
    like_count: Option<i64>,
    #[serde(default)]
    url: Option<String>,
}

/// Runs the worker binary with `-j` and reads its JSON dump.
pub struct WorkerMetadataResolver {
    binary: String,
    cookies_from_browser: Option<String>,
    timeout: Duration,
}

impl WorkerMetadataResolver {
    pub fn new(binary: &str, cookies_from_browser: Option<String>) -> Self {
        Self {
            binary: binary.to_string(),
            cookies_from_browser,
            timeout: WORKER_METADATA_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MetadataResolver for WorkerMetadataResolver {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn resolve(&self, url: &str) -> Result<MediaInfo, MetadataError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-j").arg("--no-playlist").arg("--no-warnings");
        if let Some(browser) = &self.cookies_from_browser {
            cmd.arg("--cookies-from-browser").arg(browser);
        }
        cmd.arg("--").arg(url);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| MetadataError::Timeout)?
            .map_err(MetadataError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(MetadataError::WorkerFailed(last));
        }

        parse_worker_dump(&output.stdout, url)
    }
}

/// Map a worker `-j` dump to [`MediaInfo`].
pub fn parse_worker_dump(stdout: &[u8], page: &str) -> Result<MediaInfo, MetadataError> {
    let dump: WorkerDump = serde_json::from_slice(stdout)?;
    Ok(MediaInfo {
        title: dump.title,
        thumbnail: dump.thumbnail.unwrap_or_default(),
        uploader: dump.uploader.unwrap_or_default(),
        views: dump.view_count.unwrap_or(0),
        source: "worker".to_string(),
        download_url: dump.url,
        description: dump.description,
        upload_date: dump.upload_date,
        like_count: dump.like_count,
        url: page.to_string(),
    })
}

/// Tries resolvers in order; the first success wins.
pub struct ChainResolver {
    resolvers: Vec<Arc<dyn MetadataResolver>>,
}

impl ChainResolver {
    pub fn new(resolvers: Vec<Arc<dyn MetadataResolver>>) -> Self {
        Self { resolvers }
    }

    /// Iframely (when configured) followed by the worker dump.
    pub fn from_config(config: &Config) -> Self {
        let mut resolvers: Vec<Arc<dyn MetadataResolver>> = Vec::new();
        if let Some(endpoint) = &config.metadata.iframely_url {
            let timeout = Duration::from_secs(config.metadata.timeout_secs);
            match IframelyResolver::new(endpoint, timeout) {
                Ok(resolver) => resolvers.push(Arc::new(resolver)),
                Err(e) => warn!(error = %e, "iframely resolver disabled"),
            }
        }
        resolvers.push(Arc::new(WorkerMetadataResolver::new(
            &config.worker.binary,
            config.worker.cookies_from_browser.clone(),
        )));
        Self::new(resolvers)
    }
}

#[async_trait]
impl MetadataResolver for ChainResolver {
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn resolve(&self, url: &str) -> Result<MediaInfo, MetadataError> {
        let mut failures = Vec::new();
        for resolver in &self.resolvers {
            match resolver.resolve(url).await {
                Ok(info) => {
                    info!(url, source = resolver.name(), "metadata resolved");
                    return Ok(info);
                }
                Err(e) => {
                    debug!(url, source = resolver.name(), error = %e, "metadata source failed");
                    failures.push(format!("{}: {}", resolver.name(), e));
                }
            }
        }
        Err(MetadataError::AllFailed(failures))
    }
}
