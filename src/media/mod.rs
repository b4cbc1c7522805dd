//! External processing adapter.
//!
//! Hides the media tool (ffmpeg) and the URL fetchers (yt-dlp, plain HTTP)
//! behind [`MediaAdapter`], so the job controller only sees "produce a local
//! file from a URL" and "produce output files from an input".

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use which::which;

use crate::config::ToolsConfig;
use crate::job::JobError;

pub mod ffmpeg;
pub mod http;
pub mod operation;
pub mod process;
pub mod ytdlp;

pub use ffmpeg::FfmpegTranscoder;
pub use http::HttpFetcher;
pub use operation::{
    parse_timestamp, AudioBitrate, AudioFormat, Operation, OperationError, Quality, TimeRange,
    VideoFormat,
};
pub use ytdlp::YtDlpFetcher;

/// Resource ceilings for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub max_bytes: u64,
    pub timeout: Duration,
}

#[async_trait]
pub trait MediaAdapter: Send + Sync {
    /// Resolve a remote video reference to a file inside `dest_dir`.
    async fn fetch(
        &self,
        url: &str,
        dest_dir: &Path,
        limits: FetchLimits,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError>;

    /// Apply `operation` to `input`, writing output file(s) into `dest_dir`.
    async fn transform(
        &self,
        input: &Path,
        operation: &Operation,
        dest_dir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, JobError>;
}

/// Adapter backed by the real command-line tools.
pub struct ToolAdapter {
    ffmpeg: FfmpegTranscoder,
    ytdlp: YtDlpFetcher,
    http: HttpFetcher,
}

impl ToolAdapter {
    pub fn new(ffmpeg: impl Into<PathBuf>, ytdlp: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::build(ffmpeg.into(), ytdlp.into(), false)
    }

    pub fn from_config(tools: &ToolsConfig) -> anyhow::Result<Self> {
        let ffmpeg = resolve_tool(tools.ffmpeg_path.as_deref(), "ffmpeg");
        let ytdlp = resolve_tool(tools.ytdlp_path.as_deref(), "yt-dlp");
        info!("Using ffmpeg at {:?}, yt-dlp at {:?}", ffmpeg, ytdlp);
        if tools.allow_private_hosts {
            warn!("Direct links to private network hosts are allowed");
        }
        Self::build(ffmpeg, ytdlp, tools.allow_private_hosts)
    }

    fn build(ffmpeg: PathBuf, ytdlp: PathBuf, allow_private_hosts: bool) -> anyhow::Result<Self> {
        Ok(Self {
            ffmpeg: FfmpegTranscoder::new(ffmpeg),
            ytdlp: YtDlpFetcher::new(ytdlp)?,
            http: HttpFetcher::new(allow_private_hosts)?,
        })
    }

    pub fn ffmpeg_path(&self) -> &Path {
        self.ffmpeg.program()
    }

    pub fn ytdlp_path(&self) -> &Path {
        self.ytdlp.program()
    }
}

#[async_trait]
impl MediaAdapter for ToolAdapter {
    async fn fetch(
        &self,
        url: &str,
        dest_dir: &Path,
        limits: FetchLimits,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        if self.http.handles(url) {
            self.http.fetch(url, dest_dir, limits, cancel).await
        } else {
            self.ytdlp.fetch(url, dest_dir, limits, cancel).await
        }
    }

    async fn transform(
        &self,
        input: &Path,
        operation: &Operation,
        dest_dir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, JobError> {
        self.ffmpeg
            .transform(input, operation, dest_dir, timeout, cancel)
            .await
    }
}

/// Configured path if set, otherwise whatever `PATH` has, otherwise the bare
/// name (so the failure surfaces when the tool is first run).
pub fn resolve_tool(configured: Option<&str>, name: &str) -> PathBuf {
    match configured.filter(|p| !p.trim().is_empty()) {
        Some(path) => PathBuf::from(path),
        None => which(name).unwrap_or_else(|_| PathBuf::from(name)),
    }
}

/// Whether `program` runs and reports a version.
pub async fn tool_available(program: &Path) -> bool {
    let flag = if program
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("yt-dlp"))
    {
        "--version"
    } else {
        "-version"
    };
    tokio::process::Command::new(program)
        .arg(flag)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}
