//! Remote video fetching through yt-dlp.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::process::ToolCommand;
use super::FetchLimits;
use crate::job::{JobError, Step};

/// How often the download directory is measured while yt-dlp runs.
const SIZE_POLL_INTERVAL: Duration = Duration::from_millis(500);

const OUTPUT_STEM: &str = "download";

pub struct YtDlpFetcher {
    program: PathBuf,
    supported: Regex,
    transient: Regex,
}

impl YtDlpFetcher {
    pub fn new(program: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let supported = Regex::new(
            r"(?i)^(https?://)?(www\.|m\.)?(youtube\.com|youtu\.be|vimeo\.com|dailymotion\.com|facebook\.com|instagram\.com)/\S*$",
        )?;
        let transient = Regex::new(
            r"(?i)(timed out|connection (reset|refused|aborted)|temporary failure|network is unreachable|HTTP Error 5\d\d|Unable to download webpage|IncompleteRead|Remote end closed connection)",
        )?;
        Ok(Self {
            program: program.into(),
            supported,
            transient,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn supports(&self, url: &str) -> bool {
        self.supported.is_match(url.trim())
    }

    pub async fn fetch(
        &self,
        url: &str,
        dest_dir: &Path,
        limits: FetchLimits,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        let url = url.trim();
        if !self.supports(url) {
            return Err(JobError::UnsupportedUrl(url.to_string()));
        }

        let template = dest_dir.join(format!("{OUTPUT_STEM}.%(ext)s"));
        let watched_dir = dest_dir.to_path_buf();
        let max_bytes = limits.max_bytes;

        let output = ToolCommand::new(&self.program, Step::Fetch, limits.timeout)
            .args(["--no-playlist", "--no-progress", "--no-warnings", "--restrict-filenames"])
            .args(["-f", "best[ext=mp4]/best"])
            .arg("--max-filesize")
            .arg(max_bytes.to_string())
            .args(["--no-simulate", "--print", "after_move:filepath"])
            .arg("-o")
            .arg(template.into_os_string())
            .arg("--")
            .arg(url)
            .run_watched(cancel, SIZE_POLL_INTERVAL, move || {
                let on_disk = dir_size(&watched_dir);
                if on_disk > max_bytes {
                    Err(JobError::SizeLimit {
                        limit: max_bytes,
                        actual: on_disk,
                    })
                } else {
                    Ok(())
                }
            })
            .await?;

        if !output.success() {
            return Err(self.classify(url, &output.diagnostics()));
        }

        // yt-dlp exits 0 without writing anything when --max-filesize rejects
        // the format up front.
        let path = output
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(PathBuf::from)
            .filter(|p| p.starts_with(dest_dir) && p.is_file())
            .or_else(|| find_download(dest_dir))
            .ok_or_else(|| {
                warn!(
                    "yt-dlp produced no file for {}; treating as over {} bytes",
                    url, max_bytes
                );
                JobError::SizeLimit {
                    limit: max_bytes,
                    actual: max_bytes.saturating_add(1),
                }
            })?;

        let size = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if size > max_bytes {
            return Err(JobError::SizeLimit {
                limit: max_bytes,
                actual: size,
            });
        }

        info!("Downloaded video from URL: {} -> {:?} ({} bytes)", url, path, size);
        Ok(path)
    }

    fn classify(&self, url: &str, diagnostics: &str) -> JobError {
        if diagnostics.contains("Unsupported URL") {
            return JobError::UnsupportedUrl(url.to_string());
        }
        let transient = self.transient.is_match(diagnostics);
        warn!(
            "yt-dlp failed for {} (transient: {}): {}",
            url, transient, diagnostics
        );
        JobError::Fetch {
            message: diagnostics.to_string(),
            transient,
        }
    }
}

/// Total size of regular files directly inside `dir`.
fn dir_size(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

fn find_download(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| {
            p.is_file()
                && p.file_stem().and_then(|s| s.to_str()) == Some(OUTPUT_STEM)
                && !p
                    .extension()
                    .is_some_and(|e| e == "part" || e == "ytdl")
        })
}
