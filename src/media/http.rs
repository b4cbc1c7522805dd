//! Direct downloads of media files served over plain HTTP(S).

use anyhow::Context;
use regex::Regex;
use reqwest::redirect::Policy;
use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::FetchLimits;
use crate::job::{JobError, Step};

const MAX_REDIRECTS: usize = 10;

pub struct HttpFetcher {
    client: reqwest::Client,
    direct_link: Regex,
    allow_private_hosts: bool,
}

impl HttpFetcher {
    /// Links to loopback, private or link-local hosts are refused unless
    /// `allow_private_hosts` is set. The same rule applies to redirects.
    pub fn new(allow_private_hosts: bool) -> anyhow::Result<Self> {
        let redirects = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if !allow_private_hosts && is_private_host(attempt.url()) {
                attempt.error("redirect to a private or local address")
            } else {
                attempt.follow()
            }
        });
        let client = reqwest::Client::builder()
            .user_agent(concat!("vidshift/", env!("CARGO_PKG_VERSION")))
            .redirect(redirects)
            .build()
            .context("Failed to create HTTP client")?;
        let direct_link =
            Regex::new(r"(?i)^https?://[^\s?#]+\.(mp4|mkv|webm|mov|avi)(?:[?#]\S*)?$")?;
        Ok(Self {
            client,
            direct_link,
            allow_private_hosts,
        })
    }

    /// Whether `url` points straight at a media file.
    pub fn handles(&self, url: &str) -> bool {
        self.direct_link.is_match(url.trim())
    }

    pub async fn fetch(
        &self,
        url: &str,
        dest_dir: &Path,
        limits: FetchLimits,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        let url = url.trim();
        let extension = self
            .direct_link
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
            .ok_or_else(|| JobError::UnsupportedUrl(url.to_string()))?;
        let parsed = Url::parse(url).map_err(|_| JobError::UnsupportedUrl(url.to_string()))?;
        if !self.allow_private_hosts && is_private_host(&parsed) {
            warn!("Refusing direct link to private host: {}", url);
            return Err(JobError::Fetch {
                message: format!(
                    "refusing to download from {}",
                    parsed.host_str().unwrap_or_default()
                ),
                transient: false,
            });
        }
        let dest = dest_dir.join(format!("download.{extension}"));
        let download = self.download(parsed, &dest, limits.max_bytes);

        tokio::select! {
            result = tokio::time::timeout(limits.timeout, download) => {
                result.unwrap_or(Err(JobError::Timeout {
                    step: Step::Fetch,
                    after: limits.timeout,
                }))
            }
            _ = cancel.cancelled() => Err(JobError::Cancelled),
        }
    }

    async fn download(&self, url: Url, dest: &Path, max_bytes: u64) -> Result<PathBuf, JobError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(JobError::Fetch {
                message: format!("server answered {status}"),
                transient: status.is_server_error() || status.as_u16() == 429,
            });
        }

        if let Some(declared) = response.content_length() {
            if declared > max_bytes {
                return Err(JobError::SizeLimit {
                    limit: max_bytes,
                    actual: declared,
                });
            }
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| JobError::Internal(format!("failed to create {dest:?}: {e}")))?;
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            written += chunk.len() as u64;
            if written > max_bytes {
                debug!("Aborting download of {} at {} bytes", url, written);
                return Err(JobError::SizeLimit {
                    limit: max_bytes,
                    actual: written,
                });
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| JobError::Internal(format!("failed to write {dest:?}: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| JobError::Internal(format!("failed to write {dest:?}: {e}")))?;

        info!("Downloaded {} -> {:?} ({} bytes)", url, dest, written);
        Ok(dest.to_path_buf())
    }
}

/// Whether `url` names this machine or a non-routable network. Only literal
/// addresses and `localhost` are caught; names are not resolved here.
fn is_private_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_private_v4(ip),
        Ok(IpAddr::V6(ip)) => is_private_v6(ip),
        Err(_) => false,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..128).contains(&b))
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

fn request_error(err: reqwest::Error) -> JobError {
    JobError::Fetch {
        transient: err.is_connect() || err.is_timeout() || err.is_body(),
        message: err.to_string(),
    }
}
