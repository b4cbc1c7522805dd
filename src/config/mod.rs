use crate::global;
use crate::job::JobPolicy;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub tools: ToolsConfig,
    pub limits: LimitsConfig,
    pub admin: AdminConfig,
    pub workspace: WorkspaceConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Shared secret the gateway expects as `Authorization: Bearer <token>`.
    /// Empty disables the check.
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<String>,
    pub ytdlp_path: Option<String>,
    /// Let direct links point at loopback or private-network hosts.
    pub allow_private_hosts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_requests_per_window: u32,
    pub window_duration_seconds: u64,
    pub max_file_size_bytes: u64,
    pub max_concurrent_jobs: usize,
    pub fetch_timeout_seconds: u64,
    pub transform_timeout_seconds: u64,
    /// How long a finished job's output is kept for the gateway to pick up.
    pub delivery_timeout_seconds: u64,
    /// Extra attempts for fetches that failed on a network error.
    pub fetch_retries: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 5,
            window_duration_seconds: 60,
            max_file_size_bytes: 50 * MIB,
            max_concurrent_jobs: 2,
            fetch_timeout_seconds: 300,
            transform_timeout_seconds: 600,
            delivery_timeout_seconds: 120,
            fetch_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Users exempt from the rate limit. Size limits still apply.
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Defaults to `<data dir>/vidshift/workspaces`.
    pub root: Option<PathBuf>,
    /// Defaults to twice the maximum file size.
    pub min_free_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3737".to_string(),
        }
    }
}

impl Config {
    /// Load the config file (creating a default one if missing), then apply
    /// `VIDSHIFT_*` environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        let mut config = if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save()?;
            config
        } else {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
            info!("Loaded config from {:?}", config_path);
            config
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Overlay environment variables looked up through `var`.
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get("VIDSHIFT_BOT_TOKEN") {
            self.bot.token = token;
        }
        if let Some(path) = get("VIDSHIFT_FFMPEG_PATH") {
            self.tools.ffmpeg_path = Some(path);
        }
        if let Some(path) = get("VIDSHIFT_YTDLP_PATH") {
            self.tools.ytdlp_path = Some(path);
        }
        if let Some(v) = get("VIDSHIFT_MAX_REQUESTS") {
            self.limits.max_requests_per_window = parse_number("VIDSHIFT_MAX_REQUESTS", &v)?;
        }
        if let Some(v) = get("VIDSHIFT_WINDOW_SECONDS") {
            self.limits.window_duration_seconds = parse_number("VIDSHIFT_WINDOW_SECONDS", &v)?;
        }
        if let Some(v) = get("VIDSHIFT_MAX_FILE_SIZE_BYTES") {
            self.limits.max_file_size_bytes = parse_number("VIDSHIFT_MAX_FILE_SIZE_BYTES", &v)?;
        }
        if let Some(v) = get("VIDSHIFT_MAX_CONCURRENT_JOBS") {
            self.limits.max_concurrent_jobs = parse_number("VIDSHIFT_MAX_CONCURRENT_JOBS", &v)?;
        }
        if let Some(v) = get("VIDSHIFT_FETCH_TIMEOUT") {
            self.limits.fetch_timeout_seconds = parse_number("VIDSHIFT_FETCH_TIMEOUT", &v)?;
        }
        if let Some(v) = get("VIDSHIFT_TRANSFORM_TIMEOUT") {
            self.limits.transform_timeout_seconds =
                parse_number("VIDSHIFT_TRANSFORM_TIMEOUT", &v)?;
        }
        if let Some(v) = get("VIDSHIFT_ADMIN_USER_IDS") {
            self.admin.user_ids = parse_admin_ids(&v)?;
        }
        if let Some(root) = get("VIDSHIFT_WORKSPACE_ROOT") {
            self.workspace.root = Some(PathBuf::from(root));
        }
        if let Some(bind) = get("VIDSHIFT_BIND") {
            self.server.bind = bind;
        }
        Ok(())
    }

    pub fn workspace_root(&self) -> Result<PathBuf> {
        match &self.workspace.root {
            Some(root) => Ok(root.clone()),
            None => global::workspace_dir(),
        }
    }

    pub fn policy(&self) -> Result<JobPolicy> {
        let limits = &self.limits;
        if limits.max_requests_per_window == 0 {
            return Err(anyhow!("limits.max_requests_per_window must be at least 1"));
        }
        if limits.max_concurrent_jobs == 0 {
            return Err(anyhow!("limits.max_concurrent_jobs must be at least 1"));
        }

        Ok(JobPolicy {
            max_requests_per_window: limits.max_requests_per_window,
            window_duration: Duration::from_secs(limits.window_duration_seconds.max(1)),
            max_file_size_bytes: limits.max_file_size_bytes,
            admin_user_ids: self.admin.user_ids.iter().copied().collect::<HashSet<_>>(),
            workspace_root: self.workspace_root()?,
            fetch_timeout: Duration::from_secs(limits.fetch_timeout_seconds),
            transform_timeout: Duration::from_secs(limits.transform_timeout_seconds),
            max_concurrent_jobs: limits.max_concurrent_jobs,
            delivery_timeout: Duration::from_secs(limits.delivery_timeout_seconds),
            fetch_retries: limits.fetch_retries,
            retry_backoff: Duration::from_secs(2),
            min_free_bytes: self
                .workspace
                .min_free_bytes
                .unwrap_or_else(|| limits.max_file_size_bytes.saturating_mul(2)),
        })
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{key}: expected a non-negative number, got {value:?}"))
}

/// Parse a comma separated list of numeric user ids.
pub fn parse_admin_ids(value: &str) -> Result<Vec<i64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<i64>()
                .with_context(|| format!("Invalid admin user id {entry:?}"))
        })
        .collect()
}
