use crate::api::ApiServer;
use crate::config::Config;
use crate::job::JobController;
use crate::limiter::RateLimiter;
use crate::media::{tool_available, ToolAdapter};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often idle per-user rate windows are dropped.
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub async fn run_service() -> Result<()> {
    info!("Starting vidshift service");

    let config = Config::load()?;
    let policy = config.policy()?;
    info!(
        "Limits: {} requests per {}s, {} MiB per file, {} concurrent job(s)",
        policy.max_requests_per_window,
        policy.window_duration.as_secs(),
        policy.max_file_size_bytes / (1024 * 1024),
        policy.max_concurrent_jobs
    );
    info!("Workspaces under {:?}", policy.workspace_root);

    let adapter = ToolAdapter::from_config(&config.tools)?;
    if !tool_available(adapter.ffmpeg_path()).await {
        warn!(
            "ffmpeg not usable at {:?}; every transform will fail",
            adapter.ffmpeg_path()
        );
    }
    if !tool_available(adapter.ytdlp_path()).await {
        warn!(
            "yt-dlp not usable at {:?}; only direct file links can be fetched",
            adapter.ytdlp_path()
        );
    }

    let controller = JobController::new(policy, Arc::new(adapter));
    spawn_limiter_sweeper(Arc::clone(controller.limiter()));

    info!("vidshift is ready!");
    ApiServer::new(controller, &config).start().await
}

fn spawn_limiter_sweeper(limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let dropped = limiter.prune(Instant::now());
            if dropped > 0 {
                debug!(
                    "Dropped {} idle rate windows, {} still tracked",
                    dropped,
                    limiter.tracked_users()
                );
            }
        }
    });
}
