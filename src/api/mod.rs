//! REST gateway for vidshift.
//!
//! Provides HTTP endpoints for:
//! - Service info and version
//! - Job submission (upload or URL) returning the converted file
//! - Listing in-flight jobs

pub mod error;
pub mod routes;

use crate::config::Config;
use crate::job::JobController;
use anyhow::{Context, Result};
use axum::{extract::DefaultBodyLimit, response::Json, routing::get, Router};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tracing::info;

pub use routes::jobs::JobsState;

/// Multipart framing and the small form fields on top of the file itself.
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

pub struct ApiServer {
    bind: String,
    body_limit: usize,
    jobs_state: JobsState,
}

impl ApiServer {
    pub fn new(controller: JobController, config: &Config) -> Self {
        let token = Some(config.bot.token.trim().to_string()).filter(|t| !t.is_empty());
        let body_limit = usize::try_from(config.limits.max_file_size_bytes)
            .unwrap_or(usize::MAX)
            .saturating_add(FORM_OVERHEAD_BYTES);
        Self {
            bind: config.server.bind.clone(),
            body_limit,
            jobs_state: JobsState { controller, token },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(status))
            .route("/version", get(version))
            .merge(routes::jobs::router(self.jobs_state.clone()))
            .layer(ServiceBuilder::new().layer(DefaultBodyLimit::max(self.body_limit)))
    }

    pub async fn start(self) -> Result<()> {
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.bind)
            .await
            .with_context(|| format!("Failed to bind {}", self.bind))?;

        info!("API server listening on http://{}", self.bind);
        if self.jobs_state.token.is_some() {
            info!("Bearer token required for POST /jobs");
        }
        info!("Endpoints:");
        info!("  GET  /              - Service info");
        info!("  GET  /version       - Get version info");
        info!("  GET  /jobs          - List in-flight jobs");
        info!("  POST /jobs          - Submit a job (multipart), returns the output file");

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn status() -> Json<Value> {
    Json(json!({
        "service": "vidshift",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": "vidshift"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ToolAdapter;
    use axum::{body::Body, http::Request, http::StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_root_reports_service() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.workspace.root = Some(dir.path().to_path_buf());
        let adapter = ToolAdapter::new("ffmpeg", "yt-dlp").unwrap();
        let controller = JobController::new(config.policy().unwrap(), Arc::new(adapter));
        let app = ApiServer::new(controller, &config).router();

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["service"], "vidshift");
    }
}
