//! Job submission endpoints.
//!
//! - `POST /jobs` multipart: `user_id`, optional `chat_id` and `file_size`,
//!   `operation` (JSON), then either `url` or `file`. The file part must come
//!   last; it is streamed straight into the job workspace.
//! - `GET /jobs` lists in-flight jobs.
//!
//! The first output is streamed back from disk. Its workspace is released
//! once the response body finishes or the client goes away.

use crate::api::error::{ApiError, ApiResult};
use crate::job::{Delivery, FileInput, InputSpec, JobController, JobError, JobFailure};
use crate::media::Operation;
use axum::{
    body::{Body, Bytes},
    extract::{multipart::Field, Multipart, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures_util::{Stream, TryStreamExt};
use serde_json::{json, Value};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct JobsState {
    pub controller: JobController,
    /// Expected bearer token; `None` accepts every caller.
    pub token: Option<String>,
}

pub fn router(state: JobsState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .with_state(state)
}

/// GET /jobs - Jobs admitted and not yet finished.
async fn list_jobs(State(state): State<JobsState>) -> Json<Value> {
    Json(json!({
        "running": state.controller.running_jobs(),
        "jobs": state.controller.active_jobs(),
    }))
}

/// POST /jobs - Run one job and answer with its output file.
async fn submit_job(
    State(state): State<JobsState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    authorize(&headers, state.token.as_deref())?;

    let mut user_id: Option<i64> = None;
    let mut chat_id: Option<String> = None;
    let mut file_size: Option<u64> = None;
    let mut operation: Option<Operation> = None;

    let input = loop {
        let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("Malformed multipart body: {e}")))?
        else {
            return Err(ApiError::bad_request("Expected a `url` or `file` field"));
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "user_id" => {
                let text = field_text(field).await?;
                user_id = Some(
                    text.parse().map_err(|_| {
                        ApiError::bad_request(format!("Invalid user_id {text:?}"))
                    })?,
                );
            }
            "chat_id" => chat_id = Some(field_text(field).await?),
            "file_size" => {
                let text = field_text(field).await?;
                file_size = Some(
                    text.parse().map_err(|_| {
                        ApiError::bad_request(format!("Invalid file_size {text:?}"))
                    })?,
                );
            }
            "operation" => {
                let text = field_text(field).await?;
                let parsed = serde_json::from_str::<Operation>(&text).map_err(|e| {
                    ApiError::from(JobFailure::new(
                        &JobError::InvalidInput(format!("invalid operation: {e}")),
                        None,
                    ))
                })?;
                operation = Some(parsed);
            }
            "url" => break InputSpec::Url(field_text(field).await?),
            "file" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| "upload.mp4".to_string());
                let stream =
                    field.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
                break InputSpec::File(FileInput {
                    file_name,
                    declared_size: file_size,
                    reader: Box::new(StreamReader::new(Box::pin(stream))),
                });
            }
            other => warn!("Ignoring unknown form field {:?}", other),
        }
    };

    let user_id = user_id.ok_or_else(|| ApiError::bad_request("Missing user_id"))?;
    let operation = operation.ok_or_else(|| ApiError::bad_request("Missing operation"))?;
    info!(
        "Request from user {} (chat {}): {}",
        user_id,
        chat_id.as_deref().unwrap_or("-"),
        operation
    );

    let report = state
        .controller
        .submit(user_id, input, operation, &CancellationToken::new())
        .await;
    let job_id = report.job.id;
    let delivery = report.outcome?;

    let Some(output) = delivery.outputs().first().cloned() else {
        acknowledge_later(delivery);
        return Err(ApiError::internal("Job finished without output"));
    };
    let opened = match tokio::fs::File::open(&output).await {
        Ok(file) => file.metadata().await.map(|meta| (file, meta.len())),
        Err(e) => Err(e),
    };
    let (file, length) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            acknowledge_later(delivery);
            return Err(ApiError::internal(format!("Failed to read output: {e}")));
        }
    };

    let file_name = output
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("output");
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let job_header = HeaderValue::from_str(&job_id.to_string())
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let body = Body::from_stream(DeliveryStream {
        inner: ReaderStream::new(file),
        delivery: Some(delivery),
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(content_type(&output))),
            (header::CONTENT_LENGTH, HeaderValue::from(length)),
            (header::CONTENT_DISPOSITION, disposition),
            (header::HeaderName::from_static("x-job-id"), job_header),
        ],
        body,
    )
        .into_response())
}

/// Response body over an output file. Acknowledges the delivery when the
/// file has been read to the end, on a read error, or when dropped early.
struct DeliveryStream {
    inner: ReaderStream<tokio::fs::File>,
    delivery: Option<Delivery>,
}

impl Stream for DeliveryStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            if let Some(delivery) = self.delivery.take() {
                acknowledge_later(delivery);
            }
        }
        polled
    }
}

impl Drop for DeliveryStream {
    fn drop(&mut self) {
        if let Some(delivery) = self.delivery.take() {
            acknowledge_later(delivery);
        }
    }
}

/// Release a delivery's workspace in the background. Outside a runtime the
/// delivery reaper is left to do it.
fn acknowledge_later(delivery: Delivery) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let job_id = delivery.job_id();
    runtime.spawn(async move {
        if let Err(e) = delivery.acknowledge().await {
            warn!("Job {}: {}", job_id, e);
        }
    });
}

fn authorize(headers: &HeaderMap, expected: Option<&str>) -> ApiResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("Missing or invalid bearer token"))
    }
}

async fn field_text(field: Field<'_>) -> ApiResult<String> {
    let name = field.name().unwrap_or_default().to_string();
    field
        .text()
        .await
        .map(|text| text.trim().to_string())
        .map_err(|e| ApiError::bad_request(format!("Unreadable field {name:?}: {e}")))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobError, JobPolicy};
    use crate::media::{FetchLimits, MediaAdapter};
    use async_trait::async_trait;
    use axum::http::Request;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "vidshift-test-boundary";

    /// Copies the input to `output.<ext>`; fails if the input says so.
    struct CopyAdapter;

    #[async_trait]
    impl MediaAdapter for CopyAdapter {
        async fn fetch(
            &self,
            url: &str,
            _dest_dir: &Path,
            _limits: FetchLimits,
            _cancel: &CancellationToken,
        ) -> Result<PathBuf, JobError> {
            Err(JobError::UnsupportedUrl(url.to_string()))
        }

        async fn transform(
            &self,
            input: &Path,
            operation: &Operation,
            dest_dir: &Path,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<Vec<PathBuf>, JobError> {
            let data = tokio::fs::read(input).await.unwrap();
            if data.starts_with(b"broken") {
                return Err(JobError::Processing {
                    diagnostics: "moov atom not found".into(),
                });
            }
            let ext = match operation {
                Operation::Convert { format } => format.extension(),
                _ => "mp4",
            };
            let out = dest_dir.join(format!("output.{ext}"));
            tokio::fs::write(&out, data).await.unwrap();
            Ok(vec![out])
        }
    }

    fn app(dir: &TempDir, token: Option<&str>) -> (Router, JobController) {
        let policy = JobPolicy {
            max_requests_per_window: 2,
            window_duration: Duration::from_secs(60),
            max_file_size_bytes: 1024,
            admin_user_ids: HashSet::new(),
            workspace_root: dir.path().to_path_buf(),
            fetch_timeout: Duration::from_secs(5),
            transform_timeout: Duration::from_secs(5),
            max_concurrent_jobs: 1,
            delivery_timeout: Duration::from_secs(60),
            fetch_retries: 0,
            retry_backoff: Duration::from_millis(1),
            min_free_bytes: 0,
        };
        let controller = JobController::new(policy, Arc::new(CopyAdapter));
        let router = router(JobsState {
            controller: controller.clone(),
            token: token.map(str::to_string),
        });
        (router, controller)
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, data)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn post(body: Vec<u8>, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/jobs")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            );
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const CONVERT_WEBM: &str = r#"{"op":"convert","format":"webm"}"#;

    /// Wait for the background acknowledgement to remove every workspace.
    async fn wait_for_release(controller: &JobController) -> u64 {
        for _ in 0..100 {
            let outstanding = controller.workspaces().stats().outstanding();
            if outstanding == 0 {
                return 0;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        controller.workspaces().stats().outstanding()
    }

    #[tokio::test]
    async fn test_upload_returns_output_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let (app, controller) = app(&dir, None);

        let body = multipart_body(
            &[("user_id", "11"), ("chat_id", "99"), ("operation", CONVERT_WEBM)],
            Some(("clip.mp4", b"frames")),
        );
        let response = app.oneshot(post(body, None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/webm");
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("output.webm"));
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "6");
        assert_eq!(controller.workspaces().stats().outstanding(), 1);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"frames");
        assert_eq!(wait_for_release(&controller).await, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_response_still_releases_workspace() {
        let dir = TempDir::new().unwrap();
        let (app, controller) = app(&dir, None);

        let body = multipart_body(
            &[("user_id", "11"), ("operation", CONVERT_WEBM)],
            Some(("clip.mp4", b"frames")),
        );
        let response = app.oneshot(post(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        drop(response);
        assert_eq!(wait_for_release(&controller).await, 0);
        assert_eq!(controller.workspaces().stats().released, 1);
    }

    #[tokio::test]
    async fn test_processing_failure_maps_to_422() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, None);

        let body = multipart_body(
            &[("user_id", "11"), ("operation", CONVERT_WEBM)],
            Some(("clip.mp4", b"broken input")),
        );
        let response = app.oneshot(post(body, None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = json_body(response).await;
        assert_eq!(json["error"], true);
        assert_eq!(json["kind"], "processing");
        assert!(json["message"].as_str().unwrap().contains("moov atom"));
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_429() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, None);

        let mut last = StatusCode::OK;
        for _ in 0..3 {
            let body = multipart_body(
                &[("user_id", "5"), ("operation", CONVERT_WEBM)],
                Some(("clip.mp4", b"frames")),
            );
            last = app.clone().oneshot(post(body, None)).await.unwrap().status();
        }
        assert_eq!(last, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_declared_oversize_maps_to_413() {
        let dir = TempDir::new().unwrap();
        let (app, controller) = app(&dir, None);

        let body = multipart_body(
            &[("user_id", "5"), ("file_size", "999999"), ("operation", CONVERT_WEBM)],
            Some(("clip.mp4", b"frames")),
        );
        let response = app.oneshot(post(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(controller.workspaces().stats().acquired, 0);
    }

    #[tokio::test]
    async fn test_unsupported_url_maps_to_fetch_kind() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, None);

        let body = multipart_body(
            &[
                ("user_id", "5"),
                ("operation", r#"{"op":"compress","quality":"low"}"#),
                ("url", "https://example.com/page"),
            ],
            None,
        );
        let response = app.oneshot(post(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["kind"], "fetch");
    }

    #[tokio::test]
    async fn test_bad_operation_is_invalid_input() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, None);

        let body = multipart_body(
            &[("user_id", "5"), ("operation", r#"{"op":"explode"}"#)],
            Some(("clip.mp4", b"frames")),
        );
        let response = app.oneshot(post(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_missing_user_id_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, None);

        let body = multipart_body(&[("operation", CONVERT_WEBM)], Some(("clip.mp4", b"x")));
        let response = app.oneshot(post(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_token_required_when_configured() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, Some("s3cret"));
        let fields = [("user_id", "5"), ("operation", CONVERT_WEBM)];

        let denied = app
            .clone()
            .oneshot(post(multipart_body(&fields, Some(("a.mp4", b"x"))), Some("nope")))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(post(multipart_body(&fields, Some(("a.mp4", b"x"))), Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_jobs_empty() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir, None);

        let response = app
            .oneshot(Request::get("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["running"], 0);
        assert_eq!(json["jobs"].as_array().unwrap().len(), 0);
    }
}
