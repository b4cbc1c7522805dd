//! Job lifecycle controller.
//!
//! Pipeline per job:
//! admission → size check → queue for a slot → workspace → stage input
//! (upload copy or fetch) → transform → delivery hand-off → release
//!
//! `submit` never returns an error: every outcome, including panics inside the
//! adapter, ends as a [`JobReport`]. Workspaces are released exactly once on
//! every path (directly on failure, through [`Delivery`] on success, and by the
//! workspace drop guard if the `submit` future itself is dropped).

use dashmap::DashMap;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    Delivery, FileInput, InputSpec, Job, JobError, JobFailure, JobPolicy, JobReport, JobStatus,
};
use crate::limiter::RateLimiter;
use crate::media::{FetchLimits, MediaAdapter, Operation};
use crate::workspace::{Workspace, WorkspaceManager};

#[derive(Clone)]
pub struct JobController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    policy: JobPolicy,
    limiter: Arc<RateLimiter>,
    workspaces: WorkspaceManager,
    adapter: Arc<dyn MediaAdapter>,
    slots: Arc<Semaphore>,
    active: DashMap<Uuid, Job>,
}

impl JobController {
    pub fn new(policy: JobPolicy, adapter: Arc<dyn MediaAdapter>) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            policy.max_requests_per_window,
            policy.window_duration,
        ));
        let workspaces = WorkspaceManager::new(&policy.workspace_root, policy.min_free_bytes);
        Self::with_parts(policy, limiter, workspaces, adapter)
    }

    pub fn with_parts(
        policy: JobPolicy,
        limiter: Arc<RateLimiter>,
        workspaces: WorkspaceManager,
        adapter: Arc<dyn MediaAdapter>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(policy.max_concurrent_jobs.max(1)));
        Self {
            inner: Arc::new(ControllerInner {
                policy,
                limiter,
                workspaces,
                adapter,
                slots,
                active: DashMap::new(),
            }),
        }
    }

    pub fn policy(&self) -> &JobPolicy {
        &self.inner.policy
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.inner.workspaces
    }

    /// Jobs admitted but not yet terminal, oldest first.
    pub fn active_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.active.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Number of jobs currently holding a processing slot.
    pub fn running_jobs(&self) -> usize {
        self.inner
            .policy
            .max_concurrent_jobs
            .max(1)
            .saturating_sub(self.inner.slots.available_permits())
    }

    pub async fn submit(
        &self,
        user_id: i64,
        input: InputSpec<'_>,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> JobReport {
        let mut job = Job::new(user_id, input.describe(), operation);
        let policy = &self.inner.policy;

        if policy.is_admin(user_id) {
            info!("Job {}: admin user {} bypasses rate limit", job.id, user_id);
        } else {
            let admission = self.inner.limiter.check(user_id, Instant::now());
            if !admission.allowed {
                return reject(
                    job,
                    JobError::RateLimit {
                        retry_after: admission.retry_after,
                    },
                );
            }
        }

        if let Some(size) = input.declared_size() {
            if size > policy.max_file_size_bytes {
                return reject(
                    job,
                    JobError::SizeLimit {
                        limit: policy.max_file_size_bytes,
                        actual: size,
                    },
                );
            }
        }

        info!(
            "Job {}: admitted for user {} ({}, {:?})",
            job.id, user_id, job.operation, job.input
        );
        let _registration = Registration::new(&self.inner.active, &job);

        let outcome = self.execute(&mut job, input, cancel).await;
        match &outcome {
            Ok(delivery) => info!(
                "Job {}: succeeded with {} output(s)",
                job.id,
                delivery.outputs().len()
            ),
            Err(failure) => warn!("Job {}: failed ({}): {}", job.id, failure.kind, failure.message),
        }

        JobReport { job, outcome }
    }

    async fn execute(
        &self,
        job: &mut Job,
        input: InputSpec<'_>,
        cancel: &CancellationToken,
    ) -> Result<Delivery, JobFailure> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.inner.slots).acquire_owned() => permit
                .map_err(|_| JobError::Internal("job queue closed".to_string())),
            _ = cancel.cancelled() => Err(JobError::Cancelled),
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(err) => {
                self.transition(job, JobStatus::Failed);
                return Err(JobFailure::new(&err, None));
            }
        };

        self.transition(job, JobStatus::Running);

        let workspace = match self.inner.workspaces.acquire(job.id).await {
            Ok(workspace) => workspace,
            Err(err) => {
                error!("Job {}: {}", job.id, err);
                self.transition(job, JobStatus::Failed);
                return Err(JobFailure::new(&JobError::from(err), None));
            }
        };
        job.workspace = Some(workspace.path().to_path_buf());
        self.inner.active.insert(job.id, job.clone());

        let result = AssertUnwindSafe(self.process(&workspace, input, &job.operation, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("Job {}: processing panicked", job.id);
                Err(JobError::Internal("processing aborted unexpectedly".to_string()))
            });

        match result {
            Ok(outputs) => {
                self.transition(job, JobStatus::Succeeded);
                Ok(Delivery::new(
                    job.id,
                    outputs,
                    workspace,
                    self.inner.workspaces.clone(),
                    self.inner.policy.delivery_timeout,
                ))
            }
            Err(err) => {
                self.transition(job, JobStatus::Failed);
                let cleanup_error = match self.inner.workspaces.release(workspace).await {
                    Ok(()) => None,
                    Err(cleanup) => {
                        warn!("Job {}: cleanup after failure also failed: {}", job.id, cleanup);
                        Some(cleanup.to_string())
                    }
                };
                Err(JobFailure::new(&err, cleanup_error))
            }
        }
    }

    async fn process(
        &self,
        workspace: &Workspace,
        input: InputSpec<'_>,
        operation: &Operation,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, JobError> {
        let policy = &self.inner.policy;

        let input_path = match input {
            InputSpec::File(file) => {
                stage_upload(file, workspace, policy.max_file_size_bytes, cancel).await?
            }
            InputSpec::Url(url) => self.fetch_with_retry(&url, workspace.path(), cancel).await?,
        };

        let outputs = self
            .inner
            .adapter
            .transform(
                &input_path,
                operation,
                workspace.path(),
                policy.transform_timeout,
                cancel,
            )
            .await?;

        if outputs.is_empty() {
            return Err(JobError::Processing {
                diagnostics: "no output produced".to_string(),
            });
        }
        for output in &outputs {
            if !output.starts_with(workspace.path()) || !output.is_file() {
                return Err(JobError::Internal(format!(
                    "output {output:?} missing from workspace"
                )));
            }
        }

        Ok(outputs)
    }

    /// Fetch with bounded retries for network-level failures only.
    async fn fetch_with_retry(
        &self,
        url: &str,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        let policy = &self.inner.policy;
        let limits = FetchLimits {
            max_bytes: policy.max_file_size_bytes,
            timeout: policy.fetch_timeout,
        };

        let mut attempt: u32 = 0;
        loop {
            match self.inner.adapter.fetch(url, dest_dir, limits, cancel).await {
                Ok(path) => return Ok(path),
                Err(err) if err.is_transient() && attempt < policy.fetch_retries => {
                    let delay = policy.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        "Fetch of {} failed ({}), retry {}/{} in {}ms",
                        url,
                        err,
                        attempt,
                        policy.fetch_retries,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(JobError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn transition(&self, job: &mut Job, next: JobStatus) {
        if job.advance(next) {
            info!("Job {}: {}", job.id, next.as_str());
            if !next.is_terminal() {
                self.inner.active.insert(job.id, job.clone());
            }
        }
    }
}

fn reject(job: Job, err: JobError) -> JobReport {
    warn!("Job {}: rejected for user {}: {}", job.id, job.user_id, err);
    JobReport {
        outcome: Err(JobFailure::new(&err, None)),
        job,
    }
}

/// Copy an upload into the workspace, enforcing the size ceiling as bytes
/// arrive rather than trusting the declared size.
async fn stage_upload(
    file: FileInput<'_>,
    workspace: &Workspace,
    max_bytes: u64,
    cancel: &CancellationToken,
) -> Result<PathBuf, JobError> {
    let dest = workspace.join(format!("input.{}", upload_extension(&file.file_name)));
    let mut out = tokio::fs::File::create(&dest)
        .await
        .map_err(|e| JobError::Internal(format!("failed to create {dest:?}: {e}")))?;

    let mut limited = file.reader.take(max_bytes.saturating_add(1));
    let copied = tokio::select! {
        copied = tokio::io::copy(&mut limited, &mut out) => copied.map_err(|e| JobError::Fetch {
            message: format!("upload interrupted: {e}"),
            transient: false,
        })?,
        _ = cancel.cancelled() => return Err(JobError::Cancelled),
    };

    if copied > max_bytes {
        return Err(JobError::SizeLimit {
            limit: max_bytes,
            actual: copied,
        });
    }
    if copied == 0 {
        return Err(JobError::InvalidInput("uploaded file is empty".to_string()));
    }

    info!("Staged upload {:?} ({} bytes)", dest, copied);
    Ok(dest)
}

/// Extension to keep for a staged upload; anything odd becomes `mp4`.
fn upload_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "mp4".to_string())
}

/// Keeps a job listed in the active registry until dropped.
struct Registration<'a> {
    active: &'a DashMap<Uuid, Job>,
    id: Uuid,
}

impl<'a> Registration<'a> {
    fn new(active: &'a DashMap<Uuid, Job>, job: &Job) -> Self {
        active.insert(job.id, job.clone());
        Self { active, id: job.id }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}
