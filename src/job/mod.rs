//! Jobs: one user-requested transformation from submission to terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::warn;
use uuid::Uuid;

use crate::media::Operation;

pub mod controller;
pub mod delivery;
pub mod error;

pub use controller::JobController;
pub use delivery::Delivery;
pub use error::{ErrorKind, JobError, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Allowed moves: Pending → Running → Succeeded | Failed, plus
    /// Pending → Failed for jobs cancelled while still queued.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

/// Printable description of what a job was asked to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputRef {
    File {
        name: String,
        declared_size: Option<u64>,
    },
    Url {
        url: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: i64,
    pub input: InputRef,
    pub operation: Operation,
    status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub workspace: Option<PathBuf>,
}

impl Job {
    pub fn new(user_id: i64, input: InputRef, operation: Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            input,
            operation,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            workspace: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Move the job forward. Backward or repeated transitions are refused.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            warn!(
                "Job {}: refusing status change {:?} -> {:?}",
                self.id, self.status, next
            );
            false
        }
    }
}

/// An uploaded file as handed over by the gateway.
pub struct FileInput<'a> {
    pub file_name: String,
    pub declared_size: Option<u64>,
    pub reader: Box<dyn AsyncRead + Send + Unpin + 'a>,
}

impl FileInput<'static> {
    /// Open a local file as an upload.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("input")
            .to_string();
        Ok(Self {
            file_name,
            declared_size: Some(size),
            reader: Box::new(file),
        })
    }
}

pub enum InputSpec<'a> {
    File(FileInput<'a>),
    Url(String),
}

impl InputSpec<'_> {
    pub fn describe(&self) -> InputRef {
        match self {
            InputSpec::File(file) => InputRef::File {
                name: file.file_name.clone(),
                declared_size: file.declared_size,
            },
            InputSpec::Url(url) => InputRef::Url { url: url.clone() },
        }
    }

    pub fn declared_size(&self) -> Option<u64> {
        match self {
            InputSpec::File(file) => file.declared_size,
            InputSpec::Url(_) => None,
        }
    }
}

/// Limits and switches the controller runs under.
#[derive(Debug, Clone)]
pub struct JobPolicy {
    pub max_requests_per_window: u32,
    pub window_duration: Duration,
    pub max_file_size_bytes: u64,
    pub admin_user_ids: HashSet<i64>,
    pub workspace_root: PathBuf,
    pub fetch_timeout: Duration,
    pub transform_timeout: Duration,
    pub max_concurrent_jobs: usize,
    pub delivery_timeout: Duration,
    pub fetch_retries: u32,
    pub retry_backoff: Duration,
    pub min_free_bytes: u64,
}

impl JobPolicy {
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_user_ids.contains(&user_id)
    }
}

/// Why a job did not succeed, in a form the delivery layer can act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Set when the workspace could not be removed afterwards. Never replaces
    /// the primary kind.
    pub cleanup_error: Option<String>,
}

impl JobFailure {
    pub fn new(err: &JobError, cleanup_error: Option<String>) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            cleanup_error,
        }
    }
}

/// Terminal result of [`JobController::submit`].
pub struct JobReport {
    pub job: Job,
    pub outcome: Result<Delivery, JobFailure>,
}

impl JobReport {
    pub fn status(&self) -> JobStatus {
        self.job.status()
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        self.outcome.as_ref().err()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure().map(|f| f.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Quality, VideoFormat};

    fn job() -> Job {
        Job::new(
            1,
            InputRef::Url {
                url: "https://youtu.be/x".into(),
            },
            Operation::Compress {
                quality: Quality::Medium,
            },
        )
    }

    #[test]
    fn test_status_moves_forward_only() {
        let mut job = job();
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.advance(JobStatus::Running));
        assert!(!job.advance(JobStatus::Pending));
        assert!(!job.advance(JobStatus::Running));
        assert!(job.advance(JobStatus::Succeeded));
        assert!(!job.advance(JobStatus::Failed));
        assert_eq!(job.status(), JobStatus::Succeeded);
    }

    #[test]
    fn test_pending_cannot_jump_to_succeeded() {
        let mut job = job();
        assert!(!job.advance(JobStatus::Succeeded));
        assert!(job.advance(JobStatus::Failed));
        assert!(job.status().is_terminal());
    }

    #[tokio::test]
    async fn test_file_input_open_reads_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("holiday.mov");
        std::fs::write(&path, vec![1u8; 123]).unwrap();

        let input = InputSpec::File(FileInput::open(&path).await.unwrap());
        assert_eq!(input.declared_size(), Some(123));
        assert_eq!(
            input.describe(),
            InputRef::File {
                name: "holiday.mov".into(),
                declared_size: Some(123)
            }
        );
    }

    #[test]
    fn test_job_serializes_for_status_listing() {
        let mut job = Job::new(
            9,
            InputRef::File {
                name: "a.mp4".into(),
                declared_size: Some(1),
            },
            Operation::Convert {
                format: VideoFormat::Gif,
            },
        );
        job.advance(JobStatus::Running);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "running");
        assert_eq!(value["operation"]["op"], "convert");
        assert_eq!(value["input"]["kind"], "file");
    }
}
