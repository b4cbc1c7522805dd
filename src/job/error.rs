//! Error taxonomy for jobs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::media::OperationError;
use crate::workspace::WorkspaceError;

/// Pipeline step that can time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Fetch,
    Transform,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Fetch => f.write_str("fetch"),
            Step::Transform => f.write_str("transform"),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("too many requests, try again in {}s", retry_after.as_secs().max(1))]
    RateLimit { retry_after: Duration },
    #[error("input exceeds the {limit} byte limit (got at least {actual} bytes)")]
    SizeLimit { limit: u64, actual: u64 },
    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),
    #[error("download failed: {message}")]
    Fetch { message: String, transient: bool },
    #[error("processing failed: {diagnostics}")]
    Processing { diagnostics: String },
    #[error("{step} timed out after {}s", after.as_secs())]
    Timeout { step: Step, after: Duration },
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("job cancelled")]
    Cancelled,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::RateLimit { .. } => ErrorKind::RateLimit,
            JobError::SizeLimit { .. } => ErrorKind::SizeLimit,
            JobError::UnsupportedUrl(_) | JobError::Fetch { .. } => ErrorKind::Fetch,
            JobError::Processing { .. } => ErrorKind::Processing,
            JobError::Timeout { .. } => ErrorKind::Timeout,
            JobError::Workspace(_) => ErrorKind::Workspace,
            JobError::Cancelled => ErrorKind::Cancelled,
            JobError::InvalidInput(_) => ErrorKind::InvalidInput,
            JobError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Network-level fetch failures that are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JobError::Fetch {
                transient: true,
                ..
            }
        )
    }
}

impl From<OperationError> for JobError {
    fn from(err: OperationError) -> Self {
        JobError::InvalidInput(err.to_string())
    }
}

/// Distinguishable failure category reported to the delivery layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    SizeLimit,
    Fetch,
    Processing,
    Timeout,
    Workspace,
    Cancelled,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::SizeLimit => "size_limit",
            ErrorKind::Fetch => "fetch",
            ErrorKind::Processing => "processing",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Workspace => "workspace",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
