//! Per-job scratch directories.
//!
//! A [`Workspace`] is handed out by [`WorkspaceManager::acquire`] and must go
//! back through [`WorkspaceManager::release`]. If a handle is dropped without
//! being released (panic, cancelled future) its directory is removed on drop,
//! so every acquired directory gets exactly one cleanup attempt.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace root {path:?} is not writable: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not enough disk space under {path:?}: {available} bytes free, {required} needed")]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },
    #[error("workspace {0:?} already exists")]
    Exists(PathBuf),
    #[error("failed to remove workspace {path:?}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Acquire/release counters, shared with every handle the manager creates.
#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceStats {
    pub acquired: u64,
    pub released: u64,
}

impl WorkspaceStats {
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

/// A private scratch directory for one job.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    counters: Arc<Counters>,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    fn mark_released(&mut self) {
        if !self.released {
            self.released = true;
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            "Workspace {:?} dropped without release, removing it now",
            self.path
        );
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove dropped workspace {:?}: {}", self.path, e);
            }
        }
        self.mark_released();
    }
}

#[derive(Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    min_free_bytes: u64,
    counters: Arc<Counters>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, min_free_bytes: u64) -> Self {
        Self {
            root: root.into(),
            min_free_bytes,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh directory for `job_id`.
    ///
    /// Free space is checked before anything is written so a job fails up
    /// front instead of halfway through a download or transcode.
    pub async fn acquire(&self, job_id: Uuid) -> Result<Workspace, WorkspaceError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| WorkspaceError::Unwritable {
                path: self.root.clone(),
                source,
            })?;

        if self.min_free_bytes > 0 {
            let available =
                fs2::available_space(&self.root).map_err(|source| WorkspaceError::Unwritable {
                    path: self.root.clone(),
                    source,
                })?;
            if available < self.min_free_bytes {
                return Err(WorkspaceError::InsufficientSpace {
                    path: self.root.clone(),
                    available,
                    required: self.min_free_bytes,
                });
            }
        }

        let path = self.root.join(format!("job-{job_id}"));
        match tokio::fs::create_dir(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::Exists(path));
            }
            Err(source) => {
                return Err(WorkspaceError::Unwritable { path, source });
            }
        }

        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        debug!("Acquired workspace {:?}", path);

        Ok(Workspace {
            path,
            counters: Arc::clone(&self.counters),
            released: false,
        })
    }

    /// Remove a workspace and everything in it.
    ///
    /// The handle counts as released even when removal fails; the error is
    /// returned so the caller can report it.
    pub async fn release(&self, mut workspace: Workspace) -> Result<(), WorkspaceError> {
        let result = self.release_path(&workspace.path).await;
        workspace.mark_released();
        result
    }

    /// Remove a directory tree. A path that is already gone is not an error.
    pub async fn release_path(&self, path: &Path) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!("Released workspace {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Workspace {:?} already gone", path);
                Ok(())
            }
            Err(source) => Err(WorkspaceError::Cleanup {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn stats(&self) -> WorkspaceStats {
        WorkspaceStats {
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
        }
    }
}
