//! Hand-off of a finished job's output to the gateway.
//!
//! The workspace stays on disk until the gateway acknowledges delivery, or
//! until the delivery timeout passes, whichever happens first. Both paths take
//! the workspace out of a shared slot, so it is released exactly once.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::workspace::{Workspace, WorkspaceError, WorkspaceManager};

type Slot = Arc<Mutex<Option<Workspace>>>;

pub struct Delivery {
    job_id: Uuid,
    outputs: Vec<PathBuf>,
    slot: Slot,
    manager: WorkspaceManager,
    reaper: JoinHandle<()>,
}

impl Delivery {
    pub(crate) fn new(
        job_id: Uuid,
        outputs: Vec<PathBuf>,
        workspace: Workspace,
        manager: WorkspaceManager,
        timeout: Duration,
    ) -> Self {
        let slot: Slot = Arc::new(Mutex::new(Some(workspace)));

        let reaper = {
            let slot = Arc::clone(&slot);
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(workspace) = take(&slot) {
                    warn!(
                        "Job {}: delivery not acknowledged within {}s, releasing workspace",
                        job_id,
                        timeout.as_secs()
                    );
                    if let Err(e) = manager.release(workspace).await {
                        warn!("Job {}: {}", job_id, e);
                    }
                }
            })
        };

        Self {
            job_id,
            outputs,
            slot,
            manager,
            reaper,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn outputs(&self) -> &[PathBuf] {
        &self.outputs
    }

    /// Whether the output files are still on disk.
    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Confirm the outputs were handed to the user; removes the workspace.
    ///
    /// Returns `Ok` without doing anything if the delivery timeout already
    /// released it.
    pub async fn acknowledge(self) -> Result<(), WorkspaceError> {
        self.reaper.abort();
        match take(&self.slot) {
            Some(workspace) => {
                info!("Job {}: delivery acknowledged", self.job_id);
                self.manager.release(workspace).await
            }
            None => Ok(()),
        }
    }
}

fn take(slot: &Slot) -> Option<Workspace> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}
