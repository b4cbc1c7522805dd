//! Running external tools under a wall-clock ceiling.
//!
//! Each tool is started as the leader of its own process group. On timeout,
//! cancellation, a failed watch check, or when the future is dropped, the whole
//! group gets SIGKILL so helper processes spawned by the tool die with it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::job::{JobError, Step};

/// How long to wait for a killed group to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(5);

/// Max characters of stderr kept as diagnostics.
const DIAGNOSTICS_LIMIT: usize = 4000;

pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Trailing part of stderr, where tools put the actual error.
    pub fn diagnostics(&self) -> String {
        tail(&self.stderr, DIAGNOSTICS_LIMIT)
    }
}

pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
    step: Step,
}

impl ToolCommand {
    pub fn new(program: impl AsRef<Path>, step: Step, timeout: Duration) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            timeout,
            step,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    pub async fn run(self, cancel: &CancellationToken) -> Result<ToolOutput, JobError> {
        self.run_watched(cancel, Duration::from_secs(3600), || Ok(()))
            .await
    }

    /// Run the tool, calling `check` every `interval` while it is alive. An
    /// error from `check` kills the tool and is returned as-is.
    pub async fn run_watched<F>(
        self,
        cancel: &CancellationToken,
        interval: Duration,
        mut check: F,
    ) -> Result<ToolOutput, JobError>
    where
        F: FnMut() -> Result<(), JobError> + Send,
    {
        debug!("Running {:?} command: {}", self.step, self.display());

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            JobError::Internal(format!(
                "failed to start {}: {}",
                self.program.display(),
                e
            ))
        })?;

        let mut group = ProcessGroup::new(child.id());
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        let failure = loop {
            tokio::select! {
                output = &mut wait => {
                    group.disarm();
                    let output = output.map_err(|e| {
                        JobError::Internal(format!(
                            "failed to wait for {}: {}",
                            self.program.display(),
                            e
                        ))
                    })?;
                    return Ok(ToolOutput {
                        status: output.status,
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    });
                }
                _ = &mut deadline => {
                    warn!(
                        "{} exceeded {}s, killing process group",
                        self.program.display(),
                        self.timeout.as_secs()
                    );
                    break JobError::Timeout { step: self.step, after: self.timeout };
                }
                _ = cancel.cancelled() => {
                    warn!("{} cancelled, killing process group", self.program.display());
                    break JobError::Cancelled;
                }
                _ = ticker.tick() => {
                    if let Err(e) = check() {
                        warn!("{} aborted: {}", self.program.display(), e);
                        break e;
                    }
                }
            }
        };

        group.kill();
        if tokio::time::timeout(REAP_GRACE, &mut wait).await.is_err() {
            warn!(
                "{} did not exit within {}s of SIGKILL",
                self.program.display(),
                REAP_GRACE.as_secs()
            );
        }
        Err(failure)
    }
}

/// Kills the whole process group unless disarmed after a normal exit.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", pgid, e);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {
    // kill_on_drop takes care of the direct child.
}

fn tail(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= limit {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - limit;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}
