use super::EngineSpec;
use crate::error::{Error, Phase, Result};
use crate::process::{ProcessHandle, ProcessSpec};
use crate::readiness::{wait_for_sentinel, SentinelError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stderr lines included in `ChildExitedEarly` errors.
const STDERR_TAIL_LINES: usize = 20;

/// Extra wait after the kill grace period before giving up on reaping.
const REAP_SLACK: Duration = Duration::from_secs(2);

/// Runs the engine's init and serve steps and waits for each to be ready.
#[derive(Debug, Clone)]
pub struct EngineDriver {
    spec: &'static dyn EngineSpec,
    binary: PathBuf,
    sentinel_timeout: Duration,
    kill_grace: Duration,
}

impl EngineDriver {
    pub fn new(
        spec: &'static dyn EngineSpec,
        binary: PathBuf,
        sentinel_timeout: Duration,
        kill_grace: Duration,
    ) -> Self {
        Self {
            spec,
            binary,
            sentinel_timeout,
            kill_grace,
        }
    }

    pub fn spec(&self) -> &'static dyn EngineSpec {
        self.spec
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Initialize a data directory inside `work_dir` and return its path.
    ///
    /// The init process is killed and reaped whether or not its sentinel
    /// appeared; it has no further use once the directory exists.
    pub async fn prepare(&self, work_dir: &Path, cancel: &CancellationToken) -> Result<PathBuf> {
        let data_dir = work_dir.join(self.spec.data_dir_name());
        let spec = ProcessSpec::new(
            format!("{} create", self.spec.name()),
            &self.binary,
            work_dir,
        )
        .args(self.spec.init_args(&data_dir));

        let child = ProcessHandle::spawn(&spec, self.kill_grace)?;
        let mut stderr = child.stderr_lines();
        let sentinel = self.spec.init_ready_sentinel(&data_dir);
        let outcome =
            wait_for_sentinel(&mut stderr, &sentinel, self.sentinel_timeout, cancel).await;

        match outcome {
            Ok(()) => {
                reap(&child, self.kill_grace).await;
                Ok(data_dir)
            }
            Err(e) => Err(self.sentinel_failure(Phase::Init, e, child).await),
        }
    }

    /// Launch the server on the given ports and return it once it reports
    /// that it is loading its data directory.
    pub async fn serve(
        &self,
        work_dir: &Path,
        data_dir: &Path,
        driver_port: u16,
        cluster_port: u16,
        cancel: &CancellationToken,
    ) -> Result<ProcessHandle> {
        let spec = ProcessSpec::new(
            format!("{} serve", self.spec.name()),
            &self.binary,
            work_dir,
        )
        .args(self.spec.serve_args(data_dir, driver_port, cluster_port));

        let child = ProcessHandle::spawn(&spec, self.kill_grace)?;
        let mut stderr = child.stderr_lines();
        let outcome = wait_for_sentinel(
            &mut stderr,
            self.spec.serve_ready_sentinel(),
            self.sentinel_timeout,
            cancel,
        )
        .await;

        match outcome {
            Ok(()) => Ok(child),
            Err(e) => Err(self.sentinel_failure(Phase::Serve, e, child).await),
        }
    }

    /// Map a failed sentinel wait to an error, after making sure the child
    /// is gone.
    async fn sentinel_failure(
        &self,
        phase: Phase,
        failure: SentinelError,
        child: ProcessHandle,
    ) -> Error {
        match failure {
            SentinelError::Timeout(timeout) => {
                reap(&child, self.kill_grace).await;
                Error::StartTimeout { phase, timeout }
            }
            SentinelError::Cancelled => {
                reap(&child, self.kill_grace).await;
                Error::Cancelled
            }
            SentinelError::StreamClosed => {
                // Stderr closed, so the child is exiting on its own
                let code = match tokio::time::timeout(self.kill_grace, child.wait()).await {
                    Ok(Ok(code)) => code,
                    _ => {
                        reap(&child, self.kill_grace).await;
                        child.try_exit_code().flatten()
                    }
                };
                Error::ChildExitedEarly {
                    phase,
                    code,
                    stderr_tail: child.recent_stderr(STDERR_TAIL_LINES),
                }
            }
        }
    }
}

/// Kill the child and wait for it to be reaped, allowing time beyond the
/// SIGKILL escalation.
pub(crate) async fn reap(child: &ProcessHandle, grace: Duration) {
    child.kill();
    let bound = grace + REAP_SLACK;
    if tokio::time::timeout(bound, child.wait()).await.is_err() {
        tracing::warn!(
            "'{}' (pid {}) was not reaped within {:?}",
            child.name(),
            child.pid(),
            bound
        );
    }
}
