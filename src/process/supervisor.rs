use super::output::{LineStream, OutputCapture};
use crate::error::{validate_pid, Error, Result};
use nix::sys::signal::{self, killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::watch;

/// Poll interval for synchronous termination.
const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to run: program, arguments and working directory.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Label used in logs.
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    /// `None` when the child was terminated by a signal.
    code: Option<i32>,
}

/// A running child process in its own process group.
///
/// The `Child` itself is owned by a reaper task, which publishes the exit
/// status on a watch channel; everything here observes that channel, so
/// waiting never races with killing. Signals go to the whole process group so
/// helpers the engine forks die with it.
///
/// Dropping a handle whose child is still running kills the group outright,
/// unless [`kill`](Self::kill) already started a graceful shutdown.
pub struct ProcessHandle {
    name: String,
    pid: u32,
    output: OutputCapture,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_requested: AtomicBool,
    grace: Duration,
}

impl ProcessHandle {
    /// Spawn `spec` with stdin closed and stdout/stderr captured.
    ///
    /// `grace` is how long [`kill`](Self::kill) waits after SIGTERM before
    /// escalating to SIGKILL. Must be called from within a tokio runtime.
    pub fn spawn(spec: &ProcessSpec, grace: Duration) -> Result<Self> {
        let program = spec.program.display().to_string();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0); // New process group so the whole tree can be signalled

        let mut child = cmd.spawn().map_err(|e| Error::SpawnFailed {
            program: program.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| Error::SpawnFailed {
            program: program.clone(),
            reason: "child exited before its PID could be read".to_string(),
        })?;

        tracing::debug!(
            "Spawned '{}' (pid {}): {} {:?}",
            spec.name,
            pid,
            program,
            spec.args
        );

        let output = OutputCapture::start(&spec.name, child.stdout.take(), child.stderr.take());

        let (exit_tx, exit_rx) = watch::channel(None);
        let name = spec.name.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!("Failed to reap '{}' (pid {}): {}", name, pid, e);
                    None
                }
            };
            tracing::debug!("'{}' (pid {}) exited with code {:?}", name, pid, code);
            let _ = exit_tx.send(Some(ExitInfo { code }));
        });

        Ok(Self {
            name: spec.name.clone(),
            pid,
            output,
            exit_rx,
            kill_requested: AtomicBool::new(false),
            grace,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit code if the child has already exited (`Some(None)` for a signal).
    pub fn try_exit_code(&self) -> Option<Option<i32>> {
        let info = *self.exit_rx.borrow();
        info.map(|info| info.code)
    }

    /// Wait for the child to exit and return its exit code.
    pub async fn wait(&self) -> Result<Option<i32>> {
        let mut rx = self.exit_rx.clone();
        let info = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Internal(format!("reaper for '{}' ended without a status", self.name)))?;
        Ok(info.and_then(|i| i.code))
    }

    /// Stream of stderr lines. The first call sees everything since spawn.
    pub fn stderr_lines(&self) -> LineStream {
        self.output.stderr_lines()
    }

    /// Stream of stdout lines. The first call sees everything since spawn.
    pub fn stdout_lines(&self) -> LineStream {
        self.output.stdout_lines()
    }

    pub fn recent_stderr(&self, n: usize) -> Vec<String> {
        self.output.recent_stderr(n)
    }

    /// Ask the process group to exit: SIGTERM now, SIGKILL after the grace
    /// period if it is still running.
    ///
    /// Returns immediately. Safe to call repeatedly and after the child has
    /// already exited; only the first call signals.
    pub fn kill(&self) {
        if self.kill_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.is_alive() {
            return;
        }
        let pid = match validate_pid(self.pid) {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!("Not signalling '{}': {}", self.name, e);
                return;
            }
        };

        // Without a runtime there is nothing to drive the grace timer.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            signal_group(pid, Signal::SIGKILL);
            return;
        };

        tracing::debug!("Sending SIGTERM to '{}' (pid {})", self.name, self.pid);
        signal_group(pid, Signal::SIGTERM);

        let mut exit_rx = self.exit_rx.clone();
        let grace = self.grace;
        let name = self.name.clone();
        runtime.spawn(async move {
            let exited = tokio::time::timeout(grace, exit_rx.wait_for(Option::is_some))
                .await
                .is_ok();
            if !exited {
                tracing::warn!(
                    "'{}' (pid {}) did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
                    name,
                    pid,
                    grace
                );
                signal_group(pid, Signal::SIGKILL);
            }
        });
    }

    /// SIGKILL the process group immediately.
    pub fn kill_now(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        if !self.is_alive() {
            return;
        }
        if let Ok(pid) = validate_pid(self.pid) {
            tracing::debug!("Sending SIGKILL to '{}' (pid {})", self.name, self.pid);
            signal_group(pid, Signal::SIGKILL);
        }
    }

    /// [`kill`](Self::kill), then wait for the child to be reaped.
    pub async fn shutdown(&self) -> Result<Option<i32>> {
        self.kill();
        let code = self.wait().await?;
        self.output.shutdown().await;
        Ok(code)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.kill_requested.load(Ordering::SeqCst) && self.is_alive() {
            self.kill_now();
        }
    }
}

/// Signal the process group, falling back to the single process.
fn signal_group(pid: Pid, sig: Signal) {
    let _ = killpg(pid, sig).or_else(|_| signal::kill(pid, sig));
}

/// Terminate `pid` and its process group without an async runtime.
///
/// SIGTERM, poll for up to `grace`, then SIGKILL. Reaps the child if it is
/// ours. Returns `false` only for a PID that may not be signalled. Never
/// panics, so it is safe inside exit and signal hooks.
pub fn terminate_pid_blocking(pid: u32, grace: Duration) -> bool {
    let Ok(nix_pid) = validate_pid(pid) else {
        return false;
    };

    if has_exited(nix_pid) {
        return true;
    }

    signal_group(nix_pid, Signal::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if has_exited(nix_pid) {
            return true;
        }
        std::thread::sleep(TERMINATE_POLL_INTERVAL);
    }

    tracing::warn!("pid {} ignored SIGTERM, sending SIGKILL", pid);
    signal_group(nix_pid, Signal::SIGKILL);
    let _ = has_exited(nix_pid);
    true
}

/// Reap `pid` if it is our exited child, otherwise probe it with signal 0.
fn has_exited(pid: Pid) -> bool {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(_) => true,
        // Not our child, or already reaped elsewhere
        Err(_) => signal::kill(pid, None).is_err(),
    }
}
