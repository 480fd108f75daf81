// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Pipeline phase in which a child process was being supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `rethinkdb create` - data directory initialization
    Init,
    /// `rethinkdb serve` - the long-running server
    Serve,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Init => write!(f, "init"),
            Phase::Serve => write!(f, "serve"),
        }
    }
}

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Invalid/missing database type: {0}")]
    #[diagnostic(
        code(throwaway_db::config::invalid_engine),
        help("The only supported database type is \"rethinkdb\"")
    )]
    InvalidEngine(String),

    #[error("Temporary directory unavailable under {}: {reason}", .root.display())]
    #[diagnostic(
        code(throwaway_db::tempdir::unavailable),
        help("Check that the temp root exists and is writable")
    )]
    TempDirUnavailable { root: PathBuf, reason: String },

    #[error("No free port found after probing {window} candidates")]
    #[diagnostic(code(throwaway_db::port::exhausted))]
    PortExhausted { window: usize },

    #[error("Failed to spawn '{program}': {reason}")]
    #[diagnostic(
        code(throwaway_db::process::spawn_failed),
        help("Check that the database binary is installed and on PATH")
    )]
    SpawnFailed { program: String, reason: String },

    #[error("Timed out after {timeout:?} waiting for the {phase} step to become ready")]
    #[diagnostic(
        code(throwaway_db::process::start_timeout),
        help("Increase `sentinel_timeout` or check the engine's stderr output")
    )]
    StartTimeout { phase: Phase, timeout: Duration },

    #[error("Database process exited during the {phase} step {}", describe_exit(.code, .stderr_tail))]
    #[diagnostic(code(throwaway_db::process::exited_early))]
    ChildExitedEarly {
        phase: Phase,
        code: Option<i32>,
        stderr_tail: Vec<String>,
    },

    #[error("Could not connect to {host}:{port} after {attempts} attempt(s): {reason}")]
    #[diagnostic(
        code(throwaway_db::engine::connect_failed),
        help("The server may still be loading data. Increase `connect_timeout` or `connect_retries`")
    )]
    ConnectFailed {
        host: String,
        port: u16,
        attempts: usize,
        reason: String,
    },

    #[error("Operation cancelled by stop()")]
    Cancelled,

    #[error("Instance has already been started")]
    AlreadyStarted,

    #[error("Instance is not serving (state: {0})")]
    NotServing(String),

    #[error("Seed operation not supported: {0}")]
    #[diagnostic(
        code(throwaway_db::seed::unsupported),
        help("Configure a Seeder with ThrowawayDb::builder().seeder(...)")
    )]
    SeedUnsupported(String),

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn describe_exit(code: &Option<i32>, stderr_tail: &[String]) -> String {
    let code = code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string());
    if stderr_tail.is_empty() {
        format!("(exit code {})", code)
    } else {
        format!("(exit code {}):\n{}", code, stderr_tail.join("\n"))
    }
}

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::InvalidEngine(db) => Some(format!(
                "'{}' is not a supported database. Use `db: rethinkdb`.",
                db
            )),
            Error::SpawnFailed { program, .. } => Some(format!(
                "Install '{}' or point `binary` at the executable.",
                program
            )),
            Error::PortExhausted { .. } => Some(
                "Too many ports in use on loopback. Stop stale instances and retry.".to_string(),
            ),
            Error::ChildExitedEarly { .. } => Some(
                "The engine may have lost a port bind race. Retrying with a new instance usually succeeds."
                    .to_string(),
            ),
            Error::StartTimeout { .. } => {
                Some("Raise `sentinel_timeout` for slow machines.".to_string())
            }
            Error::ConnectFailed { .. } => {
                Some("Raise `connect_timeout` or `connect_retries`.".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }

    /// True for errors that a caller may fix by constructing a fresh instance.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::ChildExitedEarly { .. }
                | Error::StartTimeout { .. }
                | Error::ConnectFailed { .. }
                | Error::PortExhausted { .. }
        )
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
pub fn validate_pid(pid: u32) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: "PID 0 refers to the process group, not a process".to_string(),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: "refusing to signal PID 1 (init)".to_string(),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: "exceeds i32::MAX, cannot convert safely".to_string(),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}
