//! The database engine: how to invoke it, how to tell it is ready, and how to
//! attach a client to it.

mod client;
mod launcher;
mod rethinkdb;

pub use client::{connect_with_retry, ClientDriver, Connection, RetryPolicy, TcpConnection, TcpDriver};
pub use launcher::EngineDriver;
pub(crate) use launcher::reap;
pub use rethinkdb::RethinkDbSpec;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::Path;
use std::str::FromStr;

/// Command-line surface and readiness sentinels of one engine.
pub trait EngineSpec: Send + Sync + std::fmt::Debug {
    /// Executable name, also the `db` value that selects this engine.
    fn name(&self) -> &'static str;

    /// Name of the data directory inside the working directory.
    fn data_dir_name(&self) -> &'static str;

    /// Arguments of the one-shot data directory initialization.
    fn init_args(&self, data_dir: &Path) -> Vec<OsString>;

    /// Substring on stderr that means initialization finished.
    fn init_ready_sentinel(&self, data_dir: &Path) -> String;

    /// Arguments of the long-running server.
    fn serve_args(&self, data_dir: &Path, driver_port: u16, cluster_port: u16) -> Vec<OsString>;

    /// Substring on stderr that means the server is about to accept clients.
    fn serve_ready_sentinel(&self) -> &'static str;
}

static RETHINKDB: RethinkDbSpec = RethinkDbSpec;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    #[serde(rename = "rethinkdb")]
    RethinkDb,
}

impl EngineKind {
    pub fn name(&self) -> &'static str {
        self.spec().name()
    }

    pub fn spec(&self) -> &'static dyn EngineSpec {
        match self {
            EngineKind::RethinkDb => &RETHINKDB,
        }
    }
}

impl FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rethinkdb" => Ok(EngineKind::RethinkDb),
            other => Err(Error::InvalidEngine(other.to_string())),
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
