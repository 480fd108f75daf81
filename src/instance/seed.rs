use crate::engine::Connection;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A data-seeding request against a serving instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOperation {
    /// Load a data file. `kind` names the file format (for example `json`).
    LoadFile { kind: String, path: PathBuf },
    CreateDb(String),
    DeleteDb(String),
}

impl fmt::Display for SeedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedOperation::LoadFile { kind, path } => {
                write!(f, "load {} data from {}", kind, path.display())
            }
            SeedOperation::CreateDb(name) => write!(f, "create database '{}'", name),
            SeedOperation::DeleteDb(name) => write!(f, "delete database '{}'", name),
        }
    }
}

/// Applies seed operations over a client connection.
#[async_trait]
pub trait Seeder: Send + Sync {
    async fn apply(&self, conn: &Arc<dyn Connection>, op: &SeedOperation) -> Result<()>;
}

/// Rejects every operation. Used when no seeder is configured.
#[derive(Debug, Default, Clone)]
pub struct UnsupportedSeeder;

#[async_trait]
impl Seeder for UnsupportedSeeder {
    async fn apply(&self, _conn: &Arc<dyn Connection>, op: &SeedOperation) -> Result<()> {
        Err(Error::SeedUnsupported(op.to_string()))
    }
}

/// Operations submitted before the instance was serving.
#[derive(Default)]
pub(crate) struct SeedQueue {
    pub pending: Vec<SeedOperation>,
    /// Set once the pipeline has taken the queue; later operations run directly.
    pub drained: bool,
    /// Failures of queued operations, which are not fatal to the instance.
    pub failures: Vec<String>,
}
