use super::duration::deserialize_duration;
use crate::engine::EngineKind;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time to wait for a readiness sentinel on the engine's stderr.
pub const DEFAULT_SENTINEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default overall budget for attaching the client driver.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of client connect attempts.
pub const DEFAULT_CONNECT_RETRIES: usize = 10;

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Prefix of every working directory created under the temp root.
pub const DEFAULT_DIR_PREFIX: &str = "throwaway_db";

/// Settings for a single disposable database instance.
///
/// Every field has a default, so an empty YAML document (or
/// `Options::default()`) describes a rethinkdb instance with the stock
/// timeouts:
///
/// ```
/// use throwaway_db::config::Options;
///
/// let options = Options::from_yaml_str("sentinel_timeout: 45s").unwrap();
/// assert_eq!(options.db, "rethinkdb");
/// assert_eq!(options.sentinel_timeout.as_secs(), 45);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Database type. Only `"rethinkdb"` is accepted.
    pub db: String,
    /// Engine executable. `None` runs the `db` name from PATH.
    pub binary: Option<PathBuf>,
    /// Host the client driver connects to.
    pub host: String,
    /// Parent of the working directory. `None` uses the OS temp dir.
    pub temp_root: Option<PathBuf>,
    pub dir_prefix: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub sentinel_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    pub connect_retries: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub kill_grace: Duration,
    /// Install the signal, panic and at-exit cleanup hooks on first use.
    ///
    /// The signal hook takes over SIGINT, SIGTERM and SIGQUIT for the whole
    /// process and exits after sweeping. Turn this off when the host handles
    /// termination itself.
    pub install_exit_hooks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            db: EngineKind::RethinkDb.name().to_string(),
            binary: None,
            host: "127.0.0.1".to_string(),
            temp_root: None,
            dir_prefix: DEFAULT_DIR_PREFIX.to_string(),
            sentinel_timeout: DEFAULT_SENTINEL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            kill_grace: DEFAULT_KILL_GRACE,
            install_exit_hooks: true,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load options from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn with_db(mut self, db: impl Into<String>) -> Self {
        self.db = db.into();
        self
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    pub fn with_sentinel_timeout(mut self, timeout: Duration) -> Self {
        self.sentinel_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connect_retries(mut self, retries: usize) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_exit_hooks(mut self, install: bool) -> Self {
        self.install_exit_hooks = install;
        self
    }

    /// Resolve the engine named by `db`.
    pub fn engine_kind(&self) -> Result<EngineKind> {
        self.db.parse()
    }

    /// Executable used for both engine invocations.
    pub fn engine_binary(&self, kind: EngineKind) -> PathBuf {
        self.binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(kind.name()))
    }

    /// Directory under which working directories are created.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Check the options without touching the filesystem or network.
    ///
    /// The engine check runs first so an unknown `db` always reports
    /// `InvalidEngine`.
    pub fn validate(&self) -> Result<EngineKind> {
        let kind = self.engine_kind()?;

        if self.connect_retries == 0 {
            return Err(Error::Config(
                "connect_retries must be at least 1".to_string(),
            ));
        }
        if self.dir_prefix.is_empty()
            || self
                .dir_prefix
                .contains(|c: char| c == '/' || c == '\\' || c.is_whitespace())
        {
            return Err(Error::Config(format!(
                "dir_prefix '{}' must be a non-empty single path component",
                self.dir_prefix
            )));
        }
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }

        Ok(kind)
    }
}
