use crate::config::Options;
use crate::engine::{ClientDriver, Connection, TcpDriver};
use crate::error::{Error, Result};
use crate::instance::{
    Instance, InstanceId, InstanceState, SeedOperation, Seeder, ServingInfo, UnsupportedSeeder,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A disposable database for tests and local development.
///
/// ```no_run
/// use throwaway_db::ThrowawayDb;
///
/// # async fn demo() -> throwaway_db::Result<()> {
/// let db = ThrowawayDb::with_defaults()?;
/// let info = db.start().ready().await?;
/// println!("rethinkdb listening on {}:{}", info.host, info.driver_port);
/// db.stop().await?;
/// # Ok(())
/// # }
/// ```
///
/// Dropping a `ThrowawayDb` that was never stopped cancels any start in
/// progress and removes the instance's files and process on a best-effort
/// basis.
pub struct ThrowawayDb {
    instance: Arc<Instance>,
}

impl ThrowawayDb {
    /// Validate `options` without allocating anything.
    ///
    /// Fails with [`Error::InvalidEngine`] unless `options.db` is
    /// `"rethinkdb"`.
    pub fn new(options: Options) -> Result<Self> {
        Self::builder().options(options).build()
    }

    /// An instance with default options (`db: rethinkdb`).
    pub fn with_defaults() -> Result<Self> {
        Self::new(Options::default())
    }

    pub fn builder() -> ThrowawayDbBuilder {
        ThrowawayDbBuilder::default()
    }

    /// Begin bringing the database up. Returns immediately; await
    /// [`StartHandle::ready`] for the outcome.
    ///
    /// A second call yields a handle that resolves to
    /// [`Error::AlreadyStarted`]. Must be called from within a tokio runtime.
    pub fn start(&self) -> StartHandle {
        StartHandle {
            inner: self.instance.start(),
        }
    }

    /// Tear the database down. Idempotent and safe in every state.
    pub async fn stop(&self) -> Result<()> {
        self.instance.stop().await
    }

    pub fn id(&self) -> InstanceId {
        self.instance.id()
    }

    pub fn state(&self) -> InstanceState {
        self.instance.state()
    }

    /// Connection details while serving.
    pub fn info(&self) -> Option<ServingInfo> {
        self.instance.info()
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.instance.connection()
    }

    /// Message of the error that failed the instance, if any.
    pub fn last_error(&self) -> Option<String> {
        self.instance.last_error()
    }

    pub fn work_dir(&self) -> Option<PathBuf> {
        self.instance.work_dir()
    }

    /// Cleanup passes run so far; never more than one.
    pub fn cleanup_passes(&self) -> usize {
        self.instance.cleanup_passes()
    }

    /// Errors from seed operations that were queued before the instance
    /// was serving.
    pub fn seed_failures(&self) -> Vec<String> {
        self.instance.seed_failures()
    }

    /// Load a data file of format `kind` into the database.
    pub async fn load_data_from_file(
        &self,
        kind: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<&Self> {
        self.instance
            .submit_seed(SeedOperation::LoadFile {
                kind: kind.into(),
                path: path.into(),
            })
            .await?;
        Ok(self)
    }

    pub async fn create_db(&self, name: impl Into<String>) -> Result<&Self> {
        self.instance
            .submit_seed(SeedOperation::CreateDb(name.into()))
            .await?;
        Ok(self)
    }

    pub async fn delete_db(&self, name: impl Into<String>) -> Result<&Self> {
        self.instance
            .submit_seed(SeedOperation::DeleteDb(name.into()))
            .await?;
        Ok(self)
    }
}

impl Drop for ThrowawayDb {
    fn drop(&mut self) {
        if !self.instance.state().is_terminal() {
            // A running pipeline short-circuits; Instance::drop sweeps once the
            // last reference goes.
            self.instance.cancel();
        }
    }
}

impl std::fmt::Debug for ThrowawayDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrowawayDb")
            .field("id", &self.instance.id())
            .field("state", &self.instance.state())
            .finish()
    }
}

/// Outcome of [`ThrowawayDb::start`].
pub struct StartHandle {
    inner: Result<JoinHandle<Result<ServingInfo>>>,
}

impl StartHandle {
    /// Wait until the database is serving or the start has failed.
    pub async fn ready(self) -> Result<ServingInfo> {
        match self.inner {
            Ok(task) => task
                .await
                .map_err(|e| Error::Internal(format!("start task failed: {}", e)))?,
            Err(e) => Err(e),
        }
    }
}

/// Builder for [`ThrowawayDb`] with injectable client driver and seeder.
#[derive(Default)]
pub struct ThrowawayDbBuilder {
    options: Option<Options>,
    client: Option<Arc<dyn ClientDriver>>,
    seeder: Option<Arc<dyn Seeder>>,
}

impl ThrowawayDbBuilder {
    pub fn options(mut self, options: Options) -> Self {
        self.options = Some(options);
        self
    }

    /// Driver used to attach to the server. Defaults to [`TcpDriver`].
    pub fn client_driver(mut self, driver: Arc<dyn ClientDriver>) -> Self {
        self.client = Some(driver);
        self
    }

    /// Seeder for `load_data_from_file`, `create_db` and `delete_db`.
    /// Defaults to [`UnsupportedSeeder`].
    pub fn seeder(mut self, seeder: Arc<dyn Seeder>) -> Self {
        self.seeder = Some(seeder);
        self
    }

    pub fn build(self) -> Result<ThrowawayDb> {
        let instance = Instance::new(
            self.options.unwrap_or_default(),
            self.client.unwrap_or_else(|| Arc::new(TcpDriver)),
            self.seeder.unwrap_or_else(|| Arc::new(UnsupportedSeeder)),
        )?;
        Ok(ThrowawayDb {
            instance: Arc::new(instance),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_engine_synchronously() {
        let err = ThrowawayDb::new(Options::default().with_db("mysql")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid/missing database type: mysql");
    }

    #[test]
    fn default_construction_is_new() {
        let db = ThrowawayDb::with_defaults().unwrap();
        assert_eq!(db.state(), InstanceState::New);
        assert!(db.info().is_none());
        assert!(db.work_dir().is_none());
        assert!(db.connection().is_none());
    }

    #[tokio::test]
    async fn stop_before_start_has_no_side_effects() {
        let db = ThrowawayDb::new(Options::default().with_exit_hooks(false)).unwrap();
        db.stop().await.unwrap();
        db.stop().await.unwrap();
        assert_eq!(db.state(), InstanceState::Stopped);
        assert_eq!(db.cleanup_passes(), 0);

        let err = db.start().ready().await.unwrap_err();
        assert!(matches!(err, Error::NotServing(_)));
    }

    #[tokio::test]
    async fn seed_after_stop_is_not_serving() {
        let db = ThrowawayDb::new(Options::default().with_exit_hooks(false)).unwrap();
        db.stop().await.unwrap();
        let err = db.create_db("test").await.unwrap_err();
        assert!(matches!(err, Error::NotServing(ref s) if s == "stopped"));
    }
}
