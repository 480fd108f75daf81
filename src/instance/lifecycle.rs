use super::hooks;
use super::registry::{self, InstanceId};
use super::seed::{SeedOperation, SeedQueue, Seeder};
use super::state::InstanceState;
use crate::config::Options;
use crate::engine::{
    connect_with_retry, reap, ClientDriver, Connection, EngineDriver, RetryPolicy,
};
use crate::error::{Error, Result};
use crate::port::PortAllocator;
use crate::process::ProcessHandle;
use crate::tempdir;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Where a serving instance can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingInfo {
    pub id: InstanceId,
    pub host: String,
    pub driver_port: u16,
    pub cluster_port: u16,
    pub work_dir: PathBuf,
    pub data_dir: PathBuf,
    pub pid: u32,
}

/// Mutable bookkeeping. Guarded by a sync mutex never held across `.await`.
#[derive(Debug)]
struct Record {
    state: InstanceState,
    work_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    ports: Option<(u16, u16)>,
    pid: Option<u32>,
    error: Option<String>,
}

/// Runs cleanup at most once; later callers wait for the first pass.
struct CleanupLatch {
    started: AtomicBool,
    passes: AtomicUsize,
    done: watch::Sender<bool>,
}

impl CleanupLatch {
    fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            started: AtomicBool::new(false),
            passes: AtomicUsize::new(0),
            done,
        }
    }

    /// True for exactly one caller.
    fn try_begin(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn wait_done(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// One disposable database instance and the machinery that drives it.
///
/// Shared behind an `Arc` between the caller and the pipeline task. The
/// pipeline holds `lifecycle` for its whole run; `stop()` takes the same lock,
/// so teardown never overlaps a pipeline step.
pub struct Instance {
    id: InstanceId,
    options: Options,
    engine: EngineDriver,
    client: Arc<dyn ClientDriver>,
    seeder: Arc<dyn Seeder>,
    record: Mutex<Record>,
    child: Mutex<Option<Arc<ProcessHandle>>>,
    conn: Mutex<Option<Arc<dyn Connection>>>,
    seeds: Mutex<SeedQueue>,
    cancel: CancellationToken,
    lifecycle: Arc<AsyncMutex<()>>,
    started: AtomicBool,
    cleanup: CleanupLatch,
}

impl Instance {
    /// Validate `options` and build an instance in `New`. Allocates nothing.
    pub fn new(
        options: Options,
        client: Arc<dyn ClientDriver>,
        seeder: Arc<dyn Seeder>,
    ) -> Result<Self> {
        let kind = options.validate()?;
        let engine = EngineDriver::new(
            kind.spec(),
            options.engine_binary(kind),
            options.sentinel_timeout,
            options.kill_grace,
        );

        Ok(Self {
            id: InstanceId::next(),
            options,
            engine,
            client,
            seeder,
            record: Mutex::new(Record {
                state: InstanceState::New,
                work_dir: None,
                data_dir: None,
                ports: None,
                pid: None,
                error: None,
            }),
            child: Mutex::new(None),
            conn: Mutex::new(None),
            seeds: Mutex::new(SeedQueue::default()),
            cancel: CancellationToken::new(),
            lifecycle: Arc::new(AsyncMutex::new(())),
            started: AtomicBool::new(false),
            cleanup: CleanupLatch::new(),
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn state(&self) -> InstanceState {
        self.record.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.record.lock().error.clone()
    }

    pub fn work_dir(&self) -> Option<PathBuf> {
        self.record.lock().work_dir.clone()
    }

    pub fn ports(&self) -> Option<(u16, u16)> {
        self.record.lock().ports
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.conn.lock().clone()
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child.lock().as_ref().map(|c| c.pid())
    }

    /// Number of cleanup passes run so far (0 or 1).
    pub fn cleanup_passes(&self) -> usize {
        self.cleanup.passes.load(Ordering::SeqCst)
    }

    /// Failures of seed operations queued before `Serving`.
    pub fn seed_failures(&self) -> Vec<String> {
        self.seeds.lock().failures.clone()
    }

    /// Connection details, available only while serving.
    pub fn info(&self) -> Option<ServingInfo> {
        let record = self.record.lock();
        if record.state != InstanceState::Serving {
            return None;
        }
        self.info_from(&record)
    }

    fn info_from(&self, record: &Record) -> Option<ServingInfo> {
        let (driver_port, cluster_port) = record.ports?;
        Some(ServingInfo {
            id: self.id,
            host: self.options.host.clone(),
            driver_port,
            cluster_port,
            work_dir: record.work_dir.clone()?,
            data_dir: record.data_dir.clone()?,
            pid: record.pid?,
        })
    }

    /// Move `New -> Provisioning` and run the start pipeline on the runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<Result<ServingInfo>>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        // Taken before the task exists so a racing stop() waits for the pipeline.
        let guard = Arc::clone(&self.lifecycle)
            .try_lock_owned()
            .map_err(|_| Error::Internal("lifecycle lock held before start".to_string()))?;

        {
            let mut record = self.record.lock();
            if record.state != InstanceState::New {
                return Err(Error::NotServing(record.state.to_string()));
            }
            // Registered before anything is allocated so exit hooks see it.
            registry::register(self.id, self.options.kill_grace);
            self.set_state(&mut record, InstanceState::Provisioning)?;
        }

        if self.options.install_exit_hooks {
            hooks::install_once();
        }

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            this.run_pipeline().await
        }))
    }

    #[tracing::instrument(name = "start", skip(self), fields(instance = %self.id))]
    async fn run_pipeline(&self) -> Result<ServingInfo> {
        match self.drive().await {
            Ok(info) => {
                tracing::info!(
                    "Serving on {}:{} (cluster port {}, pid {})",
                    info.host,
                    info.driver_port,
                    info.cluster_port,
                    info.pid
                );
                self.drain_seeds().await;
                Ok(info)
            }
            // stop() (or the drop of the last handle) owns teardown.
            Err(_) if self.cancel.is_cancelled() => {
                self.abandon_seeds("start was cancelled");
                Err(Error::Cancelled)
            }
            Err(e) => {
                tracing::debug!("Start failed: {}", e);
                self.abandon_seeds("instance failed to start");
                self.record.lock().error = Some(e.to_string());
                self.run_cleanup().await;
                let mut record = self.record.lock();
                if let Err(transition) = self.set_state(&mut record, InstanceState::Failed) {
                    tracing::warn!("{}", transition);
                }
                Err(e)
            }
        }
    }

    async fn drive(&self) -> Result<ServingInfo> {
        // Provisioning
        let root = self.options.temp_root();
        let prefix = self.options.dir_prefix.clone();
        let work_dir = tokio::task::spawn_blocking(move || tempdir::make(&root, &prefix))
            .await
            .map_err(|e| Error::Internal(format!("temp dir task failed: {}", e)))??;
        self.record.lock().work_dir = Some(work_dir.clone());
        {
            let dir = work_dir.clone();
            registry::update(self.id, move |entry| entry.work_dir = Some(dir));
        }
        self.advance(InstanceState::PortAllocating)?;

        // PortAllocating
        let (driver_port, cluster_port) = PortAllocator::global().acquire_pair()?;
        self.record.lock().ports = Some((driver_port, cluster_port));
        registry::update(self.id, |entry| entry.ports = Some((driver_port, cluster_port)));
        self.advance(InstanceState::Initializing)?;

        // Initializing
        let data_dir = self.engine.prepare(&work_dir, &self.cancel).await?;
        self.record.lock().data_dir = Some(data_dir.clone());
        self.advance(InstanceState::Launching)?;

        // Launching
        let child = self
            .engine
            .serve(&work_dir, &data_dir, driver_port, cluster_port, &self.cancel)
            .await?;
        let pid = child.pid();
        *self.child.lock() = Some(Arc::new(child));
        self.record.lock().pid = Some(pid);
        registry::update(self.id, |entry| entry.child_pid = Some(pid));
        self.advance(InstanceState::Connecting)?;

        // Connecting
        let policy = RetryPolicy::new(self.options.connect_retries, self.options.connect_timeout);
        let conn = connect_with_retry(
            self.client.as_ref(),
            &self.options.host,
            driver_port,
            policy,
            &self.cancel,
        )
        .await?;
        *self.conn.lock() = Some(conn);

        let mut record = self.record.lock();
        self.set_state(&mut record, InstanceState::Serving)?;
        self.info_from(&record)
            .ok_or_else(|| Error::Internal("serving without connection details".to_string()))
    }

    /// Transition to the next pipeline step unless stop() has been requested.
    fn advance(&self, to: InstanceState) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut record = self.record.lock();
        self.set_state(&mut record, to)
    }

    fn set_state(&self, record: &mut Record, to: InstanceState) -> Result<()> {
        let from = record.state;
        if !from.is_valid_transition(to) {
            return Err(Error::Internal(format!(
                "invalid state transition {} -> {}",
                from, to
            )));
        }
        record.state = to;
        tracing::debug!(instance = %self.id, "State {} -> {}", from, to);
        Ok(())
    }

    /// Tear the instance down. Safe in every state and idempotent.
    #[tracing::instrument(name = "stop", skip(self), fields(instance = %self.id))]
    pub async fn stop(&self) -> Result<()> {
        {
            let mut record = self.record.lock();
            match record.state {
                InstanceState::New => {
                    // Nothing was allocated, so nothing to clean up
                    self.set_state(&mut record, InstanceState::Stopped)?;
                    return Ok(());
                }
                state if state.is_terminal() => return Ok(()),
                _ => {}
            }
        }

        self.cancel.cancel();
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut record = self.record.lock();
            if record.state.is_terminal() {
                return Ok(());
            }
            self.set_state(&mut record, InstanceState::Stopping)?;
        }

        self.run_cleanup().await;

        let mut record = self.record.lock();
        self.set_state(&mut record, InstanceState::Stopped)?;
        tracing::info!("Stopped");
        Ok(())
    }

    /// Kill the child, close the connection, release ports, remove the work
    /// dir and deregister. Runs at most once; failures are logged.
    async fn run_cleanup(&self) {
        if !self.cleanup.try_begin() {
            self.cleanup.wait_done().await;
            return;
        }
        self.cleanup.passes.fetch_add(1, Ordering::SeqCst);

        let child = self.child.lock().take();
        if let Some(child) = child {
            reap(&child, self.options.kill_grace).await;
        }

        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().await;
        }

        let (ports, work_dir) = {
            let record = self.record.lock();
            (record.ports, record.work_dir.clone())
        };
        if let Some((driver, cluster)) = ports {
            let allocator = PortAllocator::global();
            allocator.release(driver);
            allocator.release(cluster);
        }
        if let Some(dir) = work_dir {
            if let Err(e) = tempdir::remove(&dir).await {
                tracing::warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }

        registry::deregister(self.id);
        self.cleanup.done.send_replace(true);
    }

    /// Submit a seed operation: queued until `Serving`, applied directly after.
    pub async fn submit_seed(&self, op: SeedOperation) -> Result<()> {
        {
            let mut seeds = self.seeds.lock();
            let state = self.state();
            if state.is_terminal() || state == InstanceState::Stopping {
                return Err(Error::NotServing(state.to_string()));
            }
            if !seeds.drained {
                tracing::debug!("Queued seed operation: {}", op);
                seeds.pending.push(op);
                return Ok(());
            }
        }

        let conn = self
            .connection()
            .ok_or_else(|| Error::NotServing(self.state().to_string()))?;
        self.seeder.apply(&conn, &op).await
    }

    /// Apply operations queued before `Serving`. Failures are recorded, not fatal.
    async fn drain_seeds(&self) {
        let pending = {
            let mut seeds = self.seeds.lock();
            seeds.drained = true;
            std::mem::take(&mut seeds.pending)
        };
        let Some(conn) = self.connection() else {
            return;
        };

        for op in pending {
            if let Err(e) = self.seeder.apply(&conn, &op).await {
                tracing::warn!("Seed operation '{}' failed: {}", op, e);
                self.seeds.lock().failures.push(format!("{}: {}", op, e));
            }
        }
    }

    /// Record queued operations that will never run as failures.
    fn abandon_seeds(&self, reason: &str) {
        let mut seeds = self.seeds.lock();
        seeds.drained = true;
        let pending = std::mem::take(&mut seeds.pending);
        for op in pending {
            tracing::warn!("Seed operation '{}' not applied: {}", op, reason);
            seeds.failures.push(format!("{}: not applied: {}", op, reason));
        }
    }

    /// Cancel any in-flight pipeline step without waiting for it.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        let state = self.record.get_mut().state;
        if state.is_terminal() || state == InstanceState::New || !self.cleanup.try_begin() {
            return;
        }
        self.cleanup.passes.fetch_add(1, Ordering::SeqCst);

        // Best effort without a runtime: the child dies with its handle.
        if let Some(child) = self.child.get_mut().take() {
            child.kill_now();
        }
        let record = self.record.get_mut();
        if let Some((driver, cluster)) = record.ports {
            PortAllocator::global().release(driver);
            PortAllocator::global().release(cluster);
        }
        if let Some(dir) = record.work_dir.as_ref() {
            if let Err(e) = tempdir::remove_blocking(dir) {
                tracing::warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }
        registry::deregister(self.id);
        tracing::debug!(instance = %self.id, "Swept on drop in state {}", state);
    }
}
