//! Process-wide record of live instances, read by the host-exit hooks.
//!
//! Entries are added before an instance spawns anything and removed by its
//! cleanup. Whatever is still registered when the host exits is swept
//! synchronously by [`sweep_all_blocking`].

use crate::port::PortAllocator;
use crate::process::terminate_pid_blocking;
use crate::tempdir;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

/// How long exit paths wait for the registry lock before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

static REGISTRY: OnceLock<Mutex<HashMap<InstanceId, RegistryEntry>>> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<InstanceId, RegistryEntry>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Process-unique instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        InstanceId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db-{}", self.0)
    }
}

/// What the exit hooks need to clean up after one instance.
#[derive(Debug, Clone, Default)]
pub struct RegistryEntry {
    pub work_dir: Option<PathBuf>,
    pub child_pid: Option<u32>,
    pub ports: Option<(u16, u16)>,
    /// SIGTERM to SIGKILL grace for the child.
    pub kill_grace: Duration,
}

pub fn register(id: InstanceId, kill_grace: Duration) {
    registry().lock().insert(
        id,
        RegistryEntry {
            kill_grace,
            ..Default::default()
        },
    );
}

/// Apply `f` to the entry for `id`, if registered.
pub fn update(id: InstanceId, f: impl FnOnce(&mut RegistryEntry)) {
    if let Some(entry) = registry().lock().get_mut(&id) {
        f(entry);
    }
}

pub fn deregister(id: InstanceId) -> Option<RegistryEntry> {
    registry().lock().remove(&id)
}

pub fn get(id: InstanceId) -> Option<RegistryEntry> {
    registry().lock().get(&id).cloned()
}

pub fn is_registered(id: InstanceId) -> bool {
    registry().lock().contains_key(&id)
}

/// Outcome of a synchronous sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub instances: usize,
    pub children_terminated: usize,
    pub dirs_removed: usize,
}

/// Terminate children and remove work dirs of the given entries.
///
/// Blocks the calling thread. Failures are logged and skipped.
pub fn sweep_entries(entries: Vec<RegistryEntry>, allocator: &PortAllocator) -> SweepReport {
    let mut report = SweepReport {
        instances: entries.len(),
        ..Default::default()
    };

    for entry in entries {
        if let Some(pid) = entry.child_pid {
            if terminate_pid_blocking(pid, entry.kill_grace) {
                report.children_terminated += 1;
            }
        }
        if let Some(dir) = entry.work_dir {
            match tempdir::remove_blocking(&dir) {
                Ok(()) => report.dirs_removed += 1,
                Err(e) => tracing::warn!("Failed to remove {}: {}", dir.display(), e),
            }
        }
        if let Some((driver, cluster)) = entry.ports {
            allocator.release(driver);
            allocator.release(cluster);
        }
    }

    report
}

/// Drain the registry and sweep every entry, then every tracked temp dir.
///
/// Used by the host-exit hooks. Never panics; if the registry lock cannot be
/// taken in time only the temp dirs are swept.
pub fn sweep_all_blocking() -> SweepReport {
    let entries: Vec<RegistryEntry> = match registry().try_lock_for(LOCK_TIMEOUT) {
        Some(mut map) => map.drain().map(|(_, entry)| entry).collect(),
        None => {
            tracing::warn!("Registry lock unavailable, sweeping temp dirs only");
            Vec::new()
        }
    };

    let mut report = sweep_entries(entries, PortAllocator::global());
    report.dirs_removed += tempdir::cleanup();
    report
}
