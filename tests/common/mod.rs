//! Shared helpers for integration tests: stub engine scripts that mimic
//! rethinkdb's stderr output, and in-process client driver and seeder stubs.

#![allow(dead_code)]

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use throwaway_db::{ClientDriver, Connection, Error, Options, Result, SeedOperation, Seeder};

/// Which misbehaviour the stub engine should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stub {
    /// Behaves like a healthy rethinkdb, except that nothing listens on the
    /// driver port. If `STUB_PORT_FILE` is set, the driver port is written
    /// there so a test can listen on its behalf.
    Healthy,
    /// `serve` never prints the readiness line.
    NeverReady,
    /// `serve` reports a bind failure and exits 1.
    ServeExits,
    /// `create` fails with exit code 2.
    InitFails,
    /// `create` takes 30 seconds.
    SlowInit,
    /// `serve` ignores SIGTERM.
    StubbornServe,
}

const CREATE_OK: &str = r#"
    dir="$3"
    mkdir -p "$dir"
    echo "Initializing directory $dir" >&2
    echo "Created directory '$dir' and a metadata file inside it." >&2
"#;

const SERVE_OK: &str = r#"
    if [ -n "$STUB_PORT_FILE" ]; then
        echo "$3" > "$STUB_PORT_FILE.tmp" && mv "$STUB_PORT_FILE.tmp" "$STUB_PORT_FILE"
    fi
    echo "Running rethinkdb 2.4.4 (stub)..." >&2
    echo "Running on Linux" >&2
    echo "Loading data from directory $PWD/rethinkdb_data" >&2
    echo "Listening for client driver connections on port $3" >&2
    exec sleep 300
"#;

fn script(stub: Stub) -> String {
    let create = match stub {
        Stub::InitFails => {
            r#"
    echo "error: could not create directory" >&2
    exit 2
"#
        }
        Stub::SlowInit => "\n    sleep 30\n",
        _ => CREATE_OK,
    };
    let serve = match stub {
        Stub::NeverReady => {
            r#"
    echo "Running rethinkdb 2.4.4 (stub)..." >&2
    exec sleep 300
"#
        }
        Stub::ServeExits => {
            r#"
    echo "Running rethinkdb 2.4.4 (stub)..." >&2
    echo "error: Could not bind to driver port: Address already in use" >&2
    exit 1
"#
        }
        Stub::StubbornServe => {
            r#"
    trap '' TERM
    echo "Loading data from directory $PWD/rethinkdb_data" >&2
    while true; do sleep 0.1; done
"#
        }
        _ => SERVE_OK,
    };

    format!(
        "#!/bin/sh\ncase \"$1\" in\n  create){}    ;;\n  serve){}    ;;\n  *)\n    echo \"unknown command $1\" >&2\n    exit 64\n    ;;\nesac\n",
        create, serve
    )
}

struct StubDir {
    dir: TempDir,
}

static STUBS: OnceLock<StubDir> = OnceLock::new();

/// Path to an executable stub engine. All variants are written once per test
/// binary so no script is open for writing while tests spawn processes.
pub fn stub_engine(stub: Stub) -> PathBuf {
    let stubs = STUBS.get_or_init(|| {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("stub dir");
        for variant in [
            Stub::Healthy,
            Stub::NeverReady,
            Stub::ServeExits,
            Stub::InitFails,
            Stub::SlowInit,
            Stub::StubbornServe,
        ] {
            let path = dir.path().join(format!("{:?}", variant).to_lowercase());
            std::fs::write(&path, script(variant)).expect("write stub");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod stub");
        }
        StubDir { dir }
    });
    stubs
        .dir
        .path()
        .join(format!("{:?}", stub).to_lowercase())
}

/// Options for a stub engine under `root`, with short timeouts and no
/// process-wide exit hooks.
pub fn options(stub: Stub, root: &Path) -> Options {
    Options::default()
        .with_binary(stub_engine(stub))
        .with_temp_root(root)
        .with_exit_hooks(false)
        .with_sentinel_timeout(Duration::from_secs(10))
        .with_connect_timeout(Duration::from_secs(2))
        .with_connect_retries(3)
        .with_kill_grace(Duration::from_millis(500))
}

/// Whether a process with `pid` still exists (zombies count as gone once reaped).
pub fn process_exists(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Poll until `pid` is gone or `timeout` passes.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !process_exists(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !process_exists(pid)
}

/// Client driver that never touches the network.
#[derive(Default)]
pub struct StubDriver {
    /// Number of leading attempts that fail.
    pub fail_first: usize,
    pub attempts: AtomicUsize,
    pub connections: Mutex<Vec<Arc<StubConnection>>>,
}

impl StubDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            ..Default::default()
        })
    }

    pub fn last_connection(&self) -> Option<Arc<StubConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ClientDriver for StubDriver {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(Error::Internal(format!(
                "connection refused by {}:{}",
                host, port
            )));
        }
        let conn = Arc::new(StubConnection {
            peer: SocketAddr::new(host.parse().expect("ip host"), port),
            closed: AtomicBool::new(false),
        });
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

pub struct StubConnection {
    pub peer: SocketAddr,
    pub closed: AtomicBool,
}

impl StubConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for StubConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Seeder that records what it was asked to do.
#[derive(Default)]
pub struct RecordingSeeder {
    pub applied: Mutex<Vec<SeedOperation>>,
}

impl RecordingSeeder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied(&self) -> Vec<SeedOperation> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl Seeder for RecordingSeeder {
    async fn apply(&self, _conn: &Arc<dyn Connection>, op: &SeedOperation) -> Result<()> {
        self.applied.lock().unwrap().push(op.clone());
        Ok(())
    }
}
