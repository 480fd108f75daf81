//! The demo binary tears its instance down when it receives SIGTERM.

mod common;

use common::{stub_engine, wait_for_exit, Stub};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::Command;

/// Wait for the stub engine to report its driver port, then accept client
/// connections on it for the rest of the test.
async fn listen_for_engine(port_file: PathBuf) -> tokio::task::JoinHandle<()> {
    let port = loop {
        if let Ok(text) = std::fs::read_to_string(&port_file) {
            if let Ok(port) = text.trim().parse::<u16>() {
                break port;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        let mut accepted = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            accepted.push(stream);
        }
    })
}

#[tokio::test]
async fn test_sigterm_cleans_up_engine_and_dir() {
    let root = tempfile::tempdir().unwrap();
    let port_file = root.path().join("driver-port");
    let mut child = Command::new(env!("CARGO_BIN_EXE_throwaway-db"))
        .env("STUB_PORT_FILE", &port_file)
        .arg("--binary")
        .arg(stub_engine(Stub::Healthy))
        .arg("--temp-root")
        .arg(root.path())
        .arg("--startup-timeout")
        .arg("10s")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("spawn demo binary");

    let listener = tokio::time::timeout(Duration::from_secs(20), listen_for_engine(port_file))
        .await
        .expect("stub engine should report its driver port");

    let stdout = child.stdout.take().unwrap();
    let mut lines = BufReader::new(stdout).lines();
    let mut work_dir = None;
    let mut engine_pid = None;

    let read = async {
        while let Some(line) = lines.next_line().await.unwrap() {
            if let Some(dir) = line.strip_prefix("work dir:") {
                work_dir = Some(PathBuf::from(dir.trim()));
            }
            if let Some(pid) = line.strip_prefix("pid:") {
                engine_pid = Some(pid.trim().parse::<u32>().unwrap());
            }
            if line.starts_with("Press Ctrl-C") {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(20), read)
        .await
        .expect("binary should report a serving instance");

    let work_dir = work_dir.expect("work dir printed");
    let engine_pid = engine_pid.expect("pid printed");
    assert!(work_dir.is_dir());

    let binary_pid = Pid::from_raw(child.id().unwrap() as i32);
    kill(binary_pid, Signal::SIGTERM).unwrap();

    let status = tokio::time::timeout(Duration::from_secs(20), child.wait())
        .await
        .expect("binary should exit after SIGTERM")
        .unwrap();

    // Graceful stop exits 0; the exit hook exits 128 + SIGTERM.
    assert!(
        status.code() == Some(0) || status.code() == Some(143),
        "unexpected status {status:?}"
    );
    assert!(wait_for_exit(engine_pid, Duration::from_secs(5)).await);
    assert!(!work_dir.exists());
    listener.abort();
}
