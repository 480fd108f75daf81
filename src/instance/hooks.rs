//! Host-exit cleanup: termination signals, panics and normal process exit.
//!
//! Installed at most once per process. Every path funnels into
//! [`registry::sweep_all_blocking`], which drains what it sweeps, so running
//! it from several paths is harmless.

use super::registry;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

static INSTALL: Once = Once::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the signal, panic and at-exit hooks unless already installed.
///
/// The hooks take over SIGINT, SIGTERM and SIGQUIT for the whole process:
/// on any of them every registered instance is swept and the process exits
/// with `128 + signo`, even if the host application also listens for that
/// signal. Hosts that want to handle termination themselves should set
/// `Options::install_exit_hooks` to false and call `stop()`.
///
/// The panic hook only sweeps for panics the process cannot recover from
/// (see [`panic_is_fatal`]); other panics leave live instances alone.
pub fn install_once() {
    INSTALL.call_once(|| {
        install_panic_hook();
        install_atexit();
        install_signal_thread();
        INSTALLED.store(true, Ordering::SeqCst);
        tracing::debug!("Installed host-exit cleanup hooks");
    });
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

/// Sweep everything, swallowing panics.
fn sweep(reason: &str) {
    let result = panic::catch_unwind(AssertUnwindSafe(registry::sweep_all_blocking));
    match result {
        Ok(report) if report.instances > 0 || report.dirs_removed > 0 => {
            tracing::info!(
                "Cleaned up {} instance(s) and {} dir(s) on {}",
                report.instances,
                report.dirs_removed,
                reason
            );
        }
        Ok(_) => {}
        Err(_) => eprintln!("throwaway-db: cleanup on {} panicked", reason),
    }
}

/// Whether a panic raised on the current thread ends the process.
///
/// With `panic = "abort"` every panic does. Otherwise only the main thread's
/// can; a panic on any other thread may be caught by `join`, a task runtime
/// or `catch_unwind`, and the rest of the process keeps running.
pub fn panic_is_fatal() -> bool {
    cfg!(panic = "abort") || std::thread::current().name() == Some("main")
}

fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if panic_is_fatal() {
            sweep("panic");
        }
        previous(info);
    }));
}

extern "C" fn sweep_at_exit() {
    sweep("exit");
}

fn install_atexit() {
    // SAFETY: `sweep_at_exit` is a plain `extern "C"` function that never
    // unwinds (panics are caught inside `sweep`).
    let rc = unsafe { libc::atexit(sweep_at_exit) };
    if rc != 0 {
        tracing::warn!("Could not register at-exit cleanup (atexit returned {})", rc);
    }
}

/// Wait for SIGINT, SIGTERM or SIGQUIT on a dedicated thread, sweep, then
/// exit with `128 + signo`.
fn install_signal_thread() {
    let spawned = std::thread::Builder::new()
        .name("throwaway-db-signals".to_string())
        .spawn(|| {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::warn!("Signal cleanup disabled: {}", e);
                    return;
                }
            };

            match runtime.block_on(wait_for_termination_signal()) {
                Ok(signo) => {
                    sweep("signal");
                    std::process::exit(128 + signo);
                }
                Err(e) => tracing::warn!("Signal cleanup disabled: {}", e),
            }
        });

    if let Err(e) = spawned {
        tracing::warn!("Could not start signal cleanup thread: {}", e);
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() -> std::io::Result<i32> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let signo = tokio::select! {
        _ = sigint.recv() => libc::SIGINT,
        _ = sigterm.recv() => libc::SIGTERM,
        _ = sigquit.recv() => libc::SIGQUIT,
    };
    Ok(signo)
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() -> std::io::Result<i32> {
    tokio::signal::ctrl_c().await?;
    Ok(2)
}
