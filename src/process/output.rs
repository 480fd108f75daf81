//! Output capture for supervised child processes.
//!
//! Each captured pipe gets a background task that splits it into lines and
//! publishes them on a broadcast channel, so any number of readers can observe
//! a tee'd copy of the same stream. Stderr lines are also kept in a small ring
//! buffer for error reports.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Lines buffered per pipe before slow readers start lagging.
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Stderr lines kept for error messages.
const DEFAULT_TAIL_LINES: usize = 50;

/// A lazy, finite sequence of lines read from one child pipe.
///
/// Ends when the pipe closes. Not restartable: lines consumed from one stream
/// are gone for that stream, though other tee'd streams still see them.
pub struct LineStream {
    rx: broadcast::Receiver<String>,
    source: &'static str,
}

impl LineStream {
    /// Next line, or `None` once the pipe has closed.
    ///
    /// A reader that falls behind by more than the channel capacity skips the
    /// lines it missed and carries on.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(line) => return Some(line),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("{} reader lagged, skipped {} line(s)", self.source, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Hands out readers for one pipe.
///
/// The first reader sees every line since the pipe was opened; later readers
/// start at the current position.
struct LineTee {
    first: Mutex<Option<broadcast::Receiver<String>>>,
    template: broadcast::Receiver<String>,
    source: &'static str,
}

impl LineTee {
    fn new(source: &'static str) -> (broadcast::Sender<String>, Self) {
        let (tx, rx) = broadcast::channel(LINE_CHANNEL_CAPACITY);
        let template = rx.resubscribe();
        let tee = Self {
            first: Mutex::new(Some(rx)),
            template,
            source,
        };
        (tx, tee)
    }

    fn subscribe(&self) -> LineStream {
        let rx = self
            .first
            .lock()
            .take()
            .unwrap_or_else(|| self.template.resubscribe());
        LineStream {
            rx,
            source: self.source,
        }
    }
}

/// Captures a child's stdout and stderr as line streams.
///
/// Uses `std::sync::Mutex` for the task list so `Drop` can abort the reader
/// tasks synchronously.
pub struct OutputCapture {
    name: String,
    stdout: LineTee,
    stderr: LineTee,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl OutputCapture {
    /// Start reader tasks for whichever pipes are present.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(name: &str, stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> Self {
        let (stdout_tx, stdout_tee) = LineTee::new("stdout");
        let (stderr_tx, stderr_tee) = LineTee::new("stderr");
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(DEFAULT_TAIL_LINES)));
        let shutdown = Arc::new(Notify::new());
        let mut tasks = Vec::new();

        // A missing pipe drops its sender here, so its streams end immediately.
        if let Some(stdout) = stdout {
            tasks.push(spawn_reader(
                name.to_string(),
                "stdout",
                stdout,
                stdout_tx,
                None,
                shutdown.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            tasks.push(spawn_reader(
                name.to_string(),
                "stderr",
                stderr,
                stderr_tx,
                Some(stderr_tail.clone()),
                shutdown.clone(),
            ));
        }

        Self {
            name: name.to_string(),
            stdout: stdout_tee,
            stderr: stderr_tee,
            stderr_tail,
            tasks: StdMutex::new(tasks),
            shutdown,
        }
    }

    pub fn stdout_lines(&self) -> LineStream {
        self.stdout.subscribe()
    }

    pub fn stderr_lines(&self) -> LineStream {
        self.stderr.subscribe()
    }

    /// The last `n` stderr lines seen so far, oldest first.
    pub fn recent_stderr(&self, n: usize) -> Vec<String> {
        let tail = self.stderr_tail.lock();
        tail.iter().rev().take(n).rev().cloned().collect()
    }

    /// Stop the reader tasks, which closes every outstanding [`LineStream`].
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();

        // Give tasks a moment to exit gracefully, then abort any remaining
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.drain(..) {
            task.abort();
        }
        tracing::trace!("Output capture for '{}' shut down", self.name);
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

fn spawn_reader<R>(
    name: String,
    source: &'static str,
    pipe: R,
    tx: broadcast::Sender<String>,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            tracing::trace!(process = %name, "[{}] {}", source, line);
                            if let Some(ref tail) = tail {
                                let mut tail = tail.lock();
                                if tail.len() == DEFAULT_TAIL_LINES {
                                    tail.pop_front();
                                }
                                tail.push_back(line.clone());
                            }
                            // No live readers is fine; the line is simply dropped.
                            let _ = tx.send(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!("Reading {} of '{}' failed: {}", source, name, e);
                            break;
                        }
                    }
                }
            }
        }
    })
}
