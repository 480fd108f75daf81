use crate::error::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Opens client connections to a serving engine.
///
/// The wire protocol is the driver's business; the lifecycle only needs to
/// know when a connection can be established and how to close it.
#[async_trait]
pub trait ClientDriver: Send + Sync {
    /// Open one connection. Called repeatedly by [`connect_with_retry`].
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>>;
}

/// An open client connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn peer_addr(&self) -> SocketAddr;

    /// Close the connection. Must be idempotent.
    async fn close(&self);
}

/// Plain TCP driver: a connection is an open socket to the driver port.
#[derive(Debug, Default, Clone)]
pub struct TcpDriver;

#[async_trait]
impl ClientDriver for TcpDriver {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>> {
        let stream = TcpStream::connect((host, port)).await?;
        let peer = stream.peer_addr()?;
        Ok(Arc::new(TcpConnection {
            peer,
            stream: Mutex::new(Some(stream)),
        }))
    }
}

pub struct TcpConnection {
    peer: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpConnection {
    pub async fn is_open(&self) -> bool {
        self.stream.lock().await.is_some()
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn close(&self) {
        if let Some(stream) = self.stream.lock().await.take() {
            drop(stream);
            tracing::trace!("Closed client connection to {}", self.peer);
        }
    }
}

/// How hard [`connect_with_retry`] tries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    /// Overall budget across all attempts and backoff sleeps.
    pub timeout: Duration,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: usize, timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            timeout,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Connect with exponential backoff until `policy` is exhausted.
///
/// The delay starts at `initial_delay` and doubles each retry up to
/// `max_delay`. Neither an attempt nor a sleep may overrun the overall
/// deadline. Cancellation aborts immediately with [`Error::Cancelled`].
pub async fn connect_with_retry(
    driver: &dyn ClientDriver,
    host: &str,
    port: u16,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Connection>> {
    let deadline = Instant::now() + policy.timeout;
    let mut current_delay = policy.initial_delay;
    let mut last_error = String::from("no attempt made");
    let mut attempts = 0;

    while attempts < policy.attempts {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            last_error = format!("timed out after {:?}", policy.timeout);
            break;
        }
        attempts += 1;

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(remaining, driver.connect(host, port)) => result,
        };

        match attempt {
            Ok(Ok(conn)) => {
                tracing::debug!("Connected to {}:{} on attempt {}", host, port, attempts);
                return Ok(conn);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", policy.timeout),
        }
        tracing::trace!("Connect attempt {} to {}:{} failed: {}", attempts, host, port, last_error);

        // Don't sleep after the last attempt
        if attempts < policy.attempts {
            let pause = current_delay.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep(pause) => {}
            }
            // Exponential backoff: double the delay each time, capped at max_delay
            current_delay = std::cmp::min(current_delay * 2, policy.max_delay);
        }
    }

    Err(Error::ConnectFailed {
        host: host.to_string(),
        port,
        attempts,
        reason: last_error,
    })
}
