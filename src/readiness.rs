//! Readiness detection by watching a child's output for a sentinel substring.

use crate::process::LineStream;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why no sentinel line was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelError {
    /// The deadline passed first.
    Timeout(Duration),
    /// The stream ended first, normally because the child exited.
    StreamClosed,
    /// The token was cancelled first.
    Cancelled,
}

/// Consume `lines` until one contains `sentinel`.
///
/// Matching is a plain substring test on each line. Lines before the match
/// are discarded; lines after it stay in the stream.
pub async fn wait_for_sentinel(
    lines: &mut LineStream,
    sentinel: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), SentinelError> {
    let scan = async {
        while let Some(line) = lines.next_line().await {
            if line.contains(sentinel) {
                tracing::debug!("Readiness sentinel seen: {}", line);
                return Ok(());
            }
        }
        Err(SentinelError::StreamClosed)
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SentinelError::Cancelled),
        result = tokio::time::timeout(timeout, scan) => {
            result.unwrap_or(Err(SentinelError::Timeout(timeout)))
        }
    }
}
