use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::OnceLock;

/// Lowest port the cursor will hand out (above the well-known range).
pub const MIN_PORT: u16 = 20_000;

/// Highest port the cursor will hand out (below the usual ephemeral range).
pub const MAX_PORT: u16 = 32_000;

/// Number of candidates probed before giving up.
pub const PROBE_WINDOW: usize = 1024;

static GLOBAL: OnceLock<PortAllocator> = OnceLock::new();

struct AllocatorState {
    /// Next candidate to probe. Only ever moves forward (modulo wrap).
    cursor: u16,
    /// Ports handed out and not yet released.
    allocated: HashSet<u16>,
}

/// Sequential port allocator for engine driver and cluster ports.
///
/// A candidate is considered free when a listener can be bound on loopback and
/// immediately dropped. Binding-and-closing cannot reserve the port, so the
/// engine may still lose a race for it; the instance then fails and the
/// caller starts a fresh one.
///
/// The cursor advances past every port handed out so concurrent instances in
/// this process never probe the same candidate twice, and ports already handed
/// out are skipped until released.
///
/// # Thread Safety
///
/// All state sits behind one `parking_lot::Mutex`; the lock is never held
/// across an `.await`.
pub struct PortAllocator {
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    /// Allocator whose cursor starts at `MIN_PORT` plus an offset derived from
    /// the process id, so parallel test processes start in different places.
    pub fn new() -> Self {
        let span = (MAX_PORT - MIN_PORT) as u32;
        let offset = (std::process::id().wrapping_mul(7919) % span) as u16;
        Self::with_cursor(MIN_PORT + offset)
    }

    /// Allocator starting at an explicit cursor (clamped into range).
    pub fn with_cursor(cursor: u16) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                cursor: cursor.clamp(MIN_PORT, MAX_PORT),
                allocated: HashSet::new(),
            }),
        }
    }

    /// Process-wide allocator shared by every instance.
    pub fn global() -> &'static PortAllocator {
        GLOBAL.get_or_init(PortAllocator::new)
    }

    /// Return one unused loopback port.
    pub fn acquire(&self) -> Result<u16> {
        let mut state = self.state.lock();

        for _ in 0..PROBE_WINDOW {
            let candidate = state.cursor;
            state.cursor = next_port(candidate);

            if state.allocated.contains(&candidate) {
                continue;
            }
            if is_port_available(candidate) {
                state.allocated.insert(candidate);
                tracing::trace!("Allocated port {}", candidate);
                return Ok(candidate);
            }
        }

        Err(Error::PortExhausted {
            window: PROBE_WINDOW,
        })
    }

    /// Return two distinct ports: `(driver_port, cluster_port)`.
    pub fn acquire_pair(&self) -> Result<(u16, u16)> {
        let driver = self.acquire()?;
        match self.acquire() {
            Ok(cluster) => Ok((driver, cluster)),
            Err(e) => {
                self.release(driver);
                Err(e)
            }
        }
    }

    /// Forget a port handed out earlier so it can be reused later.
    pub fn release(&self, port: u16) {
        self.state.lock().allocated.remove(&port);
    }

    /// Ports currently handed out.
    ///
    /// Returns a copy of the allocated ports to avoid holding the lock.
    pub fn allocated_ports(&self) -> Vec<u16> {
        self.state.lock().allocated.iter().copied().collect()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn next_port(port: u16) -> u16 {
    if port >= MAX_PORT {
        MIN_PORT
    } else {
        port + 1
    }
}

/// Whether a listener can currently be bound on `127.0.0.1:<port>`.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_returns_bindable_port() {
        let allocator = PortAllocator::new();
        let port = allocator.acquire().unwrap();

        assert!((MIN_PORT..=MAX_PORT).contains(&port));
        assert!(allocator.allocated_ports().contains(&port));
        // The probe listener was dropped, so the engine can bind it.
        assert!(is_port_available(port));
    }

    #[test]
    fn test_pair_is_distinct() {
        let allocator = PortAllocator::new();
        let (driver, cluster) = allocator.acquire_pair().unwrap();

        assert_ne!(driver, cluster);
        assert_eq!(allocator.allocated_ports().len(), 2);
    }

    #[test]
    fn test_cursor_moves_forward() {
        let allocator = PortAllocator::with_cursor(25_000);
        let first = allocator.acquire().unwrap();
        let second = allocator.acquire().unwrap();

        assert!(first >= 25_000);
        assert!(second > first);
    }

    #[test]
    fn test_skips_occupied_port() {
        // Occupy whatever port the cursor would hand out first
        let probe = PortAllocator::with_cursor(26_000);
        let start = probe.acquire().unwrap();
        let listener = TcpListener::bind(("127.0.0.1", start)).unwrap();

        let allocator = PortAllocator::with_cursor(start);
        let port = allocator.acquire().unwrap();
        assert_ne!(port, start);

        drop(listener);
    }

    #[test]
    fn test_release_allows_reuse_after_wrap() {
        let allocator = PortAllocator::with_cursor(MAX_PORT);
        let port = allocator.acquire().unwrap();
        allocator.release(port);

        assert!(!allocator.allocated_ports().contains(&port));
    }

    #[test]
    fn test_next_port_wraps() {
        assert_eq!(next_port(MAX_PORT), MIN_PORT);
        assert_eq!(next_port(MIN_PORT), MIN_PORT + 1);
    }

    #[test]
    fn test_with_cursor_clamps() {
        let allocator = PortAllocator::with_cursor(80);
        let port = allocator.acquire().unwrap();
        assert!(port >= MIN_PORT);
    }

    #[test]
    fn test_thread_safety_unique_ports() {
        use std::sync::Arc;
        use std::thread;

        let allocator = Arc::new(PortAllocator::new());

        let mut handles = vec![];
        for _ in 0..4 {
            let alloc = Arc::clone(&allocator);
            handles.push(thread::spawn(move || alloc.acquire_pair().unwrap()));
        }

        let mut ports: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| {
                let (a, b) = h.join().unwrap();
                [a, b]
            })
            .collect();

        ports.sort();
        ports.dedup();
        assert_eq!(ports.len(), 8, "All allocated ports should be unique");
    }
}
