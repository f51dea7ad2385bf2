//! Time abstraction.
//!
//! Every component that reasons about time (the duty-cycle sliding window,
//! the retry scheduler, reassembly-session expiry, neighbor timeout) takes a
//! clock capability instead of calling `Instant::now()` directly, so tests
//! can drive time deterministically instead of sleeping in real time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of monotonic milliseconds.
///
/// Implementations must be monotonically non-decreasing; callers (e.g. the
/// duty-cycle governor's sliding window) rely on that to age out records
/// without ever observing `now` go backwards.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since an implementation-defined epoch.
    fn now_ms(&self) -> u64;
}

/// Production clock backed by the system's real-time clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock tests can advance by hand.
///
/// Starts at an arbitrary fixed instant rather than 0 so that arithmetic
/// like `now - neighbor_timeout` in component logic doesn't need special
/// casing near the epoch.
#[derive(Debug)]
pub struct VirtualClock {
    now_ms: AtomicU64,
}

impl VirtualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Advance the clock by `delta_ms` and return the new time.
    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }

    pub fn set(&self, at_ms: u64) {
        self.now_ms.store(at_ms, Ordering::SeqCst);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Lets the facade hold a single shared `Arc<dyn Clock>` and pass it by
/// value into every component (duty-cycle governor, reassembler, queue,
/// reliability tracker, neighbor table) without those components needing
/// to be generic over a lifetime or know about `Arc` at all.
pub type SharedClock = Arc<dyn Clock>;

impl Clock for SharedClock {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}
