use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Wall-clock source shared by every component that stores timestamps in the
/// coordination store (token buckets, lock leases).
///
/// Timestamps cross process boundaries, so they are epoch milliseconds rather than
/// monotonic instants.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// System clock backed by `chrono::Utc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually advanced clock for deterministic tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        self.now
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
