use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic millisecond clock. Abstracted so timer logic can be tested without sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}

/// Milliseconds since the first time any [MonotonicClock] was queried in this process
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

static EPOCH: OnceLock<Instant> = OnceLock::new();

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        EPOCH.get_or_init(Instant::now)
            .elapsed()
            .as_millis() as u64
    }
}

/// A clock that moves only when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> ManualClock {
        ManualClock {
            millis: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::AcqRel);
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }
}
