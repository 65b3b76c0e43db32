use std::sync::atomic::{AtomicU64, Ordering};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true when a record created at `created_unix_ms` is older than `retention_ms`.
pub fn is_older_than(created_unix_ms: u64, retention_ms: u64, now_unix_ms: u64) -> bool {
    now_unix_ms.saturating_sub(created_unix_ms) > retention_ms
}

/// Source of wall-clock time for components with time-bounded state.
pub trait Clock: Send + Sync {
    fn now_unix_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        current_unix_timestamp_ms()
    }
}

/// Clock that only moves when told to. Used to exercise expiry without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_unix_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_unix_ms: u64) -> Self {
        Self {
            now_unix_ms: AtomicU64::new(start_unix_ms),
        }
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_unix_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set_ms(&self, value_ms: u64) {
        self.now_unix_ms.store(value_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_ms(&self) -> u64 {
        self.now_unix_ms.load(Ordering::SeqCst)
    }
}
