use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default interval between warnings about undelivered events.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Helper that rate limits warnings about dropped or undelivered events.
///
/// The caller increments the counter via [`record_drop`](Self::record_drop).
/// The next call to [`warn_if_due`](Self::warn_if_due) emits a warning using
/// the provided callback if the configured interval has elapsed.
/// [`flush`](Self::flush) emits a warning immediately if anything has been
/// counted since the last emission.
#[derive(Debug)]
pub struct RateLimitedWarner {
    origin: Instant,
    interval_ms: u64,
    /// Milliseconds since `origin` of the last warning, offset by one
    /// interval so the first warning fires immediately.
    last_warn: AtomicU64,
    dropped: AtomicU64,
}

impl Default for RateLimitedWarner {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}

impl RateLimitedWarner {
    /// Create a warner; the first warning can be emitted immediately.
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            last_warn: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        elapsed.saturating_add(self.interval_ms)
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of events counted since the last warning.
    pub fn pending(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Emit a warning if the rate limit interval has elapsed.
    pub fn warn_if_due(&self, mut warn: impl FnMut(u64)) {
        let now = self.now_ms();
        let prev = self.last_warn.load(Ordering::Relaxed);
        if now.saturating_sub(prev) >= self.interval_ms {
            let count = self.dropped.swap(0, Ordering::Relaxed);
            if count > 0 {
                warn(count);
                self.last_warn.store(now, Ordering::Relaxed);
            }
        }
    }

    /// Immediately warn about anything counted so far.
    pub fn flush(&self, mut warn: impl FnMut(u64)) {
        let count = self.dropped.swap(0, Ordering::Relaxed);
        if count > 0 {
            warn(count);
            self.last_warn.store(self.now_ms(), Ordering::Relaxed);
        }
    }
}
