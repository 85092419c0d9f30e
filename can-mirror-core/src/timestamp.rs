//! Timestamp synchronization
//!
//! Received frames carry the driver's hardware timestamp while transmitted
//! frames and operator comments only have the host clock. [`TimestampSync`]
//! maps both onto the host monotonic clock so a log session has a single
//! increasing time base.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Host monotonic clock in microseconds
pub trait MonotonicClock: Send + Sync {
    fn now_us(&self) -> u64;

    fn now_ms(&self) -> f64 {
        self.now_us() as f64 / 1000.0
    }
}

/// Clock shared between components
pub type SharedClock = Arc<dyn MonotonicClock>;

/// Monotonic clock backed by [`Instant`], counting from its creation
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Convenience constructor for the shared form
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Arc<Self> {
        Arc::new(Self {
            now_us: AtomicU64::new(start_us),
        })
    }

    pub fn set_us(&self, now_us: u64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    pub fn advance_us(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        self.advance_us(delta_ms * 1000);
    }
}

impl MonotonicClock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

/// Per-connection mapping of driver timestamps onto the host clock.
///
/// The offset is frozen by the first driver timestamp seen. A new instance
/// must be used for every connection session because the hardware counter
/// may restart after a reconnect.
pub struct TimestampSync {
    clock: SharedClock,
    offset_us: Option<i64>,
}

impl TimestampSync {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            offset_us: None,
        }
    }

    /// Map a driver timestamp (or `None` for host-originated events) onto
    /// the session's time base
    pub fn to_log_timestamp(&mut self, driver_ts_us: Option<u64>) -> u64 {
        let mono_us = self.clock.now_us();
        match driver_ts_us {
            Some(driver_us) => {
                let offset = *self
                    .offset_us
                    .get_or_insert_with(|| mono_us as i64 - driver_us as i64);
                (driver_us as i64 + offset).max(0) as u64
            }
            None => mono_us,
        }
    }

    /// The frozen offset, if a driver timestamp has been seen
    pub fn offset_us(&self) -> Option<i64> {
        self.offset_us
    }

    /// Forget the offset; the next driver timestamp freezes a new one
    pub fn reset(&mut self) {
        self.offset_us = None;
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_driver_timestamp_freezes_offset() {
        let clock = ManualClock::new(5_000_000);
        let mut sync = TimestampSync::new(clock.clone());

        assert_eq!(sync.to_log_timestamp(Some(1_000)), 5_000_000);
        assert_eq!(sync.offset_us(), Some(4_999_000));

        clock.advance_ms(10);
        // Driver time keeps its own spacing regardless of the host clock
        assert_eq!(sync.to_log_timestamp(Some(3_000)), 5_002_000);
    }

    #[test]
    fn test_differences_are_preserved() {
        let clock = ManualClock::new(10_000_000);
        let mut sync = TimestampSync::new(clock.clone());
        let pairs = [(10_u64, 250_u64), (1_000, 70), (123_456, 654_321)];

        sync.to_log_timestamp(Some(5_000));
        for (d1, d2) in pairs {
            clock.advance_us(17);
            let a = sync.to_log_timestamp(Some(d1)) as i64;
            let b = sync.to_log_timestamp(Some(d2)) as i64;
            assert_eq!(a - b, d1 as i64 - d2 as i64);
        }
    }

    #[test]
    fn test_host_events_use_monotonic_clock() {
        let clock = ManualClock::new(42);
        let mut sync = TimestampSync::new(clock.clone());
        assert_eq!(sync.to_log_timestamp(None), 42);
        assert_eq!(sync.offset_us(), None);
    }

    #[test]
    fn test_reset_allows_new_origin() {
        let clock = ManualClock::new(1_000_000);
        let mut sync = TimestampSync::new(clock.clone());
        sync.to_log_timestamp(Some(900_000));

        sync.reset();
        clock.advance_ms(1);
        // Hardware counter restarted near zero after a reconnect
        assert_eq!(sync.to_log_timestamp(Some(10)), 1_001_000);
    }
}
