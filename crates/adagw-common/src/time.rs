//! ---
//! gw_section: "01-core-functionality"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Shared primitives and utilities for the gateway runtime."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::MissedTickBehavior;

/// Wall-clock readings at or below this instant (2015-01-01T00:00:00Z) are
/// treated as a clock that has not been set yet.
pub const EPOCH_FLOOR: i64 = 1_420_070_400;

/// Returns `true` when `ts` can be a real wall-clock reading.
pub fn is_valid_timestamp(ts: i64) -> bool {
    ts > EPOCH_FLOOR
}

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + Debug {
    /// Seconds since the Unix epoch according to the (possibly wrong) system clock.
    fn unix_now(&self) -> i64;

    /// Seconds elapsed on a clock that never jumps.
    fn monotonic_secs(&self) -> i64;

    fn is_valid(&self) -> bool {
        is_valid_timestamp(self.unix_now())
    }
}

/// Clock backed by the operating system.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn unix_now(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn monotonic_secs(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_secs()).unwrap_or(i64::MAX)
    }
}

/// Hand-driven clock for simulations and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    wall: AtomicI64,
    monotonic: AtomicI64,
}

impl ManualClock {
    pub fn new(wall: i64) -> Self {
        Self {
            wall: AtomicI64::new(wall),
            monotonic: AtomicI64::new(0),
        }
    }

    pub fn set_wall(&self, wall: i64) {
        self.wall.store(wall, Ordering::SeqCst);
    }

    /// Move both clocks forward by `secs`.
    pub fn advance(&self, secs: i64) {
        self.wall.fetch_add(secs, Ordering::SeqCst);
        self.monotonic.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn unix_now(&self) -> i64 {
        self.wall.load(Ordering::SeqCst)
    }

    fn monotonic_secs(&self) -> i64 {
        self.monotonic.load(Ordering::SeqCst)
    }
}

/// Fixed-period loop pacing; late ticks are delayed rather than bunched.
#[derive(Debug)]
pub struct Cadence {
    interval: tokio::time::Interval,
}

impl Cadence {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) -> tokio::time::Instant {
        self.interval.tick().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_is_exclusive() {
        assert!(!is_valid_timestamp(EPOCH_FLOOR));
        assert!(is_valid_timestamp(EPOCH_FLOOR + 1));
        assert!(!is_valid_timestamp(1_000_000));
    }

    #[test]
    fn manual_clock_advances_both_axes() {
        let clock = ManualClock::new(1_000_000);
        assert!(!clock.is_valid());
        clock.advance(37);
        assert_eq!(clock.unix_now(), 1_000_037);
        assert_eq!(clock.monotonic_secs(), 37);
        clock.set_wall(1_700_000_000);
        assert!(clock.is_valid());
        assert_eq!(clock.monotonic_secs(), 37);
    }

    #[test]
    fn system_clock_is_past_the_floor() {
        assert!(SystemClock::new().is_valid());
    }
}
