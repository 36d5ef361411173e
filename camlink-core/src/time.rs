//! Time base shared by the bus, clock sync and stream accounting.
//!
//! Timestamps are signed nanoseconds. Every participant reads time from a
//! [`Clock`], so tests can run two participants with a known offset and no
//! jitter.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Signed nanoseconds, either an absolute timestamp or a difference.
pub type Nanos = i64;

pub const NANOS_PER_MILLI: Nanos = 1_000_000;
pub const NANOS_PER_SEC: Nanos = 1_000_000_000;

/// A source of timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Nanos;
}

/// Shared clock handle.
pub type ClockRef = Arc<dyn Clock>;

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Nanos {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as Nanos,
            Err(e) => -(e.duration().as_nanos() as Nanos),
        }
    }
}

/// Another clock shifted by a fixed amount.
///
/// `OffsetClock::new(base, -d)` models a device whose clock runs `d` behind
/// the host, so that `remote + d == local`.
#[derive(Debug)]
pub struct OffsetClock {
    base: ClockRef,
    offset: Nanos,
}

impl OffsetClock {
    pub fn new(base: ClockRef, offset: Nanos) -> Self {
        Self { base, offset }
    }

    pub fn offset(&self) -> Nanos {
        self.offset
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> Nanos {
        self.base.now().saturating_add(self.offset)
    }
}

/// A frozen clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Nanos) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, t: Nanos) {
        self.now.store(t, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Nanos) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nanos {
        self.now.load(Ordering::SeqCst)
    }
}

/// `(a + b) / 2` without the intermediate sum, so it cannot overflow.
///
/// Equals the exact sum divided and truncated toward zero when `a` and `b`
/// share a sign. With mixed signs and an odd sum the result can be one
/// off: `midpoint(-3, 4)` and `midpoint(-1, 2)` are both `1`, not `0`.
pub fn midpoint(a: Nanos, b: Nanos) -> Nanos {
    let (avg, carry) = midpoint_with_carry(a, b);
    avg + carry
}

/// Halves of `a` and `b`, and the combined remainder halved.
///
/// Returns `(a/2 + b/2, (a%2 + b%2) / 2)`. The second value is `±1` only
/// when both remainders are nonzero with the same sign; otherwise it is `0`.
pub fn midpoint_with_carry(a: Nanos, b: Nanos) -> (Nanos, Nanos) {
    let halves = a / 2 + b / 2;
    let leftover = a % 2 + b % 2;
    (halves, leftover / 2)
}

/// Exact running mean of integer samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningAverage {
    sum: i128,
    count: u64,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: Nanos) {
        self.sum += value as i128;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean of the samples so far, or 0 when empty.
    pub fn get(&self) -> Nanos {
        if self.count == 0 {
            return 0;
        }
        (self.sum / self.count as i128) as Nanos
    }
}

/// Render a nanosecond difference with a readable unit.
pub fn format_nanos(ns: Nanos) -> String {
    let abs = ns.unsigned_abs();
    let sign = if ns < 0 { "-" } else { "" };
    if abs >= NANOS_PER_SEC as u64 {
        format!("{sign}{:.3}s", abs as f64 / NANOS_PER_SEC as f64)
    } else if abs >= NANOS_PER_MILLI as u64 {
        format!("{sign}{:.3}ms", abs as f64 / NANOS_PER_MILLI as f64)
    } else if abs >= 1_000 {
        format!("{sign}{:.3}us", abs as f64 / 1_000.0)
    } else {
        format!("{sign}{abs}ns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_small_values() {
        assert_eq!(midpoint(2, 4), 3);
        assert_eq!(midpoint(3, 4), 3);
        assert_eq!(midpoint(3, 5), 4);
        assert_eq!(midpoint(-3, 0), -1);
        assert_eq!(midpoint(-3, -5), -4);
    }

    #[test]
    fn midpoint_does_not_overflow() {
        assert_eq!(midpoint(Nanos::MAX, Nanos::MAX), Nanos::MAX);
        assert_eq!(midpoint(Nanos::MAX, Nanos::MAX - 1), Nanos::MAX - 1);
        assert_eq!(midpoint(Nanos::MIN, Nanos::MIN), Nanos::MIN);

        let a = Nanos::MAX - 10;
        let b = Nanos::MAX - 3;
        let exact = ((a as i128 + b as i128) / 2) as Nanos;
        assert_eq!(midpoint(a, b), exact);
    }

    #[test]
    fn midpoint_mixed_signs_can_be_one_off() {
        assert_eq!(midpoint(-3, 4), 1);
        assert_eq!(midpoint(-1, 2), 1);
        assert_eq!(midpoint(3, -4), -1);
        // Same sign or even sum: exact.
        assert_eq!(midpoint(-2, 4), 1);
        assert_eq!(midpoint(-2, 5), 1);
    }

    #[test]
    fn midpoint_carry_is_reported() {
        assert_eq!(midpoint_with_carry(3, 5), (3, 1));
        assert_eq!(midpoint_with_carry(3, 4), (3, 0));
        assert_eq!(midpoint_with_carry(-3, -5), (-3, -1));
        assert_eq!(midpoint_with_carry(-3, 4), (1, 0));
    }

    #[test]
    fn running_average_is_exact() {
        let mut avg = RunningAverage::new();
        assert_eq!(avg.get(), 0);
        for v in [10, 20, 30] {
            avg.add(v);
        }
        assert_eq!(avg.get(), 20);
        assert_eq!(avg.count(), 3);

        let mut big = RunningAverage::new();
        big.add(Nanos::MAX);
        big.add(Nanos::MAX);
        assert_eq!(big.get(), Nanos::MAX);
    }

    #[test]
    fn offset_clock_shifts_base() {
        let base = Arc::new(ManualClock::new(1_000));
        let shifted = OffsetClock::new(base.clone(), -250);
        assert_eq!(shifted.now(), 750);
        base.advance(100);
        assert_eq!(shifted.now(), 850);
    }

    #[test]
    fn format_picks_unit() {
        assert_eq!(format_nanos(512), "512ns");
        assert_eq!(format_nanos(1_500), "1.500us");
        assert_eq!(format_nanos(-2 * NANOS_PER_MILLI), "-2.000ms");
        assert_eq!(format_nanos(3 * NANOS_PER_SEC), "3.000s");
    }
}
