//! Round-trip clock offset estimation.
//!
//! Each iteration exchanges four timestamps:
//!
//! ```text
//!  host   t0 ──── Sync{i, t0} ────►  t1  device
//!  host   t3 ◄── Reply{t0,t1,t2} ──  t2  device
//!
//!  offset_i = mid(t0, t3) - mid(t1, t2)        so that device + offset ≈ host
//! ```
//!
//! Iteration 0 is a warm-up and is discarded.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::Result;
use crate::remote::RemoteDevice;
use crate::time::{Nanos, RunningAverage, format_nanos, midpoint};

/// Per-iteration reply wait used by the tools.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// One completed round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    pub iteration: u64,
    /// Host send time.
    pub t0: Nanos,
    /// Device receive time.
    pub t1: Nanos,
    /// Device reply time.
    pub t2: Nanos,
    /// Host receive time as stamped by the transport.
    pub t3: Nanos,
    /// Host time when the reply was processed.
    pub processed: Nanos,
}

impl SyncSample {
    /// Estimated `host - device` offset for this round trip.
    pub fn offset(&self) -> Nanos {
        midpoint(self.t0, self.t3) - midpoint(self.t1, self.t2)
    }

    /// Round-trip time excluding the device's turnaround.
    pub fn round_trip(&self) -> Nanos {
        (self.t3 - self.t0) - (self.t2 - self.t1)
    }
}

/// Result of one synchronization run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffsetStats {
    pub average: Nanos,
    pub min: Nanos,
    pub max: Nanos,
    /// Iterations that contributed.
    pub samples: u64,
}

impl OffsetStats {
    /// Change from `self` to a `later` run.
    pub fn drift(&self, later: &OffsetStats) -> OffsetStats {
        OffsetStats {
            average: later.average - self.average,
            min: later.min - self.min,
            max: later.max - self.max,
            samples: later.samples.min(self.samples),
        }
    }
}

impl fmt::Display for OffsetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "avg {} / min {} / max {} ({} samples)",
            format_nanos(self.average),
            format_nanos(self.min),
            format_nanos(self.max),
            self.samples
        )
    }
}

/// Accumulates round trips into [`OffsetStats`].
#[derive(Debug, Default)]
pub struct OffsetEstimator {
    average: RunningAverage,
    min: Nanos,
    max: Nanos,
}

impl OffsetEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sample: &SyncSample) {
        let offset = sample.offset();
        debug!(
            iteration = sample.iteration,
            t0 = sample.t0,
            t1 = sample.t1,
            t2 = sample.t2,
            t3 = sample.t3,
            processed = sample.processed,
            "sync offset {}",
            format_nanos(offset)
        );
        if sample.iteration == 0 {
            return;
        }
        if self.average.count() == 0 {
            self.min = offset;
            self.max = offset;
        } else {
            self.min = self.min.min(offset);
            self.max = self.max.max(offset);
        }
        self.average.add(offset);
    }

    pub fn stats(&self) -> OffsetStats {
        OffsetStats {
            average: self.average.get(),
            min: self.min,
            max: self.max,
            samples: self.average.count(),
        }
    }
}

/// Run `iterations` round trips against `device`.
///
/// `iterations == 0` skips synchronization and yields a zero offset. A
/// reply that does not arrive within `timeout` aborts the run.
pub async fn run_clock_sync(
    device: &RemoteDevice,
    iterations: u64,
    timeout: Duration,
) -> Result<OffsetStats> {
    if iterations == 0 {
        return Ok(OffsetStats::default());
    }
    let mut estimator = OffsetEstimator::new();
    for iteration in 0..iterations {
        let sample = device.sync_round(iteration, timeout).await?;
        estimator.add(&sample);
    }
    let stats = estimator.stats();
    info!("{}: clock offset {stats}", device.address());
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(iteration: u64, t0: Nanos, t1: Nanos, t2: Nanos, t3: Nanos) -> SyncSample {
        SyncSample {
            iteration,
            t0,
            t1,
            t2,
            t3,
            processed: t3,
        }
    }

    #[test]
    fn symmetric_round_trip_gives_exact_offset() {
        // Device is 5000 behind; 100 each way; 20 turnaround.
        let s = sample(1, 10_000, 5_100, 5_120, 10_220);
        assert_eq!(s.offset(), 5_000);
        assert_eq!(s.round_trip(), 200);
    }

    #[test]
    fn first_iteration_is_discarded() {
        let mut est = OffsetEstimator::new();
        est.add(&sample(0, 0, 1_000_000, 1_000_000, 0));
        est.add(&sample(1, 100, 50, 50, 100));
        est.add(&sample(2, 200, 140, 140, 200));
        let stats = est.stats();
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.min, 50);
        assert_eq!(stats.max, 60);
        assert_eq!(stats.average, 55);
    }

    #[test]
    fn large_timestamps_do_not_overflow() {
        let base = Nanos::MAX - 1_000;
        let s = sample(1, base, base - 300, base - 300, base);
        assert_eq!(s.offset(), 300);
    }

    #[test]
    fn drift_between_runs() {
        let before = OffsetStats {
            average: 1_000,
            min: 900,
            max: 1_100,
            samples: 9,
        };
        let after = OffsetStats {
            average: 1_250,
            min: 1_200,
            max: 1_300,
            samples: 9,
        };
        let drift = before.drift(&after);
        assert_eq!(drift.average, 250);
        assert_eq!(drift.min, 300);
        assert_eq!(drift.max, 200);
    }

    #[test]
    fn empty_estimator_is_zero() {
        assert_eq!(OffsetEstimator::new().stats(), OffsetStats::default());
    }
}
