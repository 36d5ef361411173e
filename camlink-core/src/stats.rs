//! Per-stream loss and latency accounting.

use std::fmt;

use crate::time::{Nanos, RunningAverage, format_nanos};

/// Counters for one stream. Owned and updated by a single consumer.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub name: String,
    /// Frames observed.
    pub count: u64,
    /// Non-consecutive sequence numbers observed (gaps, repeats, reorders).
    pub drops: u64,
    pub last_sequence: u64,
    pub min_transit: Nanos,
    pub max_transit: Nanos,
    transit: RunningAverage,
    first_reception: Nanos,
    last_reception: Nanos,
}

impl StreamStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Account for one frame.
    ///
    /// `source` is the device-side send time, `reception` the host-side
    /// receive time and `clock_offset` the estimated `host - device` offset.
    pub fn record(&mut self, sequence: u64, source: Nanos, reception: Nanos, clock_offset: Nanos) {
        if self.count > 0 && self.last_sequence.wrapping_add(1) != sequence {
            self.drops += 1;
        }

        let transit = reception.saturating_sub(source.saturating_add(clock_offset));
        if self.count == 0 {
            self.min_transit = transit;
            self.max_transit = transit;
            self.first_reception = reception;
        } else {
            self.min_transit = self.min_transit.min(transit);
            self.max_transit = self.max_transit.max(transit);
        }
        self.transit.add(transit);
        self.last_reception = reception;

        self.count += 1;
        self.last_sequence = sequence;
    }

    pub fn avg_transit(&self) -> Nanos {
        self.transit.get()
    }

    /// Time between the first and last received frame.
    pub fn span(&self) -> Nanos {
        self.last_reception - self.first_reception
    }

    /// Human-readable multi-line summary.
    pub fn report(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StreamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stream '{}'", self.name)?;
        writeln!(f, "  frames:      {}", self.count)?;
        writeln!(f, "  drops:       {}", self.drops)?;
        if self.count == 0 {
            return Ok(());
        }
        writeln!(f, "  last number: {}", self.last_sequence)?;
        writeln!(f, "  span:        {}", format_nanos(self.span()))?;
        write!(
            f,
            "  transit:     avg {} / min {} / max {}",
            format_nanos(self.avg_transit()),
            format_nanos(self.min_transit),
            format_nanos(self.max_transit)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(seqs: &[u64]) -> StreamStats {
        let mut stats = StreamStats::new("depth");
        for (i, &seq) in seqs.iter().enumerate() {
            let t = i as Nanos * 1_000;
            stats.record(seq, t, t + 50, 0);
        }
        stats
    }

    #[test]
    fn single_gap_counts_once() {
        let stats = feed(&[0, 1, 2, 5, 6]);
        assert_eq!(stats.drops, 1);
        assert_eq!(stats.count, 5);
        assert_eq!(stats.last_sequence, 6);
    }

    #[test]
    fn consecutive_has_no_drops() {
        assert_eq!(feed(&[0, 1, 2, 3, 4]).drops, 0);
    }

    #[test]
    fn repeats_and_reorders_count_as_drops() {
        // 1 repeated, then 3 before 2: every non-consecutive step counts.
        assert_eq!(feed(&[0, 1, 1, 3, 2]).drops, 3);
    }

    #[test]
    fn last_sequence_follows_observed_value() {
        let stats = feed(&[10, 20, 21]);
        assert_eq!(stats.drops, 1);
        assert_eq!(stats.last_sequence, 21);
    }

    #[test]
    fn transit_applies_clock_offset() {
        let mut stats = StreamStats::new("rgb");
        // Device clock runs 1000 behind the host; offset = host - device.
        stats.record(0, 9_000, 10_100, 1_000);
        stats.record(1, 9_100, 10_400, 1_000);
        stats.record(2, 9_200, 10_250, 1_000);
        assert_eq!(stats.min_transit, 50);
        assert_eq!(stats.max_transit, 300);
        assert_eq!(stats.avg_transit(), 150);
        assert_eq!(stats.span(), 150);
    }

    #[test]
    fn first_frame_sets_min_and_max() {
        let mut stats = StreamStats::new("imu");
        stats.record(0, 0, 500, 0);
        assert_eq!(stats.min_transit, 500);
        assert_eq!(stats.max_transit, 500);
    }

    #[test]
    fn report_mentions_counters() {
        let text = feed(&[0, 1, 3]).report();
        assert!(text.contains("stream 'depth'"));
        assert!(text.contains("frames:      3"));
        assert!(text.contains("drops:       1"));
    }
}
