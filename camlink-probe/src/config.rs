//! Configuration for the probe tool.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use camlink_core::StreamKind;
use camlink_core::sync::DEFAULT_SYNC_TIMEOUT;

use crate::probe::ProbeOptions;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub bus: BusConfig,
    pub sync: SyncConfig,
    pub streaming: StreamingConfig,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Domain id, 0..=232.
    pub domain: u32,
    pub participant_name: String,
    /// How long to wait for a device to be discovered, in seconds.
    pub discovery_timeout_secs: u64,
}

/// Clock synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Round trips per run; 0 skips synchronization.
    pub iterations: u64,
    /// Per-reply timeout, in seconds.
    pub timeout_secs: u64,
}

/// Streaming interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Seconds to stream between the two sync runs.
    pub run_time_secs: u64,
    /// Streams to open: RGB 0x1, DEPTH 0x2, GYRO 0x4, IMU 0x8, SAFETY 0x10.
    pub streams_mask: u32,
}

/// Simulated device hosted by the probe itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
    /// Device clock offset, in milliseconds (device = host - offset).
    pub offset_ms: i64,
    /// Milliseconds between simulated frames.
    pub frame_interval_ms: u64,
    pub topic_root: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            domain: 0,
            participant_name: "camlink-probe".into(),
            discovery_timeout_secs: 10,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            timeout_secs: DEFAULT_SYNC_TIMEOUT.as_secs(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            run_time_secs: 30,
            streams_mask: StreamKind::Depth.flag(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            offset_ms: 0,
            frame_interval_ms: 23,
            topic_root: "sim/probe".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ProbeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::debug!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Convert into runner options.
    pub fn to_options(&self) -> ProbeOptions {
        ProbeOptions {
            domain: self.bus.domain,
            participant_name: self.bus.participant_name.clone(),
            discovery_timeout: Duration::from_secs(self.bus.discovery_timeout_secs),
            sync_iterations: self.sync.iterations,
            sync_timeout: Duration::from_secs(self.sync.timeout_secs.max(1)),
            run_time: Duration::from_secs(self.streaming.run_time_secs),
            streams: StreamKind::from_mask(self.streaming.streams_mask),
            simulate: self.simulation.enabled,
            simulated_offset: self.simulation.offset_ms * camlink_core::time::NANOS_PER_MILLI,
            frame_interval: Duration::from_millis(self.simulation.frame_interval_ms.max(1)),
            topic_root: self.simulation.topic_root.clone(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&ProbeConfig::default()).unwrap();
        assert!(text.contains("streams_mask"));
        assert!(text.contains("iterations"));
    }

    #[test]
    fn defaults_match_probe_conventions() {
        let opts = ProbeConfig::default().to_options();
        assert_eq!(opts.sync_iterations, 10);
        assert_eq!(opts.run_time, Duration::from_secs(30));
        assert_eq!(opts.streams, vec![StreamKind::Depth]);
        assert_eq!(opts.sync_timeout, Duration::from_secs(300));
    }

    #[test]
    fn offset_and_mask_convert() {
        let mut cfg = ProbeConfig::default();
        cfg.simulation.offset_ms = -3;
        cfg.streaming.streams_mask = 0x1 | 0x10;
        let opts = cfg.to_options();
        assert_eq!(opts.simulated_offset, -3_000_000);
        assert_eq!(opts.streams, vec![StreamKind::Color, StreamKind::Safety]);
    }
}
