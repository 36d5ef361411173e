//! Configuration for the device-listing tool.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use camlink_core::ProductLine;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Bus settings, forwarded to the `bus` context module.
    pub bus: BusConfig,
    /// Device query settings.
    pub query: QueryConfig,
    /// In-process simulated devices.
    pub simulate: SimulateConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Domain id, 0..=232.
    pub domain: u32,
    pub participant_name: String,
}

/// Query configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Requested product-line mask.
    pub mask: u32,
    /// Queries before giving up on an empty result.
    pub tries: u32,
    /// Pause between two queries, in milliseconds.
    pub retry_delay_ms: u64,
}

/// Simulated devices hosted by the tool itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulateConfig {
    /// Number of devices; 0 disables simulation.
    pub devices: u32,
    /// Topic root prefix; device `i` uses `<prefix>/<i>`.
    pub topic_prefix: String,
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
            participant_name: "camlink-devices".into(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            mask: (ProductLine::ANY_NATIVE | ProductLine::SW_ONLY).bits(),
            tries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            devices: 0,
            topic_prefix: "sim".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl DevicesConfig {
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

    /// Requested mask as a product line.
    pub fn mask(&self) -> ProductLine {
        ProductLine::from_bits_retain(self.query.mask)
    }

    /// Context settings tree for these options.
    pub fn context_settings(&self) -> Value {
        json!({
            "bus": {
                "domain": self.bus.domain,
                "participant-name": self.bus.participant_name,
            }
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&DevicesConfig::default()).unwrap();
        assert!(text.contains("participant_name"));
        assert!(text.contains("retry_delay_ms"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: DevicesConfig = toml::from_str("[bus]\ndomain = 12\n").unwrap();
        assert_eq!(cfg.bus.domain, 12);
        assert_eq!(cfg.bus.participant_name, "camlink-devices");
        assert_eq!(cfg.query.mask, 0x1fe);
        assert_eq!(cfg.query.tries, 3);
    }

    #[test]
    fn settings_tree_targets_bus_module() {
        let mut cfg = DevicesConfig::default();
        cfg.bus.domain = 42;
        let settings = cfg.context_settings();
        assert_eq!(settings["bus"]["domain"], 42);
        assert_eq!(settings["bus"]["participant-name"], "camlink-devices");
    }
}
