//! camlink-probe entry point.
//!
//! ```text
//! camlink-probe                           Probe a simulated device on domain 0
//! camlink-probe -s 20 -t 10 -m 0x3        20 sync rounds, 10 s of depth and rgb
//! camlink-probe --offset-ms -5            Simulated device clock 5 ms ahead
//! camlink-probe --no-simulate exit        Ask a real bus device to shut down
//! camlink-probe --gen-config              Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use camlink_core::{MAX_DOMAIN_ID, StreamKind, parse_mask};
use camlink_probe::config::ProbeConfig;
use camlink_probe::probe::{run_probe, send_exit};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    /// Send Exit to the device and return.
    Exit,
}

#[derive(Parser, Debug)]
#[command(name = "camlink-probe", about = "Measure clock offset, drift and stream loss of a camlink device")]
struct Cli {
    /// Optional command instead of a probe run.
    #[arg(value_enum)]
    command: Option<Command>,

    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "camlink-probe.toml")]
    config: PathBuf,

    /// Bus domain id (0..=232).
    #[arg(short, long)]
    domain: Option<u32>,

    /// Clock-sync round trips; 0 skips synchronization.
    #[arg(short = 's', long)]
    time_sync: Option<u64>,

    /// Streaming time in seconds.
    #[arg(short = 't', long)]
    run_time: Option<u64>,

    /// Streams to open: RGB 0x1, DEPTH 0x2, GYRO 0x4, IMU 0x8, SAFETY 0x10.
    #[arg(short = 'm', long, value_parser = parse_mask)]
    streams_mask: Option<u32>,

    /// Clock offset of the simulated device, in milliseconds.
    #[arg(long, allow_hyphen_values = true)]
    offset_ms: Option<i64>,

    /// Per-reply clock-sync timeout, in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Probe an external device instead of hosting a simulated one.
    #[arg(long)]
    no_simulate: bool,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ProbeConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, then apply CLI overrides.
    let mut config = ProbeConfig::load(&cli.config);
    if let Some(domain) = cli.domain {
        config.bus.domain = domain;
    }
    if let Some(n) = cli.time_sync {
        config.sync.iterations = n;
    }
    if let Some(secs) = cli.run_time {
        config.streaming.run_time_secs = secs;
    }
    if let Some(mask) = cli.streams_mask {
        config.streaming.streams_mask = mask;
    }
    if let Some(ms) = cli.offset_ms {
        config.simulation.offset_ms = ms;
    }
    if let Some(secs) = cli.timeout {
        config.sync.timeout_secs = secs;
    }
    if cli.no_simulate {
        config.simulation.enabled = false;
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if config.bus.domain > MAX_DOMAIN_ID {
        return Err(format!("domain {} out of range (max {MAX_DOMAIN_ID})", config.bus.domain).into());
    }
    info!("camlink-probe v{}", env!("CARGO_PKG_VERSION"));

    let opts = config.to_options();
    if cli.command == Some(Command::Exit) {
        send_exit(&opts).await?;
        println!("Exit sent");
        return Ok(());
    }

    if opts.streams.is_empty() {
        let valid: Vec<String> = StreamKind::ALL
            .iter()
            .map(|k| format!("{k}={:#x}", k.flag()))
            .collect();
        return Err(format!("streams mask selects nothing (valid bits: {})", valid.join(" ")).into());
    }

    let report = run_probe(&opts).await?;
    println!("{report}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_exit_command() {
        let cli = Cli::try_parse_from(["camlink-probe", "--no-simulate", "exit"]).unwrap();
        assert_eq!(cli.command, Some(Command::Exit));
        assert!(cli.no_simulate);
    }

    #[test]
    fn cli_accepts_negative_offset_and_hex_mask() {
        let cli = Cli::try_parse_from(["camlink-probe", "--offset-ms", "-5", "-m", "0x3"]).unwrap();
        assert_eq!(cli.offset_ms, Some(-5));
        assert_eq!(cli.streams_mask, Some(3));
        assert_eq!(cli.command, None);
    }
}
