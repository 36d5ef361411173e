//! camlink-devices entry point.
//!
//! ```text
//! camlink-devices                     List devices on domain 0
//! camlink-devices --domain 5 -v       Verbose listing on domain 5
//! camlink-devices --simulate 2        Host two simulated devices and list them
//! camlink-devices --gen-config        Write default config to stdout
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use camlink_core::{Context, MAX_DOMAIN_ID, Participant, parse_mask};
use camlink_devices::config::DevicesConfig;
use camlink_devices::listing::{describe, query_with_retries, start_simulated};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "camlink-devices", about = "List camera devices visible to camlink")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "camlink-devices.toml")]
    config: PathBuf,

    /// Bus domain id (0..=232).
    #[arg(short, long)]
    domain: Option<u32>,

    /// Requested product-line mask (decimal or 0x-hex).
    #[arg(short, long, value_parser = parse_mask)]
    mask: Option<u32>,

    /// Queries before reporting that nothing was found.
    #[arg(short, long)]
    tries: Option<u32>,

    /// Host this many simulated devices in-process.
    #[arg(long)]
    simulate: Option<u32>,

    /// Print device details.
    #[arg(short, long)]
    verbose: bool,

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
        let text = toml::to_string_pretty(&DevicesConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, then apply CLI overrides.
    let mut config = DevicesConfig::load(&cli.config);
    if let Some(domain) = cli.domain {
        config.bus.domain = domain;
    }
    if let Some(mask) = cli.mask {
        config.query.mask = mask;
    }
    if let Some(tries) = cli.tries {
        config.query.tries = tries;
    }
    if let Some(n) = cli.simulate {
        config.simulate.devices = n;
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
    info!("camlink-devices v{}", env!("CARGO_PKG_VERSION"));

    let sim = Participant::new(config.bus.domain, "camlink-sim")?;
    let mut servers = start_simulated(&sim, &config.simulate.topic_prefix, config.simulate.devices)?;

    let ctx = Context::new(config.context_settings())?;
    let devices = query_with_retries(
        &ctx,
        config.mask(),
        config.query.tries,
        Duration::from_millis(config.query.retry_delay_ms),
    )
    .await;

    if devices.is_empty() {
        println!("No device detected!");
    }
    for dev in &devices {
        println!("{}", describe(dev, cli.verbose));
    }

    for server in &mut servers {
        server.stop().await;
    }
    Ok(())
}
