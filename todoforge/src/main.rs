//! # todoforge
//!
//! ```bash
//! # Sign in once; later commands renew tokens silently
//! todoforge login
//!
//! # Lists with their open tasks
//! todoforge lists --pending
//!
//! # With debug logging
//! RUST_LOG=debug todoforge lists
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use todoforge::cli::Cli;
use todoforge::commands::Session;
use todoforge::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // An explicit --config must load; the default location falls back to defaults
    let (config, load_error) = match &cli.config {
        Some(path) => (Config::load(path)?, None),
        None => match Config::load_default() {
            Ok(cfg) => (cfg, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };

    init_logging(&config, cli.verbose);

    if let Some(e) = load_error {
        warn!("Failed to load config, using defaults: {:#}", e);
    }
    debug!("todoforge v{}", env!("CARGO_PKG_VERSION"));

    let session = Session::from_config(&config)?;
    session.run(cli.command).await
}

/// Logs go to stderr so stdout stays valid JSON. RUST_LOG wins over the
/// config level and -v flags.
fn init_logging(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => config.log.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
