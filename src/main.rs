//! CLI entry point for the wavemux server.
//!
//! Provides command-line interface for:
//! - Running the acquisition scheduler and subscriber server (`serve`)
//! - Validating a configuration file without touching hardware (`check`)
//!
//! # Usage
//!
//! Start the server:
//! ```bash
//! wavemux serve --config wavemux.toml
//! ```
//!
//! Validate a configuration:
//! ```bash
//! wavemux check --config wavemux.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use wavemux::config::Config;
use wavemux::tracing_setup::{self, OutputFormat};
use wavemux::version::Compatibility;
use wavemux::WavemuxError;

#[derive(Parser)]
#[command(name = "wavemux")]
#[command(about = "Wavelength measurement multiplexer for shared instruments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server: cycle the switch, read channels, serve subscribers
    Serve {
        /// Path to the TOML configuration file
        #[arg(long, default_value = "wavemux.toml")]
        config: PathBuf,

        /// Use simulated hardware regardless of the configuration
        #[arg(long)]
        simulate: bool,

        /// Override the configured log level (trace, debug, info, warn, error)
        #[arg(long)]
        log_level: Option<String>,

        /// Log output format: pretty, compact or json
        #[arg(long)]
        log_format: Option<OutputFormat>,
    },

    /// Load and validate a configuration file, then exit
    Check {
        /// Path to the TOML configuration file
        #[arg(long, default_value = "wavemux.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            simulate,
            log_level,
            log_format,
        } => serve(config, simulate, log_level, log_format).await,
        Commands::Check { config } => check(config),
    }
}

async fn serve(
    path: PathBuf,
    simulate: bool,
    log_level: Option<String>,
    log_format: Option<OutputFormat>,
) -> Result<()> {
    let mut config = Config::load_from(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    if simulate {
        config.acquisition.simulate = true;
    }
    if let Some(level) = log_level {
        config.server.log_level = level;
    }

    let level = tracing_setup::parse_log_level(&config.server.log_level)
        .map_err(WavemuxError::Configuration)?;
    let mut tracing = tracing_setup::TracingConfig::new(level);
    if let Some(format) = log_format {
        tracing = tracing.with_format(format);
    }
    tracing_setup::init(tracing).map_err(WavemuxError::Configuration)?;

    wavemux::app::run(config).await?;
    Ok(())
}

fn check(path: PathBuf) -> Result<()> {
    let config = Config::load_from(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    config.validate().map_err(WavemuxError::Configuration)?;
    match config.check_version()? {
        Compatibility::Full => {}
        Compatibility::Degraded { warning } => println!("warning: {warning}"),
        Compatibility::Incompatible { .. } => unreachable!("check_version refuses these"),
    }

    let active = config.channels.iter().filter(|c| c.active).count();
    println!(
        "{}: {} channels ({} active), listening on {}",
        path.display(),
        config.channels.len(),
        active,
        config.server.listen
    );
    for channel in &config.channels {
        let modes = channel
            .modes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("+");
        println!(
            "  {:>2}  {:<20} {:<14} {:>12.6} THz  exposure {:>3} ms{}",
            channel.switcher_position,
            channel.name,
            modes,
            channel.reference / 1e12,
            channel.exposure_ms,
            if channel.active { "" } else { "  (inactive)" }
        );
    }
    println!("configuration OK");
    Ok(())
}
