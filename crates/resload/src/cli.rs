//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use resload_service::caching::TargetSize;
use resload_service::config::Config;
use resload_service::{logging, metrics};

use crate::commands;

/// Resload commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load resources through the caches and print the outcome for each of them.
    Fetch(FetchArgs),

    /// Wipe the configured disk cache.
    Clear,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Directory that resource identities are resolved against.
    #[arg(long, value_name = "DIR")]
    pub root: PathBuf,

    /// Target width passed to the decoder.
    #[arg(long, default_value_t = 0)]
    pub width: u32,

    /// Target height passed to the decoder.
    #[arg(long, default_value_t = 0)]
    pub height: u32,

    /// How long to wait for all resources, e.g. `30s`.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Resources to load, as paths relative to the root.
    #[arg(required = true, value_name = "KEY")]
    pub keys: Vec<String>,
}

impl FetchArgs {
    pub fn size(&self) -> TargetSize {
        TargetSize::new(self.width, self.height)
    }
}

/// Loads resources through the resload memory and disk caches.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: no other threads exist yet.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure metrics")?;
    }

    match cli.command {
        Command::Fetch(args) => commands::fetch(&config, &args).context("failed to fetch")?,
        Command::Clear => commands::clear(&config).context("failed to clear the disk cache")?,
    }

    Ok(())
}
