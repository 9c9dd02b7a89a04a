//! Command-line interface definitions.

use clap::Parser;
use std::path::PathBuf;

use crate::engine::driver::RunMode;

/// Exchequer - values marketplace listings in a reference currency and
/// learns exchange rates from currency trades.
#[derive(Parser, Debug)]
#[command(name = "exchequer")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Database URL (overrides the configured environment variable)
    #[arg(long)]
    pub database: Option<String>,

    /// Alias table path (overrides `aliases.path`)
    #[arg(long)]
    pub aliases: Option<PathBuf>,

    /// Drain the listing backlog once, or keep polling for new listings
    #[arg(long, value_enum, default_value_t = RunMode::OneShot)]
    pub mode: RunMode,

    /// Override batch size
    #[arg(long)]
    pub batch_size: Option<u32>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Cli {
    /// Default log directive when `RUST_LOG` is not set.
    pub fn log_directive(&self) -> &'static str {
        if self.quiet {
            return "exchequer=warn";
        }
        match self.verbose {
            0 => "exchequer=info",
            1 => "exchequer=debug",
            _ => "exchequer=trace",
        }
    }
}
