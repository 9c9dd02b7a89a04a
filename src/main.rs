//! EXCHEQUER: marketplace listing valuation engine.
//!
//! Entry point. Parses the command line, initialises structured logging,
//! loads configuration and the alias table, opens the store and runs the
//! valuation driver with graceful shutdown on Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{info, warn};

use exchequer::cli::Cli;
use exchequer::config::AppConfig;
use exchequer::currency::{AliasTable, CurrencyResolver};
use exchequer::engine::{stop_channel, DriverConfig, RunDriver, Valuator};
use exchequer::storage::{redact_url, SqliteStore};
use exchequer::types::CurrencyId;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    init_logging(&cli);

    let config_path = cli.config.to_string_lossy().into_owned();
    let mut cfg = AppConfig::load_or_default(&config_path)?;
    if let Some(batch_size) = cli.batch_size {
        cfg.engine.batch_size = batch_size;
    }
    if let Some(path) = &cli.aliases {
        cfg.aliases.path = path.to_string_lossy().into_owned();
    }
    cfg.validate()?;

    let reference = CurrencyId::new(cfg.engine.reference_currency.trim());
    let database_url = cfg.database_url(cli.database.as_deref())?;
    info!(
        config = %config_path,
        database = %redact_url(database_url.expose_secret()),
        aliases = %cfg.aliases.path,
        reference = %reference,
        mode = ?cli.mode,
        "EXCHEQUER starting up"
    );

    // -- Alias snapshot --------------------------------------------------

    let aliases = AliasTable::load(&cfg.aliases.path)
        .with_context(|| format!("Failed to load alias table: {}", cfg.aliases.path))?;
    if !aliases.contains_currency(&reference) {
        warn!(reference = %reference, "Reference currency has no aliases; listings priced in it will not resolve");
    }
    let resolver = CurrencyResolver::new(Arc::new(aliases), cfg.engine.currency_item_detection);
    let valuator = Valuator::new(resolver, reference.clone(), cfg.rate_policy());

    // -- Store and driver ------------------------------------------------

    let store = SqliteStore::connect(&database_url, &cfg.store, reference).await?;

    let (stop, signal) = stop_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received. Finishing current batch.");
            stop.stop();
        }
    });

    let mut driver = RunDriver::new(
        store.clone(),
        store.clone(),
        valuator,
        DriverConfig::new(&cfg.engine, cli.mode),
        signal,
    );
    let result = driver.run().await;
    store.close().await;

    let report = result?;
    info!(report = %report, "EXCHEQUER shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_directive()));

    let json_logging = std::env::var("EXCHEQUER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_current_span(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
