//! Run driver.
//!
//! Pulls listings past the persisted cursor in ID order, hands each to the
//! valuation core and settles the result through the store, one
//! transaction per listing. Stops cooperatively at batch boundaries.

use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::valuation::{Skip, Valuator};
use crate::config::EngineConfig;
use crate::source::ListingSource;
use crate::storage::{Settlement, SqliteStore};
use crate::types::{ExchequerError, Listing, ListingId, RunReport};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Drain the backlog and exit.
    #[default]
    OneShot,
    /// Keep polling for new listings until stopped.
    Continuous,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub retry_limit: u32,
    pub mode: RunMode,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new(&EngineConfig::default(), RunMode::OneShot)
    }
}

impl DriverConfig {
    pub fn new(engine: &EngineConfig, mode: RunMode) -> Self {
        Self {
            batch_size: engine.batch_size.max(1),
            poll_interval: Duration::from_secs(engine.poll_interval_secs),
            retry_limit: engine.retry_limit,
            mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Stop signal
// ---------------------------------------------------------------------------

/// Requests a stop. Cloneable; any clone may trigger it.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Observed by the driver between batches.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once a stop is requested. Never resolves if every handle
    /// was dropped without stopping.
    pub async fn stopped(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle(Arc::new(tx)), StopSignal(rx))
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// What happened to one listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sale { rate_updated: bool },
    DeferredUnresolved,
    DeferredUnpriced,
    Malformed,
    NotForSale,
    AlreadyProcessed,
}

pub struct RunDriver<S: ListingSource> {
    source: S,
    store: SqliteStore,
    valuator: Valuator,
    config: DriverConfig,
    stop: StopSignal,
}

impl<S: ListingSource> RunDriver<S> {
    pub fn new(source: S, store: SqliteStore, valuator: Valuator, config: DriverConfig, stop: StopSignal) -> Self {
        Self {
            source,
            store,
            valuator,
            config,
            stop,
        }
    }

    /// Run until the backlog is drained (one-shot) or a stop is requested.
    ///
    /// Errors are fatal: the offending listing's transaction is rolled back
    /// and the cursor stays at the last committed listing.
    pub async fn run(&mut self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, mode = ?self.config.mode);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<RunReport> {
        let mut report = RunReport {
            cursor: self.store.cursor().await?,
            ..Default::default()
        };
        info!(
            cursor = report.cursor,
            batch_size = self.config.batch_size,
            reference = %self.valuator.reference(),
            "Run starting"
        );

        self.retry_deferred(&mut report).await?;
        let mut rate_updates_at_retry = report.rate_updates;

        loop {
            if self.stop.is_stopped() {
                info!("Stop requested");
                break;
            }

            let cursor = self.store.cursor().await?;
            let batch = self
                .source
                .fetch_after(cursor, self.config.batch_size)
                .await
                .map_err(|e| e.context(ExchequerError::Source(format!("fetch after listing {cursor} failed"))))?;

            if batch.is_empty() {
                match self.config.mode {
                    RunMode::OneShot => break,
                    RunMode::Continuous => {
                        if report.rate_updates > rate_updates_at_retry {
                            self.retry_deferred(&mut report).await?;
                            rate_updates_at_retry = report.rate_updates;
                        }
                        let poll = self.config.poll_interval;
                        tokio::select! {
                            _ = tokio::time::sleep(poll) => {}
                            _ = self.stop.stopped() => {}
                        }
                        continue;
                    }
                }
            }

            ensure_progress(cursor, &batch)?;
            self.run_batch(&batch, &mut report).await?;
        }

        report.cursor = self.store.cursor().await?;
        info!(
            batches = report.batches,
            seen = report.listings_seen,
            sales = report.sales_recorded,
            rate_updates = report.rate_updates,
            deferred = report.deferred(),
            malformed = report.malformed,
            cursor = report.cursor,
            "Run complete"
        );
        Ok(report)
    }

    async fn run_batch(&self, batch: &[Listing], report: &mut RunReport) -> Result<()> {
        let sales_before = report.sales_recorded;
        let deferred_before = report.deferred();

        for listing in batch {
            report.listings_seen += 1;
            match self.process(listing).await? {
                Outcome::Sale { rate_updated } => {
                    report.sales_recorded += 1;
                    if rate_updated {
                        report.rate_updates += 1;
                    }
                }
                Outcome::DeferredUnresolved => report.deferred_unresolved += 1,
                Outcome::DeferredUnpriced => report.deferred_unpriced += 1,
                Outcome::Malformed => report.malformed += 1,
                Outcome::NotForSale => report.not_for_sale += 1,
                Outcome::AlreadyProcessed => report.already_processed += 1,
            }
        }

        report.batches += 1;
        report.cursor = self.store.cursor().await?;
        info!(
            batch = report.batches,
            size = batch.len(),
            sales = report.sales_recorded - sales_before,
            deferred = report.deferred() - deferred_before,
            cursor = report.cursor,
            "Batch committed"
        );
        Ok(())
    }

    /// Re-attempt the least recently tried deferred listings against
    /// current rates.
    async fn retry_deferred(&self, report: &mut RunReport) -> Result<()> {
        if self.config.retry_limit == 0 {
            return Ok(());
        }
        let ledger = self.store.retry_slice(self.config.retry_limit).await?;
        if ledger.is_empty() {
            return Ok(());
        }

        let ids: Vec<ListingId> = ledger.iter().map(|d| d.listing_id).collect();
        let listings = self
            .source
            .fetch_by_ids(&ids)
            .await
            .map_err(|e| e.context(ExchequerError::Source(format!("fetch of {} deferred listings failed", ids.len()))))?;

        for entry in &ledger {
            if !listings.iter().any(|l| l.id == entry.listing_id) {
                warn!(listing_id = entry.listing_id, league = %entry.league, "Deferred listing vanished from source");
                self.store.skip(entry.listing_id, &entry.league, None).await?;
            }
        }

        let mut settled = 0u64;
        for listing in &listings {
            match self.process(listing).await? {
                Outcome::Sale { rate_updated } => {
                    settled += 1;
                    report.sales_recorded += 1;
                    if rate_updated {
                        report.rate_updates += 1;
                    }
                }
                Outcome::Malformed => report.malformed += 1,
                _ => {}
            }
        }
        report.retried_settled += settled;

        info!(attempted = listings.len(), settled, "Deferred listings retried");
        Ok(())
    }

    async fn process(&self, listing: &Listing) -> Result<Outcome> {
        let prepared = match self.valuator.prepare(listing) {
            Ok(prepared) => prepared,
            Err(skip) => {
                let outcome = match &skip {
                    Skip::NotForSale => {
                        debug!(listing_id = listing.id, "Not for sale");
                        Outcome::NotForSale
                    }
                    Skip::Malformed(reason) => {
                        warn!(listing_id = listing.id, league = %listing.league, %reason, "Malformed listing skipped");
                        Outcome::Malformed
                    }
                    Skip::Unresolved { text, ambiguous } => {
                        debug!(listing_id = listing.id, currency_text = %text, ambiguous, "Currency unresolved, deferring");
                        Outcome::DeferredUnresolved
                    }
                };
                self.store.skip(listing.id, &listing.league, skip.deferral()).await?;
                return Ok(outcome);
            }
        };

        let valuator = &self.valuator;
        let settlement = self
            .store
            .settle(&prepared, |quotes| valuator.appraise(&prepared, quotes))
            .await?;

        Ok(match settlement {
            Settlement::Recorded { update, .. } => {
                if let Some(update) = &update {
                    debug!(
                        listing_id = listing.id,
                        league = %listing.league,
                        currency = %update.entry.from,
                        previous = ?update.previous,
                        observed = update.observed,
                        rate = update.entry.rate,
                        "Rate updated"
                    );
                }
                Outcome::Sale {
                    rate_updated: update.is_some(),
                }
            }
            Settlement::Deferred(reason) => {
                debug!(listing_id = listing.id, currency = %prepared.currency, %reason, "No rate yet, deferring");
                Outcome::DeferredUnpriced
            }
            Settlement::Malformed(reason) => {
                warn!(listing_id = listing.id, league = %listing.league, %reason, "Unusable reference value, skipped");
                Outcome::Malformed
            }
            Settlement::AlreadyProcessed => Outcome::AlreadyProcessed,
        })
    }
}

/// A source that keeps returning listings at or below the cursor would
/// spin forever.
fn ensure_progress(cursor: ListingId, batch: &[Listing]) -> Result<()> {
    let max = batch.iter().map(|l| l.id).max().unwrap_or(cursor);
    if max <= cursor {
        return Err(ExchequerError::Source(format!(
            "source returned no listing past cursor {cursor}"
        ))
        .into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
