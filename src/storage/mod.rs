//! Persistent store.
//!
//! SQLite-backed home of exchange rates, sales, the deferral ledger and the
//! valuation cursor. Every listing is settled in a single transaction, so a
//! crash mid-listing leaves no partial state and a rerun resumes cleanly.

mod schema;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::currency::MalformedPrice;
use crate::engine::rates::RateQuotes;
use crate::engine::valuation::{Appraisal, PreparedListing, RateUpdate};
use crate::source::ListingSource;
use crate::types::{
    CurrencyId, DeferralReason, DeferredListing, ExchangeRateEntry, ExchequerError, League, Listing,
    ListingId, Sale,
};

const CURSOR_NAME: &str = "valuation";

const LISTING_COLUMNS: &str = "id, league, item_name, stack_size, is_currency_item, \
     price_text, currency_text, note, stash_note";

/// Outcome of settling one prepared listing.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Recorded {
        sale: Sale,
        update: Option<RateUpdate>,
    },
    Deferred(DeferralReason),
    /// The price converts to no usable reference value. Never deferred.
    Malformed(MalformedPrice),
    /// A sale for this listing already exists; nothing was written.
    AlreadyProcessed,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    reference: CurrencyId,
}

impl SqliteStore {
    /// Open (creating if needed) the database and ensure the schema exists.
    pub async fn connect(url: &SecretString, config: &StoreConfig, reference: CurrencyId) -> Result<Self> {
        let url = url.expose_secret();
        let in_memory = is_in_memory(url);

        let mut options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL: {}", redact_url(url)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every in-memory connection is its own database: pin exactly one.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", redact_url(url)))?;

        let store = Self { pool, reference };
        store.init_schema().await?;
        info!(database = %redact_url(url), in_memory, "Store ready");
        Ok(store)
    }

    /// Fresh private in-memory database.
    pub async fn in_memory(reference: CurrencyId) -> Result<Self> {
        let url = SecretString::new("sqlite::memory:".to_string());
        Self::connect(&url, &StoreConfig::default(), reference).await
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in schema::STATEMENTS {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .context("Failed to initialise schema")?;
        }
        Ok(())
    }

    pub fn reference(&self) -> &CurrencyId {
        &self.reference
    }

    /// Write transaction holding the database lock from its first
    /// statement. Concurrent writers queue on the busy timeout.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .context("Failed to begin transaction")
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Rates
    // -----------------------------------------------------------------------

    /// Current entry for `from → to` in `league`. The reference self-rate is
    /// always 1 whether or not its row exists yet.
    pub async fn get_rate(
        &self,
        from: &CurrencyId,
        to: &CurrencyId,
        league: &League,
    ) -> Result<Option<ExchangeRateEntry>> {
        if from == to && from == &self.reference {
            return Ok(Some(ExchangeRateEntry::identity(&self.reference, league)));
        }
        let mut conn = self.pool.acquire().await?;
        fetch_rate(&mut conn, from, to, league).await
    }

    /// Insert or replace one entry. Self-rates are fixed and never written.
    pub async fn upsert_rate(&self, entry: &ExchangeRateEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_rate(&mut conn, entry).await
    }

    /// All entries of one league, ordered by source currency.
    pub async fn rates_for_league(&self, league: &League) -> Result<Vec<ExchangeRateEntry>> {
        let rows = sqlx::query(
            "SELECT from_currency, to_currency, league, rate, observations, updated_at \
             FROM exchange_rate WHERE league = ? ORDER BY from_currency, to_currency",
        )
        .bind(league.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to read league rates")?;
        rows.iter().map(rate_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    /// Settle one listing atomically.
    ///
    /// `appraise` runs inside the transaction against the rates committed
    /// before this listing. The sale, the rate update, ledger maintenance
    /// and the cursor advance commit together or not at all.
    pub async fn settle<F>(&self, prepared: &PreparedListing, appraise: F) -> Result<Settlement>
    where
        F: FnOnce(&RateQuotes) -> Appraisal,
    {
        let mut tx = self.begin_write().await?;

        if sale_exists(&mut tx, prepared.listing_id).await? {
            clear_deferral(&mut tx, prepared.listing_id).await?;
            advance_cursor(&mut tx, prepared.listing_id).await?;
            tx.commit().await.context("Failed to commit settlement")?;
            debug!(listing_id = prepared.listing_id, "Listing already processed");
            return Ok(Settlement::AlreadyProcessed);
        }

        bootstrap_league(&mut tx, &self.reference, &prepared.league).await?;

        let mut quotes = RateQuotes::new(self.reference.clone(), prepared.league.clone());
        for currency in prepared.rate_keys(&self.reference) {
            if let Some(entry) = fetch_rate(&mut tx, &currency, &self.reference, &prepared.league).await? {
                quotes.insert(entry);
            }
        }

        let settlement = match appraise(&quotes) {
            Appraisal::Priced { sale, update } => {
                insert_sale(&mut tx, &sale).await?;
                if let Some(update) = &update {
                    write_rate(&mut tx, &update.entry).await?;
                }
                clear_deferral(&mut tx, prepared.listing_id).await?;
                Settlement::Recorded { sale, update }
            }
            Appraisal::Unpriced => {
                let reason = DeferralReason::PricingUnavailable;
                record_deferral(&mut tx, prepared.listing_id, &prepared.league, reason).await?;
                Settlement::Deferred(reason)
            }
            Appraisal::Malformed(reason) => {
                clear_deferral(&mut tx, prepared.listing_id).await?;
                Settlement::Malformed(reason)
            }
        };

        advance_cursor(&mut tx, prepared.listing_id).await?;
        tx.commit().await.context("Failed to commit settlement")?;
        Ok(settlement)
    }

    /// Move past a listing that produced no sale.
    ///
    /// With a reason the listing enters (or stays in) the deferral ledger;
    /// without one it is dropped from the ledger for good. A listing that
    /// already has a sale is never deferred.
    pub async fn skip(&self, listing_id: ListingId, league: &League, reason: Option<DeferralReason>) -> Result<()> {
        let mut tx = self.begin_write().await?;
        let reason = match reason {
            Some(_) if sale_exists(&mut tx, listing_id).await? => None,
            other => other,
        };
        match reason {
            Some(reason) => record_deferral(&mut tx, listing_id, league, reason).await?,
            None => clear_deferral(&mut tx, listing_id).await?,
        }
        advance_cursor(&mut tx, listing_id).await?;
        tx.commit().await.context("Failed to commit skip")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Highest listing ID fully handled; 0 before the first run.
    pub async fn cursor(&self) -> Result<ListingId> {
        let last: Option<i64> = sqlx::query_scalar("SELECT last_id FROM valuation_cursor WHERE name = ?")
            .bind(CURSOR_NAME)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read cursor")?;
        Ok(last.unwrap_or(0))
    }

    pub async fn sale(&self, listing_id: ListingId) -> Result<Option<Sale>> {
        let row = sqlx::query(
            "SELECT listing_id, league, item_name, currency, amount, reference_amount, is_currency, recorded_at \
             FROM sale WHERE listing_id = ?",
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read sale")?;
        row.as_ref().map(sale_from_row).transpose()
    }

    pub async fn sale_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sale")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count sales")?;
        Ok(count as u64)
    }

    /// Next slice of the deferral ledger to re-attempt: least recently
    /// attempted first, so every entry gets a turn however long the ledger
    /// grows. Returned in ascending ID order.
    pub async fn retry_slice(&self, limit: u32) -> Result<Vec<DeferredListing>> {
        let rows = sqlx::query(
            "SELECT listing_id, league, reason, attempts, first_deferred_at, last_attempt_at FROM ( \
                 SELECT * FROM deferred_listing \
                 ORDER BY last_attempt_at, attempts, listing_id LIMIT ? \
             ) ORDER BY listing_id",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to read deferral ledger")?;
        rows.iter().map(deferred_from_row).collect()
    }

    /// Deferral ledger in ID order.
    pub async fn deferred(&self, limit: u32) -> Result<Vec<DeferredListing>> {
        let rows = sqlx::query(
            "SELECT listing_id, league, reason, attempts, first_deferred_at, last_attempt_at \
             FROM deferred_listing ORDER BY listing_id LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to read deferral ledger")?;
        rows.iter().map(deferred_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Ingestion side
    // -----------------------------------------------------------------------

    /// Store a raw listing. Listings are immutable: an existing ID is kept.
    pub async fn insert_listing(&self, listing: &Listing) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_listing(&mut conn, listing).await
    }

    pub async fn insert_listings(&self, listings: &[Listing]) -> Result<()> {
        let mut tx = self.begin_write().await?;
        for listing in listings {
            write_listing(&mut tx, listing).await?;
        }
        tx.commit().await.context("Failed to commit listings")?;
        Ok(())
    }
}

#[async_trait]
impl ListingSource for SqliteStore {
    async fn fetch_after(&self, cursor: ListingId, limit: u32) -> Result<Vec<Listing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listing WHERE id > ? ORDER BY id LIMIT ?");
        let rows = sqlx::query(&sql)
            .bind(cursor)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch listings")?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn fetch_by_ids(&self, ids: &[ListingId]) -> Result<Vec<Listing>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {LISTING_COLUMNS} FROM listing WHERE id IN ("));
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch listings by id")?;
        rows.iter().map(listing_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Statement helpers (shared by pooled and transactional callers)
// ---------------------------------------------------------------------------

async fn fetch_rate(
    conn: &mut SqliteConnection,
    from: &CurrencyId,
    to: &CurrencyId,
    league: &League,
) -> Result<Option<ExchangeRateEntry>> {
    let row = sqlx::query(
        "SELECT from_currency, to_currency, league, rate, observations, updated_at \
         FROM exchange_rate WHERE from_currency = ? AND to_currency = ? AND league = ?",
    )
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(league.as_str())
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to read rate")?;
    row.as_ref().map(rate_from_row).transpose()
}

async fn write_rate(conn: &mut SqliteConnection, entry: &ExchangeRateEntry) -> Result<()> {
    if entry.is_identity() {
        return Ok(());
    }
    if !entry.rate.is_finite() || entry.rate <= 0.0 {
        return Err(ExchequerError::Store(format!("refusing non-positive rate: {entry}")).into());
    }
    sqlx::query(
        "INSERT INTO exchange_rate (from_currency, to_currency, league, rate, observations, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (from_currency, to_currency, league) DO UPDATE SET \
             rate = excluded.rate, \
             observations = excluded.observations, \
             updated_at = excluded.updated_at",
    )
    .bind(entry.from.as_str())
    .bind(entry.to.as_str())
    .bind(entry.league.as_str())
    .bind(entry.rate)
    .bind(i64::try_from(entry.observations).unwrap_or(i64::MAX))
    .bind(entry.updated_at.timestamp_millis())
    .execute(&mut *conn)
    .await
    .context("Failed to write rate")?;
    debug!(rate = %entry, "Rate stored");
    Ok(())
}

async fn bootstrap_league(conn: &mut SqliteConnection, reference: &CurrencyId, league: &League) -> Result<()> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO exchange_rate (from_currency, to_currency, league, rate, observations, updated_at) \
         VALUES (?, ?, ?, 1.0, 0, ?)",
    )
    .bind(reference.as_str())
    .bind(reference.as_str())
    .bind(league.as_str())
    .bind(Utc::now().timestamp_millis())
    .execute(&mut *conn)
    .await
    .context("Failed to bootstrap league")?;
    if result.rows_affected() > 0 {
        info!(league = %league, reference = %reference, "New league seen");
    }
    Ok(())
}

async fn sale_exists(conn: &mut SqliteConnection, listing_id: ListingId) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT listing_id FROM sale WHERE listing_id = ?")
        .bind(listing_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to check for existing sale")?;
    Ok(found.is_some())
}

async fn insert_sale(conn: &mut SqliteConnection, sale: &Sale) -> Result<()> {
    if !sale.reference_amount.is_finite() || sale.reference_amount < 0.0 {
        return Err(ExchequerError::Store(format!("refusing invalid sale value: {sale}")).into());
    }
    sqlx::query(
        "INSERT INTO sale (listing_id, league, item_name, currency, amount, reference_amount, is_currency, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(sale.listing_id)
    .bind(sale.league.as_str())
    .bind(&sale.item_name)
    .bind(sale.currency.as_str())
    .bind(sale.amount)
    .bind(sale.reference_amount)
    .bind(sale.is_currency)
    .bind(sale.recorded_at.timestamp_millis())
    .execute(&mut *conn)
    .await
    .context("Failed to insert sale")?;
    Ok(())
}

async fn record_deferral(
    conn: &mut SqliteConnection,
    listing_id: ListingId,
    league: &League,
    reason: DeferralReason,
) -> Result<()> {
    let now = Utc::now().timestamp_millis();
    sqlx::query(
        "INSERT INTO deferred_listing (listing_id, league, reason, attempts, first_deferred_at, last_attempt_at) \
         VALUES (?, ?, ?, 1, ?, ?) \
         ON CONFLICT (listing_id) DO UPDATE SET \
             reason = excluded.reason, \
             attempts = deferred_listing.attempts + 1, \
             last_attempt_at = excluded.last_attempt_at",
    )
    .bind(listing_id)
    .bind(league.as_str())
    .bind(reason.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("Failed to record deferral")?;
    Ok(())
}

async fn clear_deferral(conn: &mut SqliteConnection, listing_id: ListingId) -> Result<()> {
    sqlx::query("DELETE FROM deferred_listing WHERE listing_id = ?")
        .bind(listing_id)
        .execute(&mut *conn)
        .await
        .context("Failed to clear deferral")?;
    Ok(())
}

/// The cursor only ever moves forward.
async fn advance_cursor(conn: &mut SqliteConnection, listing_id: ListingId) -> Result<()> {
    sqlx::query(
        "INSERT INTO valuation_cursor (name, last_id) VALUES (?, ?) \
         ON CONFLICT (name) DO UPDATE SET last_id = MAX(valuation_cursor.last_id, excluded.last_id)",
    )
    .bind(CURSOR_NAME)
    .bind(listing_id)
    .execute(&mut *conn)
    .await
    .context("Failed to advance cursor")?;
    Ok(())
}

async fn write_listing(conn: &mut SqliteConnection, listing: &Listing) -> Result<()> {
    sqlx::query(
        "INSERT INTO listing (id, league, item_name, stack_size, is_currency_item, \
             price_text, currency_text, note, stash_note, ingested_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(listing.id)
    .bind(listing.league.as_str())
    .bind(&listing.item_name)
    .bind(listing.stack_size.map(i64::from))
    .bind(listing.is_currency_item)
    .bind(&listing.price_text)
    .bind(&listing.currency_text)
    .bind(&listing.note)
    .bind(&listing.stash_note)
    .bind(Utc::now().timestamp_millis())
    .execute(&mut *conn)
    .await
    .with_context(|| format!("Failed to insert listing {}", listing.id))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn timestamp(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ExchequerError::Store(format!("invalid timestamp {millis}")).into())
}

fn rate_from_row(row: &SqliteRow) -> Result<ExchangeRateEntry> {
    let observations: i64 = row.try_get("observations")?;
    Ok(ExchangeRateEntry {
        from: CurrencyId::new(row.try_get::<String, _>("from_currency")?),
        to: CurrencyId::new(row.try_get::<String, _>("to_currency")?),
        league: League::new(row.try_get::<String, _>("league")?),
        rate: row.try_get("rate")?,
        observations: observations.max(0) as u64,
        updated_at: timestamp(row.try_get("updated_at")?)?,
    })
}

fn sale_from_row(row: &SqliteRow) -> Result<Sale> {
    Ok(Sale {
        listing_id: row.try_get("listing_id")?,
        league: League::new(row.try_get::<String, _>("league")?),
        item_name: row.try_get("item_name")?,
        currency: CurrencyId::new(row.try_get::<String, _>("currency")?),
        amount: row.try_get("amount")?,
        reference_amount: row.try_get("reference_amount")?,
        is_currency: row.try_get("is_currency")?,
        recorded_at: timestamp(row.try_get("recorded_at")?)?,
    })
}

fn deferred_from_row(row: &SqliteRow) -> Result<DeferredListing> {
    let attempts: i64 = row.try_get("attempts")?;
    let reason: String = row.try_get("reason")?;
    Ok(DeferredListing {
        listing_id: row.try_get("listing_id")?,
        league: League::new(row.try_get::<String, _>("league")?),
        reason: reason.parse()?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        first_deferred_at: timestamp(row.try_get("first_deferred_at")?)?,
        last_attempt_at: timestamp(row.try_get("last_attempt_at")?)?,
    })
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing> {
    let stack_size: Option<i64> = row.try_get("stack_size")?;
    Ok(Listing {
        id: row.try_get("id")?,
        league: League::new(row.try_get::<String, _>("league")?),
        item_name: row.try_get("item_name")?,
        stack_size: stack_size.map(|n| u32::try_from(n.max(0)).unwrap_or(u32::MAX)),
        is_currency_item: row.try_get("is_currency_item")?,
        price_text: row.try_get("price_text")?,
        currency_text: row.try_get("currency_text")?,
        note: row.try_get("note")?,
        stash_note: row.try_get("stash_note")?,
    })
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Strip credentials from a connection URL before it reaches a log line.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
