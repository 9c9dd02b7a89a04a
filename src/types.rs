//! Shared types for the EXCHEQUER valuation engine.
//!
//! These types form the data model used across all modules: raw listings
//! as delivered by ingestion, canonical currency and league identities,
//! exchange-rate entries and the derived sale records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic listing identifier assigned by ingestion.
pub type ListingId = i64;

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Canonical currency identity (e.g. "Chaos Orb").
///
/// Equality is by canonical name only. Display text from listings never
/// becomes a `CurrencyId` without going through the alias table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurrencyId(String);

impl CurrencyId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An independent economic partition. Rates never cross leagues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct League(String);

impl League {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for League {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// A raw marketplace listing, immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub league: League,
    /// Item type line. For currency items this is the currency's display name.
    pub item_name: String,
    /// Stack quantity; `None` means a single item.
    pub stack_size: Option<u32>,
    /// Ingestion's classification: the item itself is a unit of currency.
    pub is_currency_item: bool,
    /// Explicit display price amount, e.g. "2" or "1/2".
    pub price_text: Option<String>,
    /// Explicit display currency, e.g. "chaos".
    pub currency_text: Option<String>,
    /// Item buyout note, e.g. "~price 2 chaos".
    pub note: Option<String>,
    /// Stash-tab buyout note, applied when the item has no price of its own.
    pub stash_note: Option<String>,
}

impl Listing {
    /// A generic, unpriced single item.
    pub fn new(id: ListingId, league: impl Into<String>, item_name: impl Into<String>) -> Self {
        Self {
            id,
            league: League::new(league),
            item_name: item_name.into(),
            stack_size: None,
            is_currency_item: false,
            price_text: None,
            currency_text: None,
            note: None,
            stash_note: None,
        }
    }

    /// Mark as a currency item with the given stack size.
    pub fn currency_stack(mut self, stack_size: u32) -> Self {
        self.is_currency_item = true;
        self.stack_size = Some(stack_size);
        self
    }

    pub fn priced(mut self, amount: impl Into<String>, currency: impl Into<String>) -> Self {
        self.price_text = Some(amount.into());
        self.currency_text = Some(currency.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_stash_note(mut self, note: impl Into<String>) -> Self {
        self.stash_note = Some(note.into());
        self
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}] {}", self.id, self.league, self.item_name)?;
        if let Some(n) = self.stack_size {
            write!(f, " x{n}")?;
        }
        if self.is_currency_item {
            write!(f, " (currency)")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Exchange rates
// ---------------------------------------------------------------------------

/// Current best-estimate rate: one unit of `from` is worth `rate` units of `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRateEntry {
    pub from: CurrencyId,
    pub to: CurrencyId,
    pub league: League,
    pub rate: f64,
    /// Number of currency-trade observations folded into `rate`.
    pub observations: u64,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeRateEntry {
    /// The fixed reference self-rate for a league.
    pub fn identity(reference: &CurrencyId, league: &League) -> Self {
        Self {
            from: reference.clone(),
            to: reference.clone(),
            league: league.clone(),
            rate: 1.0,
            observations: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }
}

impl fmt::Display for ExchangeRateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] 1 {} = {:.6} {} (n={})",
            self.league, self.from, self.rate, self.to, self.observations
        )
    }
}

// ---------------------------------------------------------------------------
// Sale
// ---------------------------------------------------------------------------

/// A normalized sale derived from exactly one listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub listing_id: ListingId,
    pub league: League,
    pub item_name: String,
    /// Currency the listing was priced in.
    pub currency: CurrencyId,
    /// Raw amount in `currency`.
    pub amount: f64,
    /// Value of the sale in the reference currency.
    pub reference_amount: f64,
    pub is_currency: bool,
    pub recorded_at: DateTime<Utc>,
}

impl fmt::Display for Sale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sale(#{}) [{}] {}{} for {} {} = {:.4} ref",
            self.listing_id,
            self.league,
            self.item_name,
            if self.is_currency { " (currency)" } else { "" },
            self.amount,
            self.currency,
            self.reference_amount,
        )
    }
}

// ---------------------------------------------------------------------------
// Deferral
// ---------------------------------------------------------------------------

/// Why a listing could not be priced this pass. Deferred listings are
/// retried later and never marked permanently failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeferralReason {
    /// Currency text is not in the alias table (or is ambiguous).
    UnresolvedCurrency,
    /// No rate is known yet for the currency the listing is priced in.
    PricingUnavailable,
}

impl DeferralReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferralReason::UnresolvedCurrency => "unresolved_currency",
            DeferralReason::PricingUnavailable => "pricing_unavailable",
        }
    }
}

impl fmt::Display for DeferralReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeferralReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unresolved_currency" => Ok(DeferralReason::UnresolvedCurrency),
            "pricing_unavailable" => Ok(DeferralReason::PricingUnavailable),
            _ => Err(anyhow::anyhow!("Unknown deferral reason: {s}")),
        }
    }
}

/// A row of the deferral ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredListing {
    pub listing_id: ListingId,
    pub league: League,
    pub reason: DeferralReason,
    pub attempts: u32,
    pub first_deferred_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Counters for one driver run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub batches: u64,
    pub listings_seen: u64,
    pub sales_recorded: u64,
    pub rate_updates: u64,
    pub deferred_unresolved: u64,
    pub deferred_unpriced: u64,
    pub malformed: u64,
    pub not_for_sale: u64,
    pub already_processed: u64,
    /// Deferred listings that settled on a retry pass.
    pub retried_settled: u64,
    pub cursor: ListingId,
}

impl RunReport {
    pub fn deferred(&self) -> u64 {
        self.deferred_unresolved + self.deferred_unpriced
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batches={} seen={} sales={} rate_updates={} deferred={} (unresolved={} unpriced={}) malformed={} not_for_sale={} duplicate={} retried={} cursor={}",
            self.batches,
            self.listings_seen,
            self.sales_recorded,
            self.rate_updates,
            self.deferred(),
            self.deferred_unresolved,
            self.deferred_unpriced,
            self.malformed,
            self.not_for_sale,
            self.already_processed,
            self.retried_settled,
            self.cursor,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Fatal error categories surfaced to the operator.
#[derive(Debug, thiserror::Error)]
pub enum ExchequerError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Listing source error: {0}")]
    Source(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
