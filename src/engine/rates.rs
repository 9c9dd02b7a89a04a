//! Exchange-rate blending.
//!
//! Folds a new currency-trade observation into the stored rate with a
//! bounded proportional step that tapers as the observation count grows,
//! and provides the per-listing rate snapshot the valuation core prices
//! against.

use anyhow::{ensure, Result};
use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;

use crate::types::{CurrencyId, ExchangeRateEntry, League};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Bounded-step blending parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatePolicy {
    /// Largest proportional move a single observation may cause (0.10 = 10%).
    pub max_step: f64,
    /// Floor the tapered step never drops below, so rates keep tracking drift.
    pub min_step: f64,
    /// How quickly the allowed step shrinks with the observation count.
    pub taper: f64,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            max_step: 0.10,
            min_step: 0.01,
            taper: 0.05,
        }
    }
}

impl RatePolicy {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_step > 0.0 && self.max_step < 1.0,
            "rates.max_step must be in (0, 1), got {}",
            self.max_step
        );
        ensure!(
            self.min_step >= 0.0 && self.min_step <= self.max_step,
            "rates.min_step must be in [0, max_step], got {}",
            self.min_step
        );
        ensure!(
            self.taper >= 0.0 && self.taper.is_finite(),
            "rates.taper must be a non-negative number, got {}",
            self.taper
        );
        Ok(())
    }

    /// Allowed proportional step for an entry that already folded in
    /// `observations` trades.
    pub fn allowed_step(&self, observations: u64) -> f64 {
        let n = observations.saturating_sub(1) as f64;
        (self.max_step / (1.0 + self.taper * n)).clamp(self.min_step, self.max_step)
    }

    /// Fold `observed` (units of `to` per unit of `from`) into `current`.
    ///
    /// Returns `None` for unusable observations (non-finite or non-positive).
    pub fn blend(
        &self,
        current: Option<&ExchangeRateEntry>,
        from: &CurrencyId,
        to: &CurrencyId,
        league: &League,
        observed: f64,
    ) -> Option<ExchangeRateEntry> {
        if !observed.is_finite() || observed <= 0.0 {
            return None;
        }

        let (rate, observations) = match current {
            Some(entry) if entry.rate > 0.0 => {
                let step = self.allowed_step(entry.observations);
                let lower = entry.rate * (1.0 - step);
                let upper = entry.rate * (1.0 + step);
                let rate = observed.clamp(lower, upper);
                debug!(
                    from = %from,
                    to = %to,
                    league = %league,
                    previous = entry.rate,
                    observed,
                    step,
                    rate,
                    "Rate blended"
                );
                (rate, entry.observations + 1)
            }
            _ => (observed, 1),
        };

        Some(ExchangeRateEntry {
            from: from.clone(),
            to: to.clone(),
            league: league.clone(),
            rate,
            observations,
            updated_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Rate snapshot
// ---------------------------------------------------------------------------

/// The rates (currency → reference, one league) visible to a single listing.
///
/// Built inside the listing's transaction from the store, before the
/// listing's own observation is applied.
#[derive(Debug, Clone)]
pub struct RateQuotes {
    reference: CurrencyId,
    league: League,
    entries: HashMap<CurrencyId, ExchangeRateEntry>,
}

impl RateQuotes {
    pub fn new(reference: CurrencyId, league: League) -> Self {
        Self {
            reference,
            league,
            entries: HashMap::new(),
        }
    }

    /// Add an entry. Entries for other leagues, other targets, or the
    /// reference itself are ignored.
    pub fn insert(&mut self, entry: ExchangeRateEntry) {
        if entry.league != self.league || entry.to != self.reference || entry.is_identity() {
            return;
        }
        if entry.rate > 0.0 && entry.rate.is_finite() {
            self.entries.insert(entry.from.clone(), entry);
        }
    }

    pub fn with(mut self, entry: ExchangeRateEntry) -> Self {
        self.insert(entry);
        self
    }

    pub fn reference(&self) -> &CurrencyId {
        &self.reference
    }

    pub fn league(&self) -> &League {
        &self.league
    }

    /// Value of one unit of `currency` in the reference currency.
    pub fn unit_value(&self, currency: &CurrencyId) -> Option<f64> {
        if currency == &self.reference {
            return Some(1.0);
        }
        self.entries.get(currency).map(|e| e.rate)
    }

    pub fn entry(&self, currency: &CurrencyId) -> Option<&ExchangeRateEntry> {
        self.entries.get(currency)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
