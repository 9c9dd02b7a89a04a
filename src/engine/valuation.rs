//! Valuation core.
//!
//! Turns one listing into zero or one sale plus at most one rate-update
//! proposal. The work is split in two pure steps so that the rate reads can
//! happen inside the listing's store transaction:
//!
//! 1. [`Valuator::prepare`] decides what was sold for what (price source,
//!    currency resolution, currency-item classification) using only the
//!    listing and the alias snapshot.
//! 2. [`Valuator::appraise`] prices the prepared listing against the rates
//!    known *before* it and derives the rate observation for currency trades.

use chrono::Utc;
use tracing::debug;

use super::rates::{RatePolicy, RateQuotes};
use crate::currency::{parse_amount, parse_note, CurrencyResolver, MalformedPrice, PriceTag, Resolution};
use crate::types::{CurrencyId, DeferralReason, ExchangeRateEntry, League, Listing, ListingId, Sale};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a listing produced nothing at the preparation step.
#[derive(Debug, Clone, PartialEq)]
pub enum Skip {
    /// No buyout price anywhere on the listing.
    NotForSale,
    /// The price exists but cannot be used.
    Malformed(MalformedPrice),
    /// The price currency text does not resolve to a single currency.
    Unresolved { text: String, ambiguous: bool },
}

impl Skip {
    /// Deferral ledger reason, for skips that a later pass may fix.
    pub fn deferral(&self) -> Option<DeferralReason> {
        match self {
            Skip::Unresolved { .. } => Some(DeferralReason::UnresolvedCurrency),
            Skip::NotForSale | Skip::Malformed(_) => None,
        }
    }
}

/// What the listing's item is.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    /// A good priced in some currency. Never influences rates.
    Generic,
    /// A stack of `quantity` units of `currency`, traded for another currency.
    Currency { currency: CurrencyId, quantity: f64 },
}

/// A listing whose price and currencies are fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedListing {
    pub listing_id: ListingId,
    pub league: League,
    pub item_name: String,
    /// Raw amount in `currency`.
    pub amount: f64,
    /// Currency the listing is priced in.
    pub currency: CurrencyId,
    pub kind: ItemKind,
}

impl PreparedListing {
    pub fn is_currency(&self) -> bool {
        matches!(self.kind, ItemKind::Currency { .. })
    }

    /// Non-reference currencies whose rates pricing may consult.
    pub fn rate_keys(&self, reference: &CurrencyId) -> Vec<CurrencyId> {
        let mut keys = Vec::with_capacity(2);
        if &self.currency != reference {
            keys.push(self.currency.clone());
        }
        if let ItemKind::Currency { currency, .. } = &self.kind {
            if currency != reference && !keys.contains(currency) {
                keys.push(currency.clone());
            }
        }
        keys
    }
}

/// A proposed change to one (currency → reference) entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RateUpdate {
    pub entry: ExchangeRateEntry,
    /// Unit rate implied by this listing alone.
    pub observed: f64,
    /// Stored rate before the update, if any.
    pub previous: Option<f64>,
}

/// Result of pricing a prepared listing.
#[derive(Debug, Clone, PartialEq)]
pub enum Appraisal {
    Priced {
        sale: Sale,
        update: Option<RateUpdate>,
    },
    /// No rate is known for the currency needed; defer.
    Unpriced,
    /// The price converts to no usable reference value.
    Malformed(MalformedPrice),
}

// ---------------------------------------------------------------------------
// Valuator
// ---------------------------------------------------------------------------

pub struct Valuator {
    resolver: CurrencyResolver,
    reference: CurrencyId,
    policy: RatePolicy,
}

impl Valuator {
    pub fn new(resolver: CurrencyResolver, reference: CurrencyId, policy: RatePolicy) -> Self {
        Self {
            resolver,
            reference,
            policy,
        }
    }

    pub fn reference(&self) -> &CurrencyId {
        &self.reference
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Decide what the listing sold for, resolving every currency involved.
    pub fn prepare(&self, listing: &Listing) -> Result<PreparedListing, Skip> {
        let (tag, explicit) = Self::price_tag(listing)?;

        let resolution = if explicit {
            self.resolver.resolve(&tag.currency_text)
        } else {
            self.resolver.resolve_any(tag.currency_candidates())
        };
        let currency = match resolution {
            Resolution::Currency(c) => c,
            Resolution::Unknown => {
                return Err(Skip::Unresolved {
                    text: tag.currency_text,
                    ambiguous: false,
                })
            }
            Resolution::Ambiguous => {
                return Err(Skip::Unresolved {
                    text: tag.currency_text,
                    ambiguous: true,
                })
            }
        };

        let kind = match self.resolver.item_currency(listing) {
            Some(item) => {
                let quantity = match listing.stack_size {
                    Some(0) => return Err(Skip::Malformed(MalformedPrice::EmptyStack)),
                    Some(n) => f64::from(n),
                    None => 1.0,
                };
                ItemKind::Currency {
                    currency: item,
                    quantity,
                }
            }
            None => ItemKind::Generic,
        };

        Ok(PreparedListing {
            listing_id: listing.id,
            league: listing.league.clone(),
            item_name: listing.item_name.clone(),
            amount: tag.amount,
            currency,
            kind,
        })
    }

    /// Pick the listing's price: explicit fields, then item note, then
    /// stash note. The flag reports whether the explicit fields were used.
    fn price_tag(listing: &Listing) -> Result<(PriceTag, bool), Skip> {
        if let Some(amount_text) = &listing.price_text {
            let currency_text = listing
                .currency_text
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or(Skip::Malformed(MalformedPrice::MissingCurrency))?;
            let amount = parse_amount(amount_text).map_err(Skip::Malformed)?;
            return Ok((
                PriceTag {
                    amount,
                    currency_text: currency_text.to_string(),
                },
                true,
            ));
        }

        let item = listing.note.as_deref().and_then(parse_note);
        if let Some(Ok(tag)) = &item {
            return Ok((tag.clone(), false));
        }
        let stash = listing.stash_note.as_deref().and_then(parse_note);

        match (item, stash) {
            (_, Some(Ok(tag))) => Ok((tag, false)),
            (Some(Err(e)), _) | (None, Some(Err(e))) => Err(Skip::Malformed(e)),
            _ => Err(Skip::NotForSale),
        }
    }

    /// Price a prepared listing against the rates known before it.
    pub fn appraise(&self, p: &PreparedListing, quotes: &RateQuotes) -> Appraisal {
        debug_assert_eq!(quotes.league(), &p.league);
        let reference = &self.reference;

        let (reference_amount, observation) = match &p.kind {
            ItemKind::Currency { currency: item, quantity } if item != &p.currency => {
                if &p.currency == reference {
                    (p.amount, Some((item, p.amount / quantity)))
                } else if item == reference {
                    // Selling the reference itself: the trade is its own price.
                    (*quantity, Some((&p.currency, quantity / p.amount)))
                } else if let Some(rate) = quotes.unit_value(&p.currency) {
                    let value = p.amount * rate;
                    (value, Some((item, value / quantity)))
                } else if let Some(rate) = quotes.unit_value(item) {
                    let value = quantity * rate;
                    (value, Some((&p.currency, value / p.amount)))
                } else {
                    return Appraisal::Unpriced;
                }
            }
            _ => match quotes.unit_value(&p.currency) {
                Some(rate) => (p.amount * rate, None),
                None => return Appraisal::Unpriced,
            },
        };

        if !reference_amount.is_finite() || reference_amount <= 0.0 {
            debug!(listing_id = p.listing_id, reference_amount, "Reference value out of range");
            return Appraisal::Malformed(MalformedPrice::OutOfRange(reference_amount));
        }

        let update = observation.and_then(|(currency, observed)| {
            let previous = quotes.entry(currency);
            self.policy
                .blend(previous, currency, reference, &p.league, observed)
                .map(|entry| RateUpdate {
                    previous: previous.map(|e| e.rate),
                    observed,
                    entry,
                })
        });

        debug!(
            listing_id = p.listing_id,
            league = %p.league,
            amount = p.amount,
            currency = %p.currency,
            reference_amount,
            is_currency = p.is_currency(),
            "Listing priced"
        );

        Appraisal::Priced {
            sale: Sale {
                listing_id: p.listing_id,
                league: p.league.clone(),
                item_name: p.item_name.clone(),
                currency: p.currency.clone(),
                amount: p.amount,
                reference_amount,
                is_currency: p.is_currency(),
                recorded_at: Utc::now(),
            },
            update,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
