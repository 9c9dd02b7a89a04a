//! Currency identity resolution.
//!
//! Maps listing display text to canonical currencies through the alias
//! table snapshot and decides whether a listing's item is itself a unit of
//! currency. Everything here is a pure function of the listing and the
//! snapshot.

pub mod alias;
pub mod note;

use serde::Deserialize;
use std::sync::Arc;

pub use alias::{AliasTable, AliasTableError, Resolution};
pub use note::{parse_amount, parse_note, MalformedPrice, PriceTag};

use crate::types::{CurrencyId, Listing};

/// How a listing is recognised as a currency-for-currency trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrencyItemDetection {
    /// Ingestion's `is_currency_item` flag is set and the item name resolves.
    #[default]
    Flag,
    /// The item name resolves through the alias table, flag or not.
    Alias,
}

/// Pure resolver over an immutable alias snapshot.
#[derive(Debug, Clone)]
pub struct CurrencyResolver {
    aliases: Arc<AliasTable>,
    detection: CurrencyItemDetection,
}

impl CurrencyResolver {
    pub fn new(aliases: Arc<AliasTable>, detection: CurrencyItemDetection) -> Self {
        Self { aliases, detection }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Resolve a single piece of display text.
    pub fn resolve(&self, text: &str) -> Resolution {
        self.aliases.resolve(text)
    }

    /// Resolve the first candidate that names a currency.
    ///
    /// Ambiguity is only reported when no candidate resolves cleanly.
    pub fn resolve_any<'a, I>(&self, candidates: I) -> Resolution
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut ambiguous = false;
        for text in candidates {
            match self.aliases.resolve(text) {
                Resolution::Currency(c) => return Resolution::Currency(c),
                Resolution::Ambiguous => ambiguous = true,
                Resolution::Unknown => {}
            }
        }
        if ambiguous {
            Resolution::Ambiguous
        } else {
            Resolution::Unknown
        }
    }

    /// The currency the listing's item *is*, if it is a currency item.
    pub fn item_currency(&self, listing: &Listing) -> Option<CurrencyId> {
        if self.detection == CurrencyItemDetection::Flag && !listing.is_currency_item {
            return None;
        }
        self.aliases.resolve(&listing.item_name).currency()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
