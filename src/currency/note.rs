//! Buyout note parsing.
//!
//! Sellers price items with a free-text note on the item or the whole stash
//! tab, e.g. `~price 2 chaos` or `~b/o 1/2 exa`.

use regex::Regex;
use std::sync::OnceLock;

/// Why a listing's price cannot be used.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedPrice {
    #[error("unparseable amount {0:?}")]
    Unparseable(String),

    #[error("zero denominator in amount {0:?}")]
    ZeroDenominator(String),

    #[error("non-positive amount {0}")]
    NonPositive(f64),

    #[error("price amount without a currency")]
    MissingCurrency,

    #[error("empty stack")]
    EmptyStack,

    #[error("reference value {0} out of range")]
    OutOfRange(f64),
}

/// A parsed price: a positive amount of some (unresolved) currency text.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTag {
    pub amount: f64,
    pub currency_text: String,
}

impl PriceTag {
    /// Texts to try against the alias table, most specific abbreviation first:
    /// the first word, then the whole remainder.
    pub fn currency_candidates(&self) -> Vec<&str> {
        let full = self.currency_text.trim();
        let mut out = Vec::with_capacity(2);
        if let Some(first) = full.split_whitespace().next() {
            out.push(first);
        }
        if !out.contains(&full) && !full.is_empty() {
            out.push(full);
        }
        out
    }
}

fn price_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^~(?:b/o|price)\s+(\S+)\s+(.+?)\s*$").expect("valid price tag regex")
    })
}

fn is_buyout_note(note: &str) -> bool {
    let lower = note.to_lowercase();
    lower.starts_with("~price") || lower.starts_with("~b/o")
}

/// Parse a buyout note.
///
/// Returns `None` when the note is not a buyout tag at all (the item is not
/// for sale through this note), `Some(Err(_))` when it is a buyout tag whose
/// amount cannot be used.
pub fn parse_note(note: &str) -> Option<Result<PriceTag, MalformedPrice>> {
    let note = note.trim();
    if !is_buyout_note(note) {
        return None;
    }
    let Some(caps) = price_tag_re().captures(note) else {
        return Some(Err(MalformedPrice::Unparseable(note.to_string())));
    };
    let amount = match parse_amount(&caps[1]) {
        Ok(a) => a,
        Err(e) => return Some(Err(e)),
    };
    Some(Ok(PriceTag {
        amount,
        currency_text: caps[2].to_string(),
    }))
}

/// Parse a positive decimal or fraction amount (`2`, `2.5`, `1/2`).
pub fn parse_amount(text: &str) -> Result<f64, MalformedPrice> {
    let text = text.trim();
    let number = |s: &str| -> Result<f64, MalformedPrice> {
        s.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| MalformedPrice::Unparseable(text.to_string()))
    };

    let value = match text.split_once('/') {
        Some((num, den)) => {
            let num = number(num)?;
            let den = number(den)?;
            if den == 0.0 {
                return Err(MalformedPrice::ZeroDenominator(text.to_string()));
            }
            num / den
        }
        None => number(text)?,
    };

    if value <= 0.0 || !value.is_finite() {
        return Err(MalformedPrice::NonPositive(value));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
