//! Currency alias table.
//!
//! An immutable snapshot mapping every accepted display name, abbreviation
//! and spelling variant to one canonical currency. Loaded once per run from
//! the JSON file produced by the alias scraper.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::types::CurrencyId;

/// Failure to build an alias table.
#[derive(Debug, thiserror::Error)]
pub enum AliasTableError {
    #[error("Failed to read alias table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse alias table {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Alias table contains no usable aliases")]
    Empty,
}

/// Result of looking a piece of display text up in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Currency(CurrencyId),
    /// Not a known currency name.
    Unknown,
    /// The text maps to more than one canonical currency.
    Ambiguous,
}

impl Resolution {
    pub fn currency(self) -> Option<CurrencyId> {
        match self {
            Resolution::Currency(c) => Some(c),
            _ => None,
        }
    }
}

/// One value in the alias file: either the canonical name an alias points
/// to, or the list of aliases a canonical name accepts.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AliasValue {
    Canonical(String),
    Aliases(Vec<String>),
}

/// Normalise display text for lookup: trimmed, lowercase, single spaces.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accepted spellings of an already normalised alias.
fn variants(normalized: &str) -> Vec<String> {
    let dashed = normalized.replace(' ', "-");
    let dashed_clean = dashed.replace('\'', "");
    let mut out = vec![normalized.to_string()];
    for v in [dashed, dashed_clean] {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    lookup: HashMap<String, CurrencyId>,
    ambiguous: HashSet<String>,
    canonical: BTreeSet<CurrencyId>,
}

impl AliasTable {
    /// Build a table from `(alias, canonical name)` pairs.
    ///
    /// Each canonical name is also registered as an alias of itself.
    pub fn from_pairs<I, A, C>(pairs: I) -> Result<Self, AliasTableError>
    where
        I: IntoIterator<Item = (A, C)>,
        A: AsRef<str>,
        C: AsRef<str>,
    {
        let mut table = AliasTable::default();
        for (alias, canonical) in pairs {
            let canonical = canonical.as_ref().trim();
            if canonical.is_empty() {
                continue;
            }
            let currency = CurrencyId::new(canonical);
            table.insert(canonical, &currency);
            table.insert(alias.as_ref(), &currency);
            table.canonical.insert(currency);
        }

        if table.lookup.is_empty() {
            return Err(AliasTableError::Empty);
        }
        if !table.ambiguous.is_empty() {
            warn!(
                count = table.ambiguous.len(),
                aliases = ?table.ambiguous,
                "Ambiguous currency aliases dropped"
            );
        }
        Ok(table)
    }

    /// Parse the JSON alias file format.
    pub fn from_json_str(json: &str, path: &str) -> Result<Self, AliasTableError> {
        let raw: BTreeMap<String, AliasValue> =
            serde_json::from_str(json).map_err(|source| AliasTableError::Parse {
                path: path.to_string(),
                source,
            })?;

        let mut pairs = Vec::new();
        for (key, value) in raw {
            match value {
                AliasValue::Canonical(canonical) => pairs.push((key, canonical)),
                AliasValue::Aliases(aliases) => {
                    pairs.push((key.clone(), key.clone()));
                    pairs.extend(aliases.into_iter().map(|a| (a, key.clone())));
                }
            }
        }
        Self::from_pairs(pairs)
    }

    /// Load the alias table snapshot from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AliasTableError> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let json = fs::read_to_string(path).map_err(|source| AliasTableError::Io {
            path: path_str.clone(),
            source,
        })?;
        let table = Self::from_json_str(&json, &path_str)?;
        info!(
            path = %path_str,
            aliases = table.len(),
            currencies = table.canonical.len(),
            "Alias table loaded"
        );
        Ok(table)
    }

    fn insert(&mut self, alias: &str, currency: &CurrencyId) {
        let normalized = normalize(alias);
        if normalized.is_empty() {
            return;
        }
        for key in variants(&normalized) {
            if self.ambiguous.contains(&key) {
                continue;
            }
            match self.lookup.get(&key) {
                None => {
                    self.lookup.insert(key, currency.clone());
                }
                Some(existing) if existing == currency => {}
                Some(existing) => {
                    debug!(alias = %key, first = %existing, second = %currency, "Alias collision");
                    self.lookup.remove(&key);
                    self.ambiguous.insert(key);
                }
            }
        }
    }

    /// Exact lookup of normalised display text.
    pub fn resolve(&self, text: &str) -> Resolution {
        let key = normalize(text);
        if self.ambiguous.contains(&key) {
            return Resolution::Ambiguous;
        }
        match self.lookup.get(&key) {
            Some(c) => Resolution::Currency(c.clone()),
            None => Resolution::Unknown,
        }
    }

    pub fn contains_currency(&self, currency: &CurrencyId) -> bool {
        self.canonical.contains(currency)
    }

    pub fn currencies(&self) -> impl Iterator<Item = &CurrencyId> {
        self.canonical.iter()
    }

    /// Number of accepted lookup keys (including generated variants).
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
