//! Raw listing source.
//!
//! Defines the `ListingSource` trait: the engine's view of the ingestion
//! collaborator's ordered, ID-keyed listing sequence. The SQLite store
//! implements it over the `listing` table; tests substitute in-memory or
//! mocked sources.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Listing, ListingId};

/// Abstraction over the ordered listing feed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Listings with `id > cursor`, in ascending ID order, at most `limit`.
    async fn fetch_after(&self, cursor: ListingId, limit: u32) -> Result<Vec<Listing>>;

    /// Specific listings by ID, in ascending ID order. Unknown IDs are omitted.
    async fn fetch_by_ids(&self, ids: &[ListingId]) -> Result<Vec<Listing>>;
}
