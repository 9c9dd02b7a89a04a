//! Mock listing source for integration testing.
//!
//! Provides a deterministic `ListingSource` over an in-memory listing
//! vector. Listings can be appended while a run is in progress and every
//! fetch can be forced to fail.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use exchequer::source::ListingSource;
use exchequer::types::{Listing, ListingId};

/// An in-memory listing feed. Clones share state.
#[derive(Clone, Default)]
pub struct MockSource {
    listings: Arc<Mutex<Vec<Listing>>>,
    fetches: Arc<Mutex<u32>>,
    /// If set, all operations will return this error.
    force_error: Arc<Mutex<Option<String>>>,
}

impl MockSource {
    pub fn new(listings: Vec<Listing>) -> Self {
        let source = Self::default();
        source.push(listings);
        source
    }

    /// Append listings, keeping the feed in ID order.
    pub fn push(&self, listings: Vec<Listing>) {
        let mut all = self.listings.lock().unwrap();
        all.extend(listings);
        all.sort_by_key(|l| l.id);
    }

    /// Force all subsequent operations to return an error.
    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    /// Number of `fetch_after` calls served so far.
    pub fn fetches(&self) -> u32 {
        *self.fetches.lock().unwrap()
    }

    fn check_error(&self) -> Result<()> {
        match self.force_error.lock().unwrap().as_ref() {
            Some(err) => Err(anyhow!("{err}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ListingSource for MockSource {
    async fn fetch_after(&self, cursor: ListingId, limit: u32) -> Result<Vec<Listing>> {
        self.check_error()?;
        *self.fetches.lock().unwrap() += 1;
        Ok(self
            .listings
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.id > cursor)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn fetch_by_ids(&self, ids: &[ListingId]) -> Result<Vec<Listing>> {
        self.check_error()?;
        Ok(self
            .listings
            .lock()
            .unwrap()
            .iter()
            .filter(|l| ids.contains(&l.id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(id: ListingId) -> Listing {
        Listing::new(id, "Standard", "Tabula Rasa").priced("1", "chaos")
    }

    #[tokio::test]
    async fn test_mock_fetch_after_is_ordered_and_limited() {
        let source = MockSource::new(vec![listing(3), listing(1), listing(2), listing(4)]);
        let ids: Vec<_> = source.fetch_after(1, 2).await.unwrap().iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_mock_fetch_by_ids() {
        let source = MockSource::new(vec![listing(1), listing(2), listing(3)]);
        let ids: Vec<_> = source.fetch_by_ids(&[3, 1, 9]).await.unwrap().iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_mock_forced_error() {
        let source = MockSource::new(vec![listing(1)]);
        source.set_error("feed offline");
        let err = source.fetch_after(0, 10).await.unwrap_err();
        assert!(err.to_string().contains("feed offline"));
        assert!(source.fetch_by_ids(&[1]).await.is_err());
        source.clear_error();
        assert_eq!(source.fetch_after(0, 10).await.unwrap().len(), 1);
    }
}
