//! End-to-end valuation runs: listings in, sales and rates out.

use std::sync::Arc;
use std::time::Duration;

use exchequer::config::StoreConfig;
use exchequer::currency::{AliasTable, CurrencyItemDetection, CurrencyResolver};
use exchequer::engine::{stop_channel, DriverConfig, RatePolicy, RunDriver, RunMode, Valuator};
use exchequer::source::ListingSource;
use exchequer::storage::SqliteStore;
use exchequer::types::{CurrencyId, DeferralReason, ExchangeRateEntry, League, Listing, RunReport};
use secrecy::SecretString;

use crate::mock_source::MockSource;

const ALIASES: &str = r#"{
    "Chaos Orb": ["chaos", "c"],
    "Exalted Orb": ["exa", "ex", "exalted"],
    "Orb of Fusing": ["fuse", "fusing"],
    "Divine Orb": ["divine"]
}"#;

fn chaos() -> CurrencyId {
    CurrencyId::new("Chaos Orb")
}

fn exa() -> CurrencyId {
    CurrencyId::new("Exalted Orb")
}

fn standard() -> League {
    League::new("Standard")
}

fn valuator() -> Valuator {
    let table = AliasTable::from_json_str(ALIASES, "inline").unwrap();
    let resolver = CurrencyResolver::new(Arc::new(table), CurrencyItemDetection::Flag);
    Valuator::new(resolver, chaos(), RatePolicy::default())
}

fn driver_config(mode: RunMode) -> DriverConfig {
    DriverConfig {
        batch_size: 3,
        poll_interval: Duration::from_millis(10),
        retry_limit: 100,
        mode,
    }
}

async fn run_once<S: ListingSource>(source: S, store: &SqliteStore) -> RunReport {
    let (_stop, signal) = stop_channel();
    let mut driver = RunDriver::new(source, store.clone(), valuator(), driver_config(RunMode::OneShot), signal);
    driver.run().await.unwrap()
}

async fn file_store(path: &std::path::Path) -> SqliteStore {
    let url = SecretString::new(format!("sqlite://{}", path.display()));
    SqliteStore::connect(&url, &StoreConfig::default(), chaos()).await.unwrap()
}

/// Rates without timestamps, for comparing runs.
fn rate_values(rates: &[ExchangeRateEntry]) -> Vec<(String, String, f64, u64)> {
    rates
        .iter()
        .map(|e| (e.from.to_string(), e.to.to_string(), e.rate, e.observations))
        .collect()
}

fn market() -> Vec<Listing> {
    vec![
        Listing::new(1, "Standard", "Exalted Orb").currency_stack(1).priced("100", "chaos"),
        Listing::new(2, "Standard", "Tabula Rasa").with_note("~price 2 exa"),
        Listing::new(3, "Standard", "Exalted Orb").currency_stack(2).priced("230", "chaos"),
        Listing::new(4, "Standard", "Orb of Fusing").currency_stack(20).priced("1", "exa"),
        Listing::new(5, "Standard", "Tabula Rasa").with_stash_note("~b/o 10 fuse"),
        Listing::new(6, "Standard", "Chaos Orb").currency_stack(50).with_note("~price 1/2 divine"),
        Listing::new(7, "Standard", "Tabula Rasa").with_note("~price 3 mystery coin"),
        Listing::new(8, "Standard", "Tabula Rasa").priced("1", "divine"),
    ]
}

#[tokio::test]
async fn test_currency_trade_then_generic_item() {
    let store = SqliteStore::in_memory(chaos()).await.unwrap();
    let source = MockSource::new(vec![
        Listing::new(101, "Standard", "Exalted Orb").currency_stack(10).priced("2", "chaos"),
        Listing::new(102, "Standard", "Tabula Rasa").priced("5", "exa"),
    ]);
    let report = run_once(source, &store).await;
    assert_eq!(report.sales_recorded, 2);

    let first = store.sale(101).await.unwrap().unwrap();
    assert!(first.is_currency);
    assert!((first.reference_amount - 2.0).abs() < 1e-9);

    let rate = store.get_rate(&exa(), &chaos(), &standard()).await.unwrap().unwrap();
    assert!((rate.rate - 0.2).abs() < 1e-12);

    let second = store.sale(102).await.unwrap().unwrap();
    assert!(!second.is_currency);
    assert!((second.reference_amount - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_unresolved_currency_is_deferred_and_skipped() {
    let store = SqliteStore::in_memory(chaos()).await.unwrap();
    let source = MockSource::new(vec![Listing::new(7, "Standard", "Tabula Rasa").priced("3", "mystery coin")]);
    let report = run_once(source, &store).await;

    assert_eq!(report.deferred_unresolved, 1);
    assert!(store.sale(7).await.unwrap().is_none());
    assert_eq!(store.cursor().await.unwrap(), 7);
    let ledger = store.deferred(10).await.unwrap();
    assert_eq!(ledger[0].reason, DeferralReason::UnresolvedCurrency);
}

#[tokio::test]
async fn test_mixed_market_walkthrough() {
    let store = SqliteStore::in_memory(chaos()).await.unwrap();
    let report = run_once(MockSource::new(market()), &store).await;

    assert_eq!(report.listings_seen, 8);
    assert_eq!(report.batches, 3);
    assert_eq!(report.cursor, 8);

    // 1: exa first seen at 100. 3: 115 per exa, bounded to +10%.
    let exa_rate = store.get_rate(&exa(), &chaos(), &standard()).await.unwrap().unwrap();
    assert!((exa_rate.rate - 110.0).abs() < 1e-9);
    assert_eq!(exa_rate.observations, 2);

    // 2 priced before the second exa trade.
    assert!((store.sale(2).await.unwrap().unwrap().reference_amount - 200.0).abs() < 1e-9);

    // 4: 20 fuse for 1 exa at 110 => 5.5 per fuse. 5 then priced through it.
    let fuse = store
        .get_rate(&CurrencyId::new("Orb of Fusing"), &chaos(), &standard())
        .await
        .unwrap()
        .unwrap();
    assert!((fuse.rate - 5.5).abs() < 1e-9);
    assert!((store.sale(5).await.unwrap().unwrap().reference_amount - 55.0).abs() < 1e-9);

    // 6: 50 chaos for half a divine => 100 per divine. 8 then priced through it.
    let divine = store
        .get_rate(&CurrencyId::new("Divine Orb"), &chaos(), &standard())
        .await
        .unwrap()
        .unwrap();
    assert!((divine.rate - 100.0).abs() < 1e-9);
    assert!((store.sale(8).await.unwrap().unwrap().reference_amount - 100.0).abs() < 1e-9);

    assert_eq!(report.sales_recorded, 7);
    assert_eq!(report.deferred_unresolved, 1);
    assert_eq!(store.sale_count().await.unwrap(), 7);
}

#[tokio::test]
async fn test_reference_self_rate_stays_one() {
    let store = SqliteStore::in_memory(chaos()).await.unwrap();
    let source = MockSource::new(vec![
        Listing::new(1, "Standard", "Chaos Orb").currency_stack(10).priced("7", "chaos"),
        Listing::new(2, "Standard", "Chaos Orb").currency_stack(300).priced("2", "exa"),
    ]);
    run_once(source, &store).await;

    let rates = store.rates_for_league(&standard()).await.unwrap();
    let identity = rates.iter().find(|e| e.is_identity()).unwrap();
    assert_eq!(identity.rate, 1.0);
    assert_eq!(identity.observations, 0);
    assert!(rates.iter().all(|e| e.rate > 0.0));
    // Selling 300 chaos for 2 exa observes exa directly.
    let exa_rate = rates.iter().find(|e| e.from == exa()).unwrap();
    assert!((exa_rate.rate - 150.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_leagues_are_isolated() {
    let store = SqliteStore::in_memory(chaos()).await.unwrap();
    let source = MockSource::new(vec![
        Listing::new(1, "Standard", "Exalted Orb").currency_stack(1).priced("100", "chaos"),
        Listing::new(2, "Hardcore", "Tabula Rasa").priced("1", "exa"),
        Listing::new(3, "Hardcore", "Exalted Orb").currency_stack(1).priced("300", "chaos"),
    ]);
    let report = run_once(source, &store).await;

    assert_eq!(report.deferred_unpriced, 1);
    assert!(store.sale(2).await.unwrap().is_none());

    let standard_rate = store.get_rate(&exa(), &chaos(), &standard()).await.unwrap().unwrap();
    let hardcore_rate = store
        .get_rate(&exa(), &chaos(), &League::new("Hardcore"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(standard_rate.rate, 100.0);
    assert_eq!(hardcore_rate.rate, 300.0);
    assert_eq!(hardcore_rate.observations, 1);

    // The next run retries listing 2 against the Hardcore rate.
    let report = run_once(
        MockSource::new(vec![Listing::new(2, "Hardcore", "Tabula Rasa").priced("1", "exa")]),
        &store,
    )
    .await;
    assert_eq!(report.retried_settled, 1);
    assert_eq!(store.sale(2).await.unwrap().unwrap().reference_amount, 300.0);
}

#[tokio::test]
async fn test_resume_matches_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exchequer.db");
    let all = market();

    // Uninterrupted reference run.
    let reference_store = SqliteStore::in_memory(chaos()).await.unwrap();
    run_once(MockSource::new(all.clone()), &reference_store).await;

    // Same stream, split across two processes sharing a file database.
    let source = MockSource::new(all[..4].to_vec());
    {
        let store = file_store(&path).await;
        run_once(source.clone(), &store).await;
        assert_eq!(store.cursor().await.unwrap(), 4);
        store.close().await;
    }
    source.push(all[4..].to_vec());
    let store = file_store(&path).await;
    let report = run_once(source, &store).await;
    assert_eq!(report.listings_seen, 4);
    assert_eq!(report.already_processed, 0);

    assert_eq!(store.sale_count().await.unwrap(), reference_store.sale_count().await.unwrap());
    assert_eq!(
        rate_values(&store.rates_for_league(&standard()).await.unwrap()),
        rate_values(&reference_store.rates_for_league(&standard()).await.unwrap())
    );
}

#[tokio::test]
async fn test_rerun_produces_no_duplicates() {
    let store = SqliteStore::in_memory(chaos()).await.unwrap();
    let source = MockSource::new(market());
    run_once(source.clone(), &store).await;
    let rates = rate_values(&store.rates_for_league(&standard()).await.unwrap());

    let report = run_once(source, &store).await;
    assert_eq!(report.sales_recorded, 0);
    assert_eq!(store.sale_count().await.unwrap(), 7);
    assert_eq!(rate_values(&store.rates_for_league(&standard()).await.unwrap()), rates);
}

#[tokio::test]
async fn test_source_failure_keeps_cursor() {
    let store = SqliteStore::in_memory(chaos()).await.unwrap();
    let source = MockSource::new(market()[..3].to_vec());
    run_once(source.clone(), &store).await;
    assert_eq!(store.cursor().await.unwrap(), 3);

    source.push(market()[3..].to_vec());
    source.set_error("feed offline");
    let (_stop, signal) = stop_channel();
    let mut driver = RunDriver::new(source.clone(), store.clone(), valuator(), driver_config(RunMode::OneShot), signal);
    let err = driver.run().await.unwrap_err();
    assert!(format!("{err:#}").contains("feed offline"));
    assert_eq!(store.cursor().await.unwrap(), 3);

    source.clear_error();
    let report = run_once(source, &store).await;
    assert_eq!(report.listings_seen, 5);
    assert_eq!(store.cursor().await.unwrap(), 8);
}

#[tokio::test]
async fn test_store_as_listing_source() {
    let store = SqliteStore::in_memory(chaos()).await.unwrap();
    store.insert_listings(&market()).await.unwrap();

    let report = run_once(store.clone(), &store).await;
    assert_eq!(report.listings_seen, 8);
    assert_eq!(store.sale_count().await.unwrap(), 7);

    // The unresolved listing is retried through the same store.
    let report = run_once(store.clone(), &store).await;
    assert_eq!(report.listings_seen, 0);
    assert_eq!(store.deferred(10).await.unwrap()[0].attempts, 2);
}

#[tokio::test]
async fn test_continuous_mode_picks_up_new_listings() {
    let store = SqliteStore::in_memory(chaos()).await.unwrap();
    let source = MockSource::new(vec![Listing::new(1, "Standard", "Tabula Rasa").priced("2", "exa")]);

    let (stop, signal) = stop_channel();
    let mut driver = RunDriver::new(
        source.clone(),
        store.clone(),
        valuator(),
        driver_config(RunMode::Continuous),
        signal,
    );
    let feeder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.push(vec![Listing::new(2, "Standard", "Exalted Orb").currency_stack(1).priced("120", "chaos")]);
        tokio::time::sleep(Duration::from_millis(150)).await;
        stop.stop();
    });

    let report = tokio::time::timeout(Duration::from_secs(5), driver.run())
        .await
        .expect("continuous run should stop")
        .unwrap();
    feeder.await.unwrap();

    assert_eq!(report.listings_seen, 2);
    assert_eq!(report.deferred_unpriced, 1);
    assert_eq!(report.retried_settled, 1);
    assert_eq!(store.sale(1).await.unwrap().unwrap().reference_amount, 240.0);
    assert!(store.deferred(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_alias_file_drives_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aliases.json");
    std::fs::write(&path, r#"{"chaos": "Chaos Orb", "exa": "Exalted Orb", "exalted-orb": "Exalted Orb"}"#).unwrap();

    let table = AliasTable::load(&path).unwrap();
    let resolver = CurrencyResolver::new(Arc::new(table), CurrencyItemDetection::Alias);
    let valuator = Valuator::new(resolver, chaos(), RatePolicy::default());

    let store = SqliteStore::in_memory(chaos()).await.unwrap();
    let source = MockSource::new(vec![
        // Unflagged, but the name resolves: a currency trade under alias detection.
        Listing::new(1, "Standard", "Exalted Orb").priced("90", "chaos"),
        Listing::new(2, "Standard", "Tabula Rasa").with_note("~b/o 1 exalted-orb"),
    ]);
    let (_stop, signal) = stop_channel();
    let mut driver = RunDriver::new(source, store.clone(), valuator, driver_config(RunMode::OneShot), signal);
    let report = driver.run().await.unwrap();

    assert_eq!(report.rate_updates, 1);
    assert!(store.sale(1).await.unwrap().unwrap().is_currency);
    assert_eq!(store.sale(2).await.unwrap().unwrap().reference_amount, 90.0);
}
