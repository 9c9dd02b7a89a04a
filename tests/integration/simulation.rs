//! Noisy market replay.
//!
//! Streams a long sequence of currency trades with heavy outliers through
//! the full pipeline and checks that the learned rate moves in bounded
//! steps and settles near the true price.

use std::sync::Arc;

use exchequer::currency::{AliasTable, CurrencyItemDetection, CurrencyResolver};
use exchequer::engine::{stop_channel, DriverConfig, RatePolicy, RunDriver, RunMode, Valuator};
use exchequer::storage::SqliteStore;
use exchequer::types::{CurrencyId, League, Listing};

use crate::mock_source::MockSource;

const TRUE_PRICE: f64 = 150.0;

/// Deterministic xorshift stream in [0, 1).
struct Noise(u64);

impl Noise {
    fn next(&mut self) -> f64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Exalted Orb trades around `TRUE_PRICE`, every tenth one absurd.
fn trades(count: i64) -> Vec<Listing> {
    let mut noise = Noise(0x5eed_1234_abcd_9876);
    (1..=count)
        .map(|id| {
            let price = if id % 10 == 0 {
                if noise.next() < 0.5 {
                    TRUE_PRICE * 1000.0
                } else {
                    TRUE_PRICE / 1000.0
                }
            } else {
                TRUE_PRICE * (0.9 + 0.2 * noise.next())
            };
            Listing::new(id, "Standard", "Exalted Orb")
                .currency_stack(1)
                .priced(format!("{price:.4}"), "chaos")
        })
        .collect()
}

#[tokio::test]
async fn test_noisy_stream_moves_in_bounded_steps() {
    let chaos = CurrencyId::new("Chaos Orb");
    let exa = CurrencyId::new("Exalted Orb");
    let league = League::new("Standard");
    let policy = RatePolicy::default();

    let table = AliasTable::from_pairs([("chaos", "Chaos Orb"), ("exa", "Exalted Orb")]).unwrap();
    let resolver = CurrencyResolver::new(Arc::new(table), CurrencyItemDetection::Flag);
    let store = SqliteStore::in_memory(chaos.clone()).await.unwrap();
    let source = MockSource::new(Vec::new());

    let mut previous: Option<f64> = None;
    for listing in trades(400) {
        source.push(vec![listing]);
        let (_stop, signal) = stop_channel();
        let config = DriverConfig {
            batch_size: 1,
            mode: RunMode::OneShot,
            ..DriverConfig::default()
        };
        let valuator = Valuator::new(resolver.clone(), chaos.clone(), policy);
        let mut driver = RunDriver::new(source.clone(), store.clone(), valuator, config, signal);
        driver.run().await.unwrap();

        let entry = store.get_rate(&exa, &chaos, &league).await.unwrap().unwrap();
        if let Some(prev) = previous {
            let change = (entry.rate - prev).abs() / prev;
            assert!(
                change <= policy.allowed_step(entry.observations - 1) + 1e-9,
                "step {change} too large at n={}",
                entry.observations
            );
        }
        assert!(entry.rate > 0.0);
        previous = Some(entry.rate);
    }

    let final_rate = previous.unwrap();
    assert!(
        (final_rate - TRUE_PRICE).abs() / TRUE_PRICE < 0.15,
        "final rate {final_rate} drifted from {TRUE_PRICE}"
    );
    assert_eq!(store.sale_count().await.unwrap(), 400);
}
