// Capital limits under concurrent entry attempts
use chrono::{DateTime, Utc};
use ladderbot::broker::SimulatedBroker;
use ladderbot::execution::{event_channel, PriceCache};
use ladderbot::models::{Candle, PriceTick};
use ladderbot::persistence::MemoryStore;
use ladderbot::risk::{CapitalAllocator, CapitalLimits, CapitalRejection};
use ladderbot::{StrategyConfig, StrategyEngine};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;

const T0: i64 = 1_700_000_040;

fn at(offset_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(T0 + offset_secs, 0).unwrap()
}

fn create_test_limits() -> CapitalLimits {
    CapitalLimits {
        total_capital: 240_000.0,
        max_positions: 80,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_81_concurrent_reservations_grant_80() {
    let allocator = Arc::new(CapitalAllocator::new(create_test_limits()));

    let mut attempts = JoinSet::new();
    for _ in 0..81 {
        let allocator = allocator.clone();
        attempts.spawn(async move { allocator.reserve(3_000.0) });
    }

    let mut granted = Vec::new();
    let mut denied = Vec::new();
    while let Some(result) = attempts.join_next().await {
        match result.unwrap() {
            Ok(reservation) => granted.push(reservation),
            Err(rejection) => denied.push(rejection),
        }
    }

    assert_eq!(granted.len(), 80);
    assert_eq!(denied.len(), 1);
    assert!(matches!(
        denied[0],
        CapitalRejection::InsufficientCapital { .. } | CapitalRejection::PositionLimit { .. }
    ));

    let ledger = allocator.snapshot();
    assert_eq!(ledger.open_position_count, 80);
    assert!((ledger.deployed_capital - 240_000.0).abs() < 1e-6);

    // A release frees exactly one slot
    allocator.release(granted.pop().unwrap()).unwrap();
    assert!(allocator.reserve(3_000.0).is_ok());
    assert!(allocator.reserve(3_000.0).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reserve_and_release_balance() {
    let allocator = Arc::new(CapitalAllocator::new(create_test_limits()));

    let mut tasks = JoinSet::new();
    for _ in 0..200 {
        let allocator = allocator.clone();
        tasks.spawn(async move {
            if let Ok(reservation) = allocator.reserve(3_000.0) {
                tokio::task::yield_now().await;
                allocator.release(reservation).unwrap();
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    let ledger = allocator.snapshot();
    assert_eq!(ledger.open_position_count, 0);
    assert!(ledger.deployed_capital.abs() < 1e-6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scan_stops_at_capital_limit_in_rank_order() {
    let config = StrategyConfig {
        symbols: (0..81).map(|i| format!("S{:02}", i)).collect(),
        scan_interval_secs: 60,
        broker_timeout_ms: 500,
        ..Default::default()
    };
    let (publisher, _events) = event_channel(1_024);
    let store = Arc::new(MemoryStore::new());
    let engine = StrategyEngine::new(
        config.clone(),
        Arc::new(SimulatedBroker::new(publisher)),
        Arc::new(PriceCache::new()),
        store.clone(),
        store,
    );

    for (i, symbol) in config.symbols.iter().enumerate() {
        let mut emas = BTreeMap::new();
        emas.insert(20, 90.0);
        emas.insert(50, 85.0);
        engine.candles().seed(Candle {
            symbol: symbol.clone(),
            interval_start: at(0),
            open: 90.0,
            high: 90.0,
            low: 90.0,
            close: 90.0,
            volume: 1.0,
            emas,
        });
        // Higher index, stronger momentum
        engine.ingest(&PriceTick::new(symbol, 100.0 + i as f64 * 0.1, at(65)));
    }
    engine.start();

    let report = engine.run_scan_cycle(at(121)).await;

    assert_eq!(report.ranked, 81);
    assert_eq!(report.candidates, 81);
    assert_eq!(report.entries_attempted, 80);
    assert_eq!(report.entries_opened, 80);
    assert!(report.capital_exhausted);

    let capital = engine.capital();
    assert_eq!(capital.ledger.open_position_count, 80);
    assert!((capital.ledger.deployed_capital - 240_000.0).abs() < 1e-6);

    // The weakest candidate is the one left out
    let open: Vec<String> = engine
        .ladders()
        .into_iter()
        .filter(|v| !v.trades.is_empty())
        .map(|v| v.symbol)
        .collect();
    assert_eq!(open.len(), 80);
    assert!(!open.contains(&"S00".to_string()));
}
