// End-to-end ladder tests: ticks in, scan cycle, escalation, trailing stops and exits
use chrono::{DateTime, Utc};
use ladderbot::broker::{Broker, SimulatedBroker};
use ladderbot::execution::{event_channel, LadderState, LadderView};
use ladderbot::models::{Candle, ExitReason, PriceTick, Tier, Trade, TradeStatus};
use ladderbot::persistence::{CandleStore, MemoryStore, TradeStore};
use ladderbot::{StrategyConfig, StrategyEngine};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Start of a 60s interval
const T0: i64 = 1_700_000_040;

fn at(offset_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(T0 + offset_secs, 0).unwrap()
}

fn create_test_config(symbols: &[&str]) -> StrategyConfig {
    StrategyConfig {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        scan_interval_secs: 60,
        broker_timeout_ms: 200,
        retry_backoff_ms: 1,
        ..Default::default()
    }
}

/// Closed candle whose EMAs sit below `close`, so the next candle ranks well
fn create_seed_candle(symbol: &str, close: f64) -> Candle {
    create_candle_with_emas(symbol, close, close, close * 0.95)
}

fn create_candle_with_emas(symbol: &str, close: f64, ema_short: f64, ema_long: f64) -> Candle {
    let mut emas = BTreeMap::new();
    emas.insert(20, ema_short);
    emas.insert(50, ema_long);
    Candle {
        symbol: symbol.to_string(),
        interval_start: at(0),
        open: close,
        high: close,
        low: close,
        close,
        volume: 10.0,
        emas,
    }
}

struct Harness {
    engine: Arc<StrategyEngine>,
    broker: Arc<SimulatedBroker>,
    store: Arc<MemoryStore>,
}

fn create_test_harness(config: StrategyConfig) -> Harness {
    let (publisher, events) = event_channel(256);
    let broker = Arc::new(SimulatedBroker::new(publisher));
    let store = Arc::new(MemoryStore::new());
    let engine = StrategyEngine::new(
        config,
        broker.clone(),
        Arc::new(ladderbot::execution::PriceCache::new()),
        store.clone(),
        store.clone(),
    );
    tokio::spawn(engine.clone().run_event_loop(events));
    Harness {
        engine,
        broker,
        store,
    }
}

async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn view(h: &Harness, symbol: &str) -> LadderView {
    h.engine.ladder(symbol).unwrap()
}

fn tier(view: &LadderView, tier: Tier) -> Trade {
    view.trades.iter().find(|t| t.tier == tier).cloned().unwrap()
}

fn broker_stop(h: &Harness, symbol: &str, t: Tier) -> Option<f64> {
    tier(&view(h, symbol), t)
        .linked_trigger_id
        .and_then(|id| h.broker.active_trigger(&id))
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {}, got {}",
        expected,
        actual
    );
}

#[tokio::test]
async fn test_full_ladder_lifecycle() {
    let h = create_test_harness(create_test_config(&["AAA"]));
    h.engine.candles().seed(create_seed_candle("AAA", 90.0));
    h.engine.start();

    // Interval [60, 120) closes at 100 above both EMAs
    assert!(h.engine.ingest(&PriceTick::new("AAA", 100.0, at(65))));
    let report = h.engine.run_scan_cycle(at(121)).await;
    assert_eq!(report.candles_closed, 1);
    assert_eq!(report.ranked, 1);
    assert_eq!(report.entries_opened, 1);

    let v = view(&h, "AAA");
    assert_eq!(v.state, LadderState::Tier1Open);
    let t1 = tier(&v, Tier::One);
    assert_eq!(t1.qty, 30);
    assert_close(t1.stop_loss, 97.5);
    assert_eq!(broker_stop(&h, "AAA", Tier::One), Some(t1.stop_loss));

    // +0.5% escalates to tier 2
    h.engine.ingest(&PriceTick::new("AAA", 100.5, at(130)));
    wait_for("tier 2", || {
        view(&h, "AAA")
            .trades
            .iter()
            .any(|t| t.tier == Tier::Two && t.status == TradeStatus::Open)
    })
    .await;
    let t2 = tier(&view(&h, "AAA"), Tier::Two);
    assert_eq!(t2.qty, 29);
    assert_close(t2.stop_loss, 97.9875);

    // Average of tier 1 (+2%) and tier 2 (+1.49%) clears 1%: tier 3
    h.engine.ingest(&PriceTick::new("AAA", 102.0, at(140)));
    wait_for("tier 3 and raised tier 2 stop", || {
        let v = view(&h, "AAA");
        v.state == LadderState::Tier3Open
            && v.trades.iter().all(|t| t.status == TradeStatus::Open)
            && broker_stop(&h, "AAA", Tier::Two).is_some_and(|s| (s - 99.45).abs() < 1e-6)
    })
    .await;
    let t3 = tier(&view(&h, "AAA"), Tier::Three);
    assert_close(t3.stop_loss, 96.9);
    assert_eq!(h.engine.capital().ledger.open_position_count, 3);

    // Dip through the tier 2 trailing stop only
    h.engine.ingest(&PriceTick::new("AAA", 99.0, at(150)));
    wait_for("tier 2 stopped", || {
        tier(&view(&h, "AAA"), Tier::Two).status == TradeStatus::Stopped
    })
    .await;
    let t2 = tier(&view(&h, "AAA"), Tier::Two);
    assert_eq!(t2.exit_reason, Some(ExitReason::TrailingStop));
    assert_close(t2.realized_pnl.unwrap(), -43.5);
    assert_eq!(tier(&view(&h, "AAA"), Tier::One).status, TradeStatus::Open);
    assert_eq!(h.engine.capital().ledger.open_position_count, 2);

    // Tier 1 target
    h.engine.ingest(&PriceTick::new("AAA", 106.0, at(160)));
    wait_for("tier 1 target and raised tier 3 stop", || {
        tier(&view(&h, "AAA"), Tier::One).status == TradeStatus::Closed
            && broker_stop(&h, "AAA", Tier::Three).is_some_and(|s| (s - 100.7).abs() < 1e-6)
    })
    .await;
    let t1 = tier(&view(&h, "AAA"), Tier::One);
    assert_eq!(t1.exit_reason, Some(ExitReason::Target));
    assert_close(t1.realized_pnl.unwrap(), 180.0);
    assert_eq!(view(&h, "AAA").state, LadderState::Tier3Open);

    // Tier 3 trailing stop ends the ladder
    h.engine.ingest(&PriceTick::new("AAA", 100.0, at(170)));
    wait_for("ladder empty", || view(&h, "AAA").state == LadderState::Empty).await;
    let t3 = tier(&view(&h, "AAA"), Tier::Three);
    assert_eq!(t3.status, TradeStatus::Stopped);
    assert_close(t3.realized_pnl.unwrap(), -58.0);

    let capital = h.engine.capital();
    assert_close(capital.ledger.deployed_capital, 0.0);
    assert_eq!(capital.ledger.open_position_count, 0);
    assert_eq!(h.broker.active_triggers(), 0);
    assert!(h.engine.quarantined().is_empty());

    let history = h.store.trade_history("AAA").await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|t| t.status.is_terminal()));
    assert!(h.store.load_live_trades().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stopped_engine_manages_but_does_not_open() {
    let h = create_test_harness(create_test_config(&["AAA", "BBB"]));
    h.engine.candles().seed(create_seed_candle("AAA", 90.0));
    h.engine.candles().seed(create_seed_candle("BBB", 45.0));
    h.engine.start();

    h.engine.ingest(&PriceTick::new("AAA", 100.0, at(65)));
    assert_eq!(h.engine.run_scan_cycle(at(121)).await.entries_opened, 1);

    h.engine.stop();

    // Escalation is still allowed for the open ladder
    h.engine.ingest(&PriceTick::new("AAA", 100.5, at(130)));
    wait_for("tier 2", || view(&h, "AAA").state == LadderState::Tier2Open).await;

    // A new candidate ranks but no ladder opens
    h.engine.ingest(&PriceTick::new("BBB", 50.0, at(135)));
    let report = h.engine.run_scan_cycle(at(181)).await;
    assert_eq!(report.ranked, 2);
    assert!(report.candidates >= 1);
    assert_eq!(report.entries_attempted, 0);
    assert!(h
        .engine
        .ladder("BBB")
        .map_or(true, |v| v.state == LadderState::Empty));
}

#[tokio::test]
async fn test_stale_price_blocks_entry() {
    let h = create_test_harness(StrategyConfig {
        stale_after_secs: 30,
        ..create_test_config(&["AAA"])
    });
    h.engine.candles().seed(create_seed_candle("AAA", 90.0));
    h.engine.start();

    // Last quote is 56s old when the scan runs
    h.engine.ingest(&PriceTick::new("AAA", 100.0, at(65)));
    let report = h.engine.run_scan_cycle(at(121)).await;

    assert_eq!(report.ranked, 1);
    assert_eq!(report.skipped_stale, 1);
    assert_eq!(report.entries_attempted, 0);
    assert!(h.engine.rank_table()[0].stale);
    assert!(h.engine.ladders().iter().all(|v| v.trades.is_empty()));
}

#[tokio::test]
async fn test_skipped_cycle_has_no_acceleration() {
    let h = create_test_harness(create_test_config(&["AAA"]));
    h.engine.candles().seed(create_seed_candle("AAA", 90.0));

    h.engine.ingest(&PriceTick::new("AAA", 100.0, at(65)));
    h.engine.run_scan_cycle(at(121)).await;
    let first = h.engine.rank_table()[0].clone();
    assert_eq!(first.acceleration, 0.0);

    // Interval [120, 180) has no ticks; the next candle is [180, 240)
    h.engine.ingest(&PriceTick::new("AAA", 101.0, at(185)));
    h.engine.run_scan_cycle(at(241)).await;
    let second = h.engine.rank_table()[0].clone();
    assert_eq!(second.cycle, first.cycle + 2);
    assert_eq!(second.rank_gm_previous, None);
    assert_eq!(second.acceleration, 0.0);
}

#[tokio::test]
async fn test_restart_recovers_open_ladder() {
    let config = create_test_config(&["AAA"]);
    let h = create_test_harness(config.clone());
    h.engine.candles().seed(create_seed_candle("AAA", 90.0));
    h.engine.start();
    h.engine.ingest(&PriceTick::new("AAA", 100.0, at(65)));
    h.engine.run_scan_cycle(at(121)).await;
    assert!(h.engine.shutdown(Duration::from_secs(1)).await);

    // Same store and venue, fresh engine
    let (publisher, events) = event_channel(64);
    let broker: Arc<dyn Broker> = Arc::new(SimulatedBroker::new(publisher));
    let restarted = StrategyEngine::new(
        config,
        broker,
        Arc::new(ladderbot::execution::PriceCache::new()),
        h.store.clone(),
        h.store.clone(),
    );
    tokio::spawn(restarted.clone().run_event_loop(events));

    let report = restarted.recover().await.unwrap();
    assert_eq!(report.ladders, 1);
    assert_eq!(report.candles_seeded, 1);
    assert_eq!(restarted.capital().ledger.open_position_count, 1);
    let v = restarted.ladder("AAA").unwrap();
    assert_eq!(v.state, LadderState::Tier1Open);
    assert_eq!(v.ladder_seq, 1);
}

#[tokio::test]
async fn test_tickless_interval_ranks_carried_price() {
    let h = create_test_harness(create_test_config(&["AAA"]));
    h.engine.candles().seed(create_seed_candle("AAA", 90.0));

    h.engine.ingest(&PriceTick::new("AAA", 100.0, at(65)));
    assert_eq!(h.engine.run_scan_cycle(at(121)).await.ranked, 1);
    let first = h.engine.rank_table()[0].clone();
    let ema_before = h.engine.candles().last_candle("AAA").unwrap().ema(20).unwrap();

    // Nothing trades in [120, 180)
    let report = h.engine.run_scan_cycle(at(181)).await;
    assert_eq!(report.candles_closed, 0);
    assert_eq!(report.candles_carried, 1);
    assert_eq!(report.ranked, 1);

    let carried = h.engine.candles().last_candle("AAA").unwrap();
    assert_eq!(carried.interval_start, at(120));
    assert_eq!(carried.close, 100.0);
    assert_eq!(carried.volume, 0.0);
    assert!(carried.ema(20).unwrap() > ema_before);
    let stored = h.store.latest_candle("AAA").await.unwrap().unwrap();
    assert_eq!(stored.interval_start, at(120));

    let second = h.engine.rank_table()[0].clone();
    assert_eq!(second.cycle, first.cycle + 1);
    assert!(second.stale);
    assert_eq!(second.rank_gm_previous, Some(first.rank_gm));
}

#[tokio::test]
async fn test_rank_threshold_gates_entry_then_ladder_escalates() {
    let h = create_test_harness(StrategyConfig {
        lot_size: 5,
        ..create_test_config(&["ETH"])
    });
    h.engine
        .candles()
        .seed(create_candle_with_emas("ETH", 3000.0, 3003.5, 2988.0));
    h.engine.start();

    // Closes at 3010: rank_final about 0.45, under the 2.5 filter
    h.engine.ingest(&PriceTick::new("ETH", 3010.0, at(65)));
    let report = h.engine.run_scan_cycle(at(121)).await;
    assert_eq!(report.candidates, 0);
    assert_eq!(report.entries_attempted, 0);
    let first = h.engine.rank_table()[0].clone();
    assert!((first.rank_final - 0.45).abs() < 0.01, "got {}", first.rank_final);
    assert!(!first.passes_filter);

    // Closes at 3085: about 3.45 once acceleration is added
    h.engine.ingest(&PriceTick::new("ETH", 3085.0, at(125)));
    let report = h.engine.run_scan_cycle(at(181)).await;
    let second = h.engine.rank_table()[0].clone();
    assert!((second.rank_final - 3.45).abs() < 0.01, "got {}", second.rank_final);
    assert!(second.acceleration > 0.0);
    assert_eq!(report.entries_opened, 1);

    // 3000 of capital buys less than a unit at 3085, so one lot
    let t1 = tier(&view(&h, "ETH"), Tier::One);
    assert_eq!(t1.qty, 5);
    assert_close(t1.entry_price, 3085.0);
    assert_close(t1.stop_loss, 3007.875);
    assert_close(t1.target.unwrap(), 3239.25);

    h.engine.ingest(&PriceTick::new("ETH", 3120.0, at(190)));
    wait_for("tier 2 with broker stop", || {
        view(&h, "ETH")
            .trades
            .iter()
            .any(|t| t.tier == Tier::Two && t.status == TradeStatus::Open)
            && broker_stop(&h, "ETH", Tier::Two).is_some()
    })
    .await;
    let v = view(&h, "ETH");
    assert_eq!(v.state, LadderState::Tier2Open);
    let t2 = tier(&v, Tier::Two);
    assert_eq!(t2.qty, 5);
    assert_close(t2.stop_loss, 3042.0);
    assert_eq!(broker_stop(&h, "ETH", Tier::Two), Some(t2.stop_loss));
}
