use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use ladderbot::api::RestQuoteClient;
use ladderbot::broker::{Broker, PaperBroker, RestBroker, SimulatedBroker};
use ladderbot::db::PostgresPersistence;
use ladderbot::execution::{event_channel, tick_channel, EventOutbox, PriceCache, PriceFeedManager};
use ladderbot::models::ExecutionMode;
use ladderbot::persistence::{CandleStore, MemoryStore, RedisPersistence, TradeStore};
use ladderbot::{StrategyConfig, StrategyEngine};
use std::sync::Arc;
use tokio::time::{interval, interval_at, Duration, Instant, MissedTickBehavior};

/// Delay after the interval boundary before the scan runs, so the last ticks land
const SCAN_OFFSET_SECS: u64 = 2;
const EVENT_POLL_MS: u64 = 500;
const UNCONFIRMED_SWEEP_SECS: u64 = 30;

#[derive(Debug, Parser)]
#[command(name = "ladderbot", about = "Momentum ladder trading engine")]
struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured execution mode (simulated, paper, live)
    #[arg(short, long)]
    mode: Option<ExecutionMode>,

    /// Override the watched symbols
    #[arg(short, long, value_delimiter = ',')]
    symbols: Option<Vec<String>>,

    /// Recover and manage open ladders without opening new ones
    #[arg(long)]
    paused: bool,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Next scan-interval boundary (epoch aligned), plus the scan offset
fn next_scan_boundary(interval_secs: u64) -> Instant {
    let interval_secs = interval_secs.max(1);
    let now = Utc::now().timestamp().max(0) as u64;
    let until_next = interval_secs - (now % interval_secs);
    Instant::now() + Duration::from_secs(until_next + SCAN_OFFSET_SECS)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut config = StrategyConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(symbols) = args.symbols {
        config.symbols = symbols;
    }
    config.validate().context("invalid configuration")?;

    tracing::info!("Ladderbot starting in {} mode", config.mode);
    tracing::info!("  Symbols: {}", config.symbols.join(", "));
    tracing::info!(
        "  Capital: {:.2} total, {:.2} per position, {} positions max",
        config.total_capital,
        config.per_position_capital,
        config.max_positions
    );
    tracing::info!("  Scan interval: {}s", config.scan_interval_secs);

    let (trade_store, candle_store) = connect_stores(&config).await;
    let prices = Arc::new(PriceCache::new());
    let (publisher, events_rx) = event_channel(config.event_channel_capacity);

    let broker: Arc<dyn Broker> = match config.mode {
        ExecutionMode::Simulated => Arc::new(SimulatedBroker::new(publisher.clone())),
        ExecutionMode::Paper => Arc::new(PaperBroker::new(
            prices.clone(),
            config.broker.paper_slippage_bps,
            publisher.clone(),
        )),
        ExecutionMode::Live => Arc::new(
            RestBroker::new(&config.broker, config.broker_timeout())
                .context("failed to create broker client")?,
        ),
    };

    let engine = StrategyEngine::new(
        config.clone(),
        broker,
        prices,
        trade_store,
        candle_store,
    );

    let recovery = engine.recover().await.context("state recovery failed")?;
    if !recovery.halted.is_empty() {
        tracing::warn!("Halted ladders need attention: {}", recovery.halted.join(", "));
    }

    if args.paused {
        tracing::info!("Started paused, no new ladders will open");
    } else {
        engine.start();
    }

    tracing::info!("Spawning loops...");

    // Loop 1: quote polling feeds the tick channel
    let (tick_tx, tick_rx) = tick_channel(config.tick_channel_capacity);
    let feed_task = {
        let source = Arc::new(RestQuoteClient::new(
            &config.broker.base_url,
            config.broker.api_key.clone(),
            config.broker.requests_per_second,
        ));
        let feed = PriceFeedManager::new(source, config.symbols.clone(), tick_tx);
        let poll_secs = config.quote_poll_secs;
        tokio::spawn(async move {
            quote_poll_loop(feed, poll_secs).await;
        })
    };

    // Loop 2: tick ingestion
    let tick_task = tokio::spawn(engine.clone().run_tick_loop(tick_rx));

    // Loop 3: broker event reconciliation
    let event_task = tokio::spawn(engine.clone().run_event_loop(events_rx));

    // Loop 4: clock-aligned scan cycle
    let scan_task = {
        let engine = engine.clone();
        let interval_secs = config.scan_interval_secs;
        tokio::spawn(async move {
            scan_loop(engine, interval_secs).await;
        })
    };

    // Loop 5: event delivery and unconfirmed sweeps
    let delivery_task = {
        let engine = engine.clone();
        let outbox = EventOutbox::new(publisher);
        tokio::spawn(async move {
            delivery_loop(engine, outbox).await;
        })
    };

    tracing::info!("All loops spawned, press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        result = feed_task => {
            tracing::error!("Quote loop exited: {:?}", result);
        }
        result = tick_task => {
            tracing::error!("Tick loop exited: {:?}", result);
        }
        result = event_task => {
            tracing::error!("Event loop exited: {:?}", result);
        }
        result = scan_task => {
            tracing::error!("Scan loop exited: {:?}", result);
        }
        result = delivery_task => {
            tracing::error!("Delivery loop exited: {:?}", result);
        }
    }

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    if !engine.shutdown(grace).await {
        tracing::warn!("Exiting with broker operations unresolved; they are recovered on restart");
    }

    for view in engine.ladders().iter().filter(|v| !v.trades.is_empty()) {
        tracing::info!(
            "  {} ladder #{} {:?}, unrealized {:.2}",
            view.symbol,
            view.ladder_seq,
            view.state,
            view.unrealized.as_ref().map_or(0.0, |p| p.total)
        );
    }

    tracing::info!("Ladderbot stopped");
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ladderbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_stores(config: &StrategyConfig) -> (Arc<dyn TradeStore>, Arc<dyn CandleStore>) {
    let memory = Arc::new(MemoryStore::new());

    let trades: Arc<dyn TradeStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => match PostgresPersistence::new(&url).await {
            Ok(postgres) => {
                tracing::info!("Postgres trade store enabled");
                Arc::new(postgres)
            }
            Err(e) => {
                tracing::warn!("Failed to connect to Postgres ({}), keeping trades in memory", e);
                memory.clone()
            }
        },
        Err(_) => {
            tracing::info!("DATABASE_URL not set, keeping trades in memory");
            memory.clone()
        }
    };

    let candles: Arc<dyn CandleStore> = match std::env::var("REDIS_URL") {
        Ok(url) => match RedisPersistence::new(&url, config.max_candles).await {
            Ok(redis) => Arc::new(redis),
            Err(e) => {
                tracing::warn!("Failed to connect to Redis ({}), keeping candles in memory", e);
                memory
            }
        },
        Err(_) => memory,
    };

    (trades, candles)
}

// ============================================================================
// Loops
// ============================================================================

async fn quote_poll_loop(feed: PriceFeedManager, poll_secs: u64) {
    let mut ticker = interval(Duration::from_secs(poll_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Err(e) = feed.poll_once().await {
            tracing::warn!("Quote poll failed: {}", e);
        }
    }
}

async fn scan_loop(engine: Arc<StrategyEngine>, interval_secs: u64) {
    let start = next_scan_boundary(interval_secs);
    tracing::info!(
        "First scan in {}s",
        start.saturating_duration_since(Instant::now()).as_secs()
    );

    let mut ticker = interval_at(start, Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let report = engine.run_scan_cycle(Utc::now()).await;
        if report.capital_exhausted {
            let capital = engine.capital();
            tracing::info!(
                "Capital exhausted: {:.2} deployed across {} positions",
                capital.ledger.deployed_capital,
                capital.ledger.open_position_count
            );
        }
    }
}

/// Delivers broker events through whichever adapter the engine currently holds,
/// so a mode switch takes effect on the next round
async fn delivery_loop(engine: Arc<StrategyEngine>, outbox: EventOutbox) {
    let mut ticker = interval(Duration::from_millis(EVENT_POLL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let sweep_every = (UNCONFIRMED_SWEEP_SECS * 1_000 / EVENT_POLL_MS).max(1);
    let mut rounds: u64 = 0;

    loop {
        ticker.tick().await;
        rounds += 1;

        // Simulated venues buffer their own events; the live venue is polled
        let broker = engine.broker();
        broker.flush_events();

        outbox.flush();
        match broker.poll_events().await {
            Ok(events) => {
                for event in events {
                    outbox.push(event);
                }
            }
            Err(e) => tracing::warn!("Broker event poll failed: {}", e),
        }
        if outbox.pending() > 0 {
            tracing::debug!(pending = outbox.pending(), "Events waiting for channel capacity");
        }

        if rounds % sweep_every == 0 && !engine.unconfirmed().is_empty() {
            let settled = engine.sweep_unconfirmed().await;
            if settled > 0 {
                tracing::info!("Resolved {} unconfirmed orders", settled);
            }
        }
    }
}
