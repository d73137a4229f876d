use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::broker::{Broker, BrokerEvent, BrokerEventKind, OrderState};
use crate::config::{ConfigError, StrategyConfig};
use crate::execution::coordinator::{
    CoordinatorError, CoordinatorSettings, IntentKey, IntentKind, IntentRecord, MatchedEvent,
    OrderCoordinator, PlacementOutcome, QuarantinedEvent, StopUpdate,
};
use crate::execution::ladder::{LadderAction, LadderError, LadderParams};
use crate::execution::ladder_book::{LadderBook, LadderView, SymbolSlot};
use crate::execution::{CandleAggregator, Ladder, PriceCache};
use crate::models::{ExecutionMode, ExitReason, PriceTick, RankScore, Tier, Trade, TradeStatus};
use crate::persistence::{CandleStore, StoreError, TradeStore};
use crate::risk::{CapitalAllocator, CapitalLedger, CapitalLimits, CapitalRejection, Reservation};
use crate::strategy::{RankingEngine, RankingParams};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ladder(#[from] LadderError),

    #[error(transparent)]
    Capital(#[from] CapitalRejection),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("cannot switch to {requested} mode with {active} active ladders")]
    LaddersActive {
        requested: ExecutionMode,
        active: usize,
    },

    #[error("no ladder for {0}")]
    UnknownSymbol(String),

    #[error("no price for {0}")]
    NoPrice(String),

    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Summary of one scan cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub cycle: u64,
    pub candles_closed: usize,
    /// Tickless intervals closed at the last known price
    pub candles_carried: usize,
    pub ranked: usize,
    pub rank_errors: usize,
    pub candidates: usize,
    pub skipped_stale: usize,
    pub entries_attempted: usize,
    pub entries_opened: usize,
    pub capital_exhausted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub ladders: usize,
    pub live_trades: usize,
    pub halted: Vec<String>,
    pub candles_seeded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapitalView {
    pub limits: CapitalLimits,
    pub ledger: CapitalLedger,
    pub available: f64,
}

/// Capital and ladder slot claimed for an entry that has not been sent yet
struct EntryClaim {
    trade: Trade,
    reservation: Reservation,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Momentum ladder decision engine
///
/// Ticks flow through [`StrategyEngine::ingest`] into the price cache, the
/// candle aggregator and every open ladder. The scan cycle ranks the closed
/// candles and opens tier-1 positions in rank order. Broker events come back
/// through [`StrategyEngine::apply_event`]. Every operation on one symbol
/// runs under that symbol's gate, so broker calls for a ladder never overlap.
pub struct StrategyEngine {
    config: RwLock<StrategyConfig>,
    pending_config: Mutex<Option<StrategyConfig>>,
    ladder_params: RwLock<LadderParams>,
    prices: Arc<PriceCache>,
    candles: CandleAggregator,
    ranking: RankingEngine,
    capital: CapitalAllocator,
    ladders: LadderBook,
    coordinator: OrderCoordinator,
    trades: Arc<dyn TradeStore>,
    candle_store: Arc<dyn CandleStore>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl StrategyEngine {
    pub fn new(
        config: StrategyConfig,
        broker: Arc<dyn Broker>,
        prices: Arc<PriceCache>,
        trades: Arc<dyn TradeStore>,
        candle_store: Arc<dyn CandleStore>,
    ) -> Arc<Self> {
        let candles = CandleAggregator::new(
            config.scan_interval(),
            vec![config.ema_short_period, config.ema_long_period],
            config.max_candles,
        );

        Arc::new(Self {
            ladder_params: RwLock::new(LadderParams::from_config(&config)),
            ranking: RankingEngine::new(RankingParams::from_config(&config)),
            capital: CapitalAllocator::new(CapitalLimits::from_config(&config)),
            coordinator: OrderCoordinator::new(broker, CoordinatorSettings::from_config(&config)),
            pending_config: Mutex::new(None),
            config: RwLock::new(config),
            prices,
            candles,
            ladders: LadderBook::new(),
            trades,
            candle_store,
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Allow new tier-1 entries
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(mode = %self.mode(), "Strategy started");
    }

    /// Stop opening new ladders. Open ladders keep being managed.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Strategy stopped, open ladders remain managed");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop, refuse new work and wait for in-flight broker operations
    ///
    /// Returns false when operations were still running after `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.stop();
        self.shutting_down.store(true, Ordering::SeqCst);

        let drained = tokio::time::timeout(grace, self.in_flight.wait_idle())
            .await
            .is_ok();
        if drained {
            tracing::info!("All in-flight operations finished");
        } else {
            tracing::warn!(
                remaining = self.in_flight.count.load(Ordering::SeqCst),
                "Shutdown grace period elapsed with operations in flight"
            );
        }
        drained
    }

    pub fn mode(&self) -> ExecutionMode {
        self.coordinator.mode()
    }

    /// Broker adapter orders currently go to
    pub fn broker(&self) -> Arc<dyn Broker> {
        self.coordinator.broker()
    }

    /// Replace the broker adapter. Only allowed with no active ladder.
    ///
    /// The new adapter must publish into the same event channel as the old one.
    pub fn switch_mode(&self, broker: Arc<dyn Broker>) -> Result<(), EngineError> {
        let requested = broker.mode();
        let active = self.ladders.active_symbols().len();
        if active > 0 {
            return Err(EngineError::LaddersActive { requested, active });
        }

        let previous = self.mode();
        self.coordinator.swap_broker(broker);
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .mode = requested;
        tracing::info!(from = %previous, to = %requested, "Execution mode switched");
        Ok(())
    }

    pub fn config(&self) -> StrategyConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and stage a new configuration for the next scan cycle
    pub fn request_config(&self, config: StrategyConfig) -> Result<(), EngineError> {
        config.validate()?;
        *self
            .pending_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(config);
        tracing::info!("Configuration staged for the next scan cycle");
        Ok(())
    }

    fn apply_pending_config(&self) {
        let staged = self
            .pending_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut next) = staged else {
            return;
        };

        if let Err(e) = self.capital.set_limits(CapitalLimits::from_config(&next)) {
            tracing::error!("Staged configuration discarded: {}", e);
            return;
        }

        let current = self.config();
        if next.scan_interval_secs != current.scan_interval_secs
            || next.ema_short_period != current.ema_short_period
            || next.ema_long_period != current.ema_long_period
            || next.max_candles != current.max_candles
        {
            tracing::warn!("Candle interval and EMA periods only change on restart; keeping current values");
            next.scan_interval_secs = current.scan_interval_secs;
            next.ema_short_period = current.ema_short_period;
            next.ema_long_period = current.ema_long_period;
            next.max_candles = current.max_candles;
        }
        // The broker adapter decides the mode
        next.mode = current.mode;

        self.ranking.set_params(RankingParams::from_config(&next));
        *self
            .ladder_params
            .write()
            .unwrap_or_else(PoisonError::into_inner) = LadderParams::from_config(&next);
        self.coordinator
            .set_settings(CoordinatorSettings::from_config(&next));
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = next;

        tracing::info!("Applied staged configuration");
    }

    fn ladder_params(&self) -> LadderParams {
        *self
            .ladder_params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_tracked<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.in_flight.enter();
        tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        });
    }

    async fn persist(&self, trade: &Trade) {
        if let Err(e) = self.trades.save_trade(trade).await {
            tracing::error!(symbol = %trade.symbol, tier = %trade.tier, "Failed to persist trade: {}", e);
        }
    }

    /// Hand capital back. An underflow means the books disagree, so the
    /// symbol's ladder is halted until reset.
    fn release(&self, slot: &SymbolSlot, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        if let Err(e) = self.capital.release(Reservation { amount }) {
            slot.lock()
                .halt(format!("capital release of {:.2} failed: {}", amount, e));
        }
    }

    // ========================================================================
    // Price path
    // ========================================================================

    /// Apply one price tick
    ///
    /// Returns false when the tick was invalid or older than the cached price.
    pub fn ingest(self: &Arc<Self>, tick: &PriceTick) -> bool {
        if !self.prices.update(&tick.symbol, tick.price, tick.timestamp) {
            return false;
        }

        if let Some(candle) = self.candles.on_price(&tick.symbol, tick.price, tick.timestamp) {
            tracing::debug!(symbol = %candle.symbol, close = candle.close, "Candle closed by tick");
        }

        self.coordinator
            .broker()
            .on_market_price(&tick.symbol, tick.price, tick.timestamp);

        self.on_price(&tick.symbol, tick.price);
        true
    }

    fn on_price(self: &Arc<Self>, symbol: &str, price: f64) {
        let Some(slot) = self.ladders.get(symbol) else {
            return;
        };
        let params = self.ladder_params();
        let actions = slot.lock().on_price(price, &params);
        if actions.is_empty() {
            return;
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!(symbol, actions = actions.len(), "Shutting down, ladder actions not executed");
            return;
        }

        for action in actions {
            match action {
                LadderAction::AdjustStop { tier, stop_loss } => {
                    tracing::debug!(symbol, tier = %tier, stop_loss, "Trailing stop raised");
                    let engine = self.clone();
                    let slot = slot.clone();
                    self.spawn_tracked(async move { engine.sync_stop(&slot, tier).await });
                }
                LadderAction::OpenTier { tier, price } => {
                    match self.claim_entry(&slot, tier, price) {
                        Ok(claim) => {
                            let engine = self.clone();
                            let slot = slot.clone();
                            self.spawn_tracked(async move {
                                engine.execute_entry(slot, claim).await;
                            });
                        }
                        Err(e) => slot
                            .lock()
                            .pause_escalation(format!("{} not opened: {}", tier, e)),
                    }
                }
                LadderAction::Exit {
                    tier,
                    reason,
                    price,
                } => {
                    let claimed = slot.lock().begin_exit(tier, reason);
                    match claimed {
                        Ok(_) => {
                            let engine = self.clone();
                            let slot = slot.clone();
                            self.spawn_tracked(async move {
                                engine.execute_exit(slot, tier, price).await;
                            });
                        }
                        Err(e) => tracing::debug!(symbol, "Exit not started: {}", e),
                    }
                }
            }
        }
    }

    /// Reserve capital and register the pending tier in one step
    fn claim_entry(
        &self,
        slot: &SymbolSlot,
        tier: Tier,
        price: f64,
    ) -> Result<EntryClaim, EngineError> {
        let params = self.ladder_params();
        let reservation = self.capital.reserve(params.per_position_capital)?;

        let begun = slot.lock().begin_entry(
            tier,
            price,
            reservation.amount,
            self.mode(),
            Utc::now(),
            &params,
        );
        match begun {
            Ok(trade) => Ok(EntryClaim { trade, reservation }),
            Err(e) => {
                self.release(slot, reservation.amount);
                Err(e.into())
            }
        }
    }

    /// Send a claimed entry. Returns true when the tier ended up open.
    async fn execute_entry(self: Arc<Self>, slot: Arc<SymbolSlot>, claim: EntryClaim) -> bool {
        let _gate = slot.gate().await;
        let EntryClaim { trade, reservation } = claim;
        let tier = trade.tier;
        self.persist(&trade).await;

        let key = IntentKey::for_trade(&trade, IntentKind::Entry);
        let outcome = self.coordinator.submit_entry(&trade).await;

        match outcome {
            PlacementOutcome::Filled {
                order_id,
                fill_price,
                filled_qty,
            } => match self
                .complete_entry(&slot, tier, fill_price, filled_qty, Some(order_id))
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(%key, "Filled entry could not be applied: {}", e);
                    false
                }
            },
            PlacementOutcome::Accepted { order_id } => {
                let updated = {
                    let mut ladder = slot.lock();
                    ladder
                        .set_entry_order(tier, order_id)
                        .ok()
                        .and_then(|_| ladder.trade(tier).cloned())
                };
                if let Some(trade) = updated {
                    self.persist(&trade).await;
                }
                tracing::info!(%key, "Entry accepted, waiting for fill");
                false
            }
            PlacementOutcome::Rejected { reason } => {
                tracing::warn!(%key, %reason, "Entry rejected");
                let aborted = {
                    let mut ladder = slot.lock();
                    if tier != Tier::One {
                        ladder.pause_escalation(format!("{} entry rejected: {}", tier, reason));
                    }
                    ladder.abort_entry(tier)
                };
                if let Err(e) = aborted {
                    tracing::error!(%key, "Could not remove rejected entry: {}", e);
                }
                self.release(&slot, reservation.amount);
                if let Err(e) = self.trades.delete_trade(trade.id).await {
                    tracing::error!(%key, "Failed to delete rejected trade: {}", e);
                }
                false
            }
            PlacementOutcome::Unconfirmed { attempts } => {
                tracing::error!(%key, attempts, "Entry outcome unknown, marking UNCONFIRMED");
                let marked = {
                    let mut ladder = slot.lock();
                    ladder
                        .mark_unconfirmed(tier)
                        .and_then(|_| ladder.set_reserved_capital(tier, 0.0))
                        .map(|_| ladder.trade(tier).cloned())
                };
                self.release(&slot, reservation.amount);
                match marked {
                    Ok(Some(trade)) => self.persist(&trade).await,
                    Ok(None) => {}
                    Err(e) => tracing::error!(%key, "Could not mark entry unconfirmed: {}", e),
                }
                false
            }
        }
    }

    /// Open the tier at its fill and put its stop at the broker. Caller holds the gate.
    async fn complete_entry(
        &self,
        slot: &SymbolSlot,
        tier: Tier,
        fill_price: f64,
        filled_qty: u64,
        order_id: Option<String>,
    ) -> Result<(), EngineError> {
        let params = self.ladder_params();
        let trade = slot
            .lock()
            .confirm_entry(tier, fill_price, filled_qty, order_id, Utc::now(), &params)?;
        self.persist(&trade).await;

        match self.coordinator.place_stop(&trade).await {
            Ok(trigger_id) => {
                let linked = {
                    let mut ladder = slot.lock();
                    ladder
                        .link_trigger(tier, Some(trigger_id))
                        .map(|_| ladder.trade(tier).cloned())
                };
                if let Ok(Some(trade)) = linked {
                    self.persist(&trade).await;
                }
                // Price may have moved on while the trigger was being placed
                self.push_stop(slot, tier).await;
            }
            Err(e) => {
                tracing::warn!(
                    symbol = %trade.symbol,
                    tier = %tier,
                    "Stop trigger not placed, monitoring stop locally: {}",
                    e
                );
            }
        }
        Ok(())
    }

    /// Persist a raised stop, then carry it to the broker trigger
    async fn sync_stop(&self, slot: &SymbolSlot, tier: Tier) {
        let _gate = slot.gate().await;
        let raised = slot.lock().trade(tier).filter(|t| t.is_live()).cloned();
        if let Some(trade) = raised {
            self.persist(&trade).await;
        }
        self.push_stop(slot, tier).await;
    }

    /// Bring the broker trigger up to the ladder's stop. Caller holds the gate.
    async fn push_stop(&self, slot: &SymbolSlot, tier: Tier) {
        let target = {
            let ladder = slot.lock();
            ladder
                .trade(tier)
                .filter(|t| t.status == TradeStatus::Open)
                .and_then(|t| {
                    t.linked_trigger_id
                        .clone()
                        .map(|id| (id, t.stop_loss, t.clone()))
                })
        };
        let Some((trigger_id, stop_loss, trade)) = target else {
            return;
        };

        match self.coordinator.adjust_stop(&trigger_id, stop_loss).await {
            Ok(StopUpdate::Modified { stop_price }) => {
                tracing::debug!(symbol = %trade.symbol, tier = %tier, stop_price, "Broker stop raised");
            }
            Ok(StopUpdate::Throttled) => {}
            Err(CoordinatorError::StopNotRaised { .. }) => {}
            Err(e) => {
                tracing::warn!(
                    symbol = %trade.symbol,
                    tier = %tier,
                    "Stop adjustment failed, retried on the next raise: {}",
                    e
                );
            }
        }
    }

    /// Exit a tier already marked CLOSING
    async fn execute_exit(&self, slot: Arc<SymbolSlot>, tier: Tier, price: f64) {
        let _gate = slot.gate().await;

        // A trigger event may have closed the tier while we waited
        let current = {
            let ladder = slot.lock();
            ladder
                .trade(tier)
                .filter(|t| t.status == TradeStatus::Closing)
                .cloned()
        };
        let Some(trade) = current else {
            return;
        };
        let reason = trade.exit_reason.unwrap_or(ExitReason::Manual);

        if let Some(trigger_id) = &trade.linked_trigger_id {
            match self.coordinator.cancel_stop(trigger_id).await {
                Ok(()) => {
                    let unlinked = slot.lock().link_trigger(tier, None);
                    if let Err(e) = unlinked {
                        tracing::error!(symbol = %trade.symbol, "Could not unlink trigger: {}", e);
                    }
                }
                Err(e) => {
                    // Possibly fired already; its event settles the tier
                    tracing::warn!(
                        symbol = %trade.symbol,
                        tier = %tier,
                        "Trigger cancel failed, exit aborted: {}",
                        e
                    );
                    let aborted = slot.lock().abort_exit(tier);
                    if let Err(e) = aborted {
                        tracing::error!(symbol = %trade.symbol, "Could not reopen tier: {}", e);
                    }
                    return;
                }
            }
        }

        let key = IntentKey::for_trade(&trade, IntentKind::Exit);
        let outcome = self.coordinator.submit_exit(&trade, price).await;

        match outcome {
            PlacementOutcome::Filled { fill_price, .. } => {
                if let Err(e) = self.finish_exit(&slot, tier, fill_price, reason).await {
                    tracing::error!(%key, "Filled exit could not be applied: {}", e);
                }
            }
            PlacementOutcome::Accepted { .. } => {
                tracing::info!(%key, "Exit accepted, waiting for fill");
                let pending = slot.lock().trade(tier).cloned();
                if let Some(trade) = pending {
                    self.persist(&trade).await;
                }
            }
            PlacementOutcome::Rejected { reason } => {
                tracing::warn!(%key, %reason, "Exit rejected, tier stays open under local stop monitoring");
                let reopened = {
                    let mut ladder = slot.lock();
                    ladder
                        .abort_exit(tier)
                        .map(|_| ladder.trade(tier).cloned())
                };
                match reopened {
                    Ok(Some(trade)) => self.persist(&trade).await,
                    Ok(None) => {}
                    Err(e) => tracing::error!(%key, "Could not reopen tier: {}", e),
                }
            }
            PlacementOutcome::Unconfirmed { attempts } => {
                tracing::error!(%key, attempts, "Exit outcome unknown, marking UNCONFIRMED");
                let marked = slot.lock().mark_unconfirmed(tier);
                match marked {
                    Ok(trade) => self.persist(&trade).await,
                    Err(e) => tracing::error!(%key, "Could not mark exit unconfirmed: {}", e),
                }
            }
        }
    }

    /// Close the tier and hand its capital back. Caller holds the gate.
    async fn finish_exit(
        &self,
        slot: &SymbolSlot,
        tier: Tier,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<Trade, EngineError> {
        let closed = {
            let mut ladder = slot.lock();
            let closed = ladder.close_tier(tier, exit_price, reason, Utc::now())?;
            if closed.reserved_capital > 0.0 {
                ladder.set_reserved_capital(tier, 0.0)?;
            }
            closed
        };
        self.release(slot, closed.reserved_capital);

        let mut stored = closed.clone();
        stored.reserved_capital = 0.0;
        self.persist(&stored).await;
        Ok(closed)
    }

    // ========================================================================
    // Scan cycle
    // ========================================================================

    /// Close the finished interval, rank it and open new ladders
    pub async fn run_scan_cycle(self: &Arc<Self>, now: DateTime<Utc>) -> ScanReport {
        self.apply_pending_config();
        self.start_cycle_bookkeeping();

        let closed = self.candles.close_due(now);
        for candle in &closed {
            if let Err(e) = self.candle_store.save_candle(candle).await {
                tracing::warn!(symbol = %candle.symbol, "Failed to persist candle: {}", e);
            }
        }

        let cycle = self.candles.cycle_of(now).saturating_sub(1);
        let cycle_start = self.candles.bucket_start(now) - self.candles.interval();
        let stale_after = self.config().stale_after();

        let mut report = ScanReport {
            cycle,
            candles_closed: closed.len(),
            ..Default::default()
        };

        let mut symbols: BTreeSet<String> = self.candles.symbols().into_iter().collect();
        symbols.extend(self.prices.symbols());

        for symbol in symbols {
            let fresh = self
                .candles
                .last_candle(&symbol)
                .filter(|c| c.interval_start == cycle_start);
            let (candle, carried) = match fresh {
                Some(candle) => (candle, false),
                None => {
                    // No ticks this interval: rank on the last known price, flagged stale
                    let Some(price) = self.prices.get(&symbol) else {
                        continue;
                    };
                    let Some(candle) = self.candles.carry_forward(&symbol, cycle_start, price) else {
                        continue;
                    };
                    tracing::debug!(%symbol, price, "No ticks in interval, carried last price forward");
                    if let Err(e) = self.candle_store.save_candle(&candle).await {
                        tracing::warn!(%symbol, "Failed to persist candle: {}", e);
                    }
                    report.candles_carried += 1;
                    (candle, true)
                }
            };
            let stale = carried
                || self
                    .prices
                    .quote(&symbol, now, stale_after)
                    .map_or(true, |q| q.stale);
            match self.ranking.evaluate_candle(&candle, cycle, stale, now) {
                Ok(_) => report.ranked += 1,
                Err(e) => {
                    report.rank_errors += 1;
                    tracing::warn!(%symbol, "Ranking failed: {}", e);
                }
            }
        }

        let candidates = self.ranking.candidates(cycle);
        report.candidates = candidates.len();
        if self.is_running() && !self.shutting_down.load(Ordering::SeqCst) {
            self.run_entry_pass(candidates, &mut report).await;
        }

        tracing::info!(
            cycle,
            candles = report.candles_closed,
            carried = report.candles_carried,
            ranked = report.ranked,
            candidates = report.candidates,
            opened = report.entries_opened,
            "Scan cycle complete"
        );
        report
    }

    /// Lift last cycle's escalation pauses and drop finished ladders' intents
    fn start_cycle_bookkeeping(&self) {
        for (symbol, slot) in self.ladders.slots() {
            let finished = {
                let mut ladder = slot.lock();
                ladder.resume_escalation();
                ladder.is_empty().then(|| ladder.seq())
            };
            if let Some(seq) = finished.filter(|&seq| seq > 0) {
                self.coordinator.retire_ladder(&symbol, seq);
            }
        }
        let pruned = self.coordinator.prune_retired();
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped intents of finished ladders");
        }
    }

    /// Claim tier-1 entries in rank order until capital runs out
    async fn run_entry_pass(self: &Arc<Self>, candidates: Vec<RankScore>, report: &mut ScanReport) {
        let mut entries = JoinSet::new();
        for score in candidates {
            if score.stale {
                report.skipped_stale += 1;
                tracing::debug!(symbol = %score.symbol, "Skipping candidate with stale price");
                continue;
            }
            let Some(price) = self.prices.get(&score.symbol) else {
                continue;
            };

            let slot = self.ladders.slot(&score.symbol);
            let available = {
                let ladder = slot.lock();
                ladder.is_empty() && ladder.halted().is_none()
            };
            if !available {
                continue;
            }

            match self.claim_entry(&slot, Tier::One, price) {
                Ok(claim) => {
                    report.entries_attempted += 1;
                    tracing::info!(
                        symbol = %score.symbol,
                        rank_final = score.rank_final,
                        price,
                        "Opening ladder"
                    );
                    let engine = self.clone();
                    let guard = self.in_flight.enter();
                    entries.spawn(async move {
                        let _guard = guard;
                        engine.execute_entry(slot, claim).await
                    });
                }
                Err(EngineError::Capital(rejection)) => {
                    report.capital_exhausted = true;
                    tracing::info!(symbol = %score.symbol, "Entry pass ended: {}", rejection);
                    break;
                }
                Err(e) => tracing::warn!(symbol = %score.symbol, "Entry skipped: {}", e),
            }
        }

        while let Some(joined) = entries.join_next().await {
            match joined {
                Ok(true) => report.entries_opened += 1,
                Ok(false) => {}
                Err(e) => tracing::error!("Entry task failed: {}", e),
            }
        }
    }

    // ========================================================================
    // Broker events
    // ========================================================================

    /// Consume broker events until the channel closes
    pub async fn run_event_loop(self: Arc<Self>, mut events: mpsc::Receiver<BrokerEvent>) {
        while let Some(event) = events.recv().await {
            self.apply_event(event).await;
        }
        tracing::info!("Broker event channel closed");
    }

    /// Apply ticks until the channel closes
    pub async fn run_tick_loop(self: Arc<Self>, mut ticks: mpsc::Receiver<PriceTick>) {
        while let Some(tick) = ticks.recv().await {
            self.ingest(&tick);
        }
        tracing::info!("Tick channel closed");
    }

    /// Match a broker event to its trade and apply it
    pub async fn apply_event(&self, event: BrokerEvent) {
        let Some(matched) = self.coordinator.reconcile(event) else {
            return;
        };

        let Some(slot) = self.ladders.get(&matched.key.symbol) else {
            self.coordinator
                .quarantine(matched.event, format!("no ladder for {}", matched.key.symbol));
            return;
        };

        let _gate = slot.gate().await;
        if let Err(reason) = self.apply_matched(&slot, &matched).await {
            self.coordinator.quarantine(matched.event, reason);
        }
    }

    async fn apply_matched(&self, slot: &SymbolSlot, matched: &MatchedEvent) -> Result<(), String> {
        let key = &matched.key;
        let event = &matched.event;
        let tier = key.tier;

        let trade = {
            let ladder = slot.lock();
            ladder.trade(tier).cloned()
        };
        let Some(trade) = trade else {
            return Err(format!("{} has no {} trade", key.symbol, tier));
        };
        if trade.id != matched.trade_id {
            return Err(format!("{} belongs to an earlier ladder", key));
        }

        match (key.kind, &event.kind) {
            (IntentKind::Entry, BrokerEventKind::OrderFilled) => {
                let fill_price = event.price.unwrap_or(trade.entry_price);
                match trade.status {
                    TradeStatus::Pending => {}
                    TradeStatus::Unconfirmed if trade.reserved_capital <= 0.0 => {
                        let amount = self.ladder_params().per_position_capital;
                        match self.capital.reserve(amount) {
                            Ok(reservation) => {
                                let reserved = slot.lock().set_reserved_capital(tier, reservation.amount);
                                if let Err(e) = reserved {
                                    self.release(slot, reservation.amount);
                                    return Err(e.to_string());
                                }
                            }
                            Err(rejection) => {
                                let reason = format!("late fill for {} without capital: {}", key, rejection);
                                tracing::error!("{}", reason);
                                slot.lock().halt(reason.clone());
                                return Err(reason);
                            }
                        }
                    }
                    TradeStatus::Unconfirmed => {}
                    status => return Err(format!("entry fill for a {} trade", status.as_str())),
                }
                let order_id = Some(event.broker_id.clone()).filter(|id| !id.is_empty());
                self.complete_entry(slot, tier, fill_price, event.qty, order_id)
                    .await
                    .map_err(|e| e.to_string())
            }
            (IntentKind::Entry, BrokerEventKind::OrderRejected { reason }) => {
                if !matches!(trade.status, TradeStatus::Pending | TradeStatus::Unconfirmed) {
                    return Err(format!("entry rejection for a {} trade", trade.status.as_str()));
                }
                tracing::warn!(%key, %reason, "Entry rejected by broker");
                let removed = {
                    let mut ladder = slot.lock();
                    if tier != Tier::One {
                        ladder.pause_escalation(format!("{} entry rejected: {}", tier, reason));
                    }
                    ladder.abort_entry(tier).map_err(|e| e.to_string())?
                };
                self.release(slot, removed.reserved_capital);
                if let Err(e) = self.trades.delete_trade(removed.id).await {
                    tracing::error!(%key, "Failed to delete rejected trade: {}", e);
                }
                Ok(())
            }
            (IntentKind::Exit, BrokerEventKind::OrderFilled) => {
                if !matches!(trade.status, TradeStatus::Closing | TradeStatus::Unconfirmed) {
                    return Err(format!("exit fill for a {} trade", trade.status.as_str()));
                }
                let exit_price = event.price.unwrap_or(trade.entry_price);
                let reason = trade.exit_reason.unwrap_or(ExitReason::Manual);
                self.finish_exit(slot, tier, exit_price, reason)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            (IntentKind::Exit, BrokerEventKind::OrderRejected { reason }) => {
                tracing::warn!(%key, %reason, "Exit rejected by broker, tier stays open");
                let reopened = {
                    let mut ladder = slot.lock();
                    ladder
                        .abort_exit(tier)
                        .map(|_| ladder.trade(tier).cloned())
                        .map_err(|e| e.to_string())?
                };
                if let Some(trade) = reopened {
                    self.persist(&trade).await;
                }
                Ok(())
            }
            (IntentKind::Stop, BrokerEventKind::TriggerFired) => {
                if !matches!(
                    trade.status,
                    TradeStatus::Open | TradeStatus::Closing | TradeStatus::Unconfirmed
                ) {
                    return Err(format!("trigger fired for a {} trade", trade.status.as_str()));
                }
                let exit_price = event.price.unwrap_or(trade.stop_loss);
                let reason = if tier == Tier::One {
                    ExitReason::StopLoss
                } else {
                    ExitReason::TrailingStop
                };
                let unlinked = slot.lock().link_trigger(tier, None);
                unlinked.map_err(|e| e.to_string())?;
                self.finish_exit(slot, tier, exit_price, reason)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            (kind, other) => Err(format!("{:?} event for a {} intent", other, kind.as_str())),
        }
    }

    /// Resolve UNCONFIRMED orders by asking the broker what happened
    ///
    /// Returns how many intents were settled.
    pub async fn sweep_unconfirmed(&self) -> usize {
        let mut settled = 0;
        for record in self.coordinator.unconfirmed() {
            if record.key.kind == IntentKind::Stop {
                continue;
            }

            let (kind, broker_id, price, qty) = match self.coordinator.status(&record.key).await {
                Ok(Some(ack)) => {
                    let kind = match ack.state {
                        OrderState::Filled => BrokerEventKind::OrderFilled,
                        OrderState::Rejected | OrderState::Cancelled => {
                            BrokerEventKind::OrderRejected {
                                reason: ack.reason.unwrap_or_else(|| "rejected".to_string()),
                            }
                        }
                        OrderState::Accepted => continue,
                    };
                    (kind, ack.order_id, ack.fill_price, ack.filled_qty)
                }
                // Never reached the broker
                Ok(None) => (
                    BrokerEventKind::OrderRejected {
                        reason: "unknown to broker".to_string(),
                    },
                    String::new(),
                    None,
                    0,
                ),
                Err(e) => {
                    tracing::debug!(key = %record.key, "Status still unknown: {}", e);
                    continue;
                }
            };

            tracing::info!(key = %record.key, ?kind, "Resolved unconfirmed order");
            self.apply_event(BrokerEvent {
                client_key: record.key.to_string(),
                broker_id,
                symbol: record.key.symbol.clone(),
                kind,
                price,
                qty,
                timestamp: Utc::now(),
            })
            .await;
            settled += 1;
        }
        settled
    }

    // ========================================================================
    // Operator actions
    // ========================================================================

    /// Exit one tier at the current market price
    pub async fn close_position(&self, symbol: &str, tier: Tier) -> Result<(), EngineError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let slot = self
            .ladders
            .get(symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))?;
        let price = self
            .prices
            .get(symbol)
            .ok_or_else(|| EngineError::NoPrice(symbol.to_string()))?;

        let claimed = slot.lock().begin_exit(tier, ExitReason::Manual);
        claimed?;
        tracing::info!(symbol, tier = %tier, price, "Manual close requested");

        let _guard = self.in_flight.enter();
        self.execute_exit(slot, tier, price).await;
        Ok(())
    }

    /// Clear a halted ladder with nothing live so it can trade again
    pub fn reset_symbol(&self, symbol: &str) -> Result<(), EngineError> {
        let slot = self
            .ladders
            .get(symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))?;
        let reset = slot.lock().reset();
        reset?;
        tracing::info!(symbol, "Ladder reset");
        Ok(())
    }

    pub fn resolve_quarantined(&self, id: Uuid) -> Option<QuarantinedEvent> {
        self.coordinator.resolve_quarantined(id)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Rebuild ladders, capital and EMA state from storage
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        for (symbol, seq) in self.trades.max_ladder_seqs().await? {
            self.ladders.note_seq(&symbol, seq);
        }

        let live = self.trades.load_live_trades().await?;
        let symbols: BTreeSet<String> = live.iter().map(|t| t.symbol.clone()).collect();

        let mut report = RecoveryReport {
            live_trades: live.len(),
            ..Default::default()
        };
        let mut deployed = 0.0;
        let mut positions = 0;

        for trade in &live {
            if trade.reserved_capital > 0.0 {
                deployed += trade.reserved_capital;
                positions += 1;
            }
            self.coordinator.restore_intent(trade);
        }

        for symbol in &symbols {
            let Some(seq) = live
                .iter()
                .filter(|t| &t.symbol == symbol)
                .map(|t| t.ladder_seq)
                .max()
            else {
                continue;
            };

            let trades = self.trades.load_ladder(symbol, seq).await?;
            let mut ladder = Ladder::from_trades(symbol.clone(), trades);
            let stray = live
                .iter()
                .filter(|t| &t.symbol == symbol && t.ladder_seq != seq)
                .count();
            if stray > 0 {
                ladder.halt(format!("{} live trades from earlier ladders", stray));
            }
            if let Some(reason) = ladder.halted() {
                tracing::error!(%symbol, %reason, "Recovered ladder halted");
                report.halted.push(symbol.clone());
            }

            self.ladders.insert(ladder);
            report.ladders += 1;
        }

        self.capital.restore(deployed, positions);

        let mut watched: BTreeSet<String> = self.config().symbols.into_iter().collect();
        watched.extend(symbols);
        for symbol in &watched {
            match self.candle_store.latest_candle(symbol).await {
                Ok(Some(candle)) => {
                    self.candles.seed(candle);
                    report.candles_seeded += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(%symbol, "Could not load candle history: {}", e),
            }
        }

        tracing::info!(
            ladders = report.ladders,
            live_trades = report.live_trades,
            halted = report.halted.len(),
            deployed,
            "Recovered state"
        );
        Ok(report)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn ladders(&self) -> Vec<LadderView> {
        self.ladders.views(|symbol| self.prices.get(symbol))
    }

    pub fn ladder(&self, symbol: &str) -> Option<LadderView> {
        self.ladders().into_iter().find(|v| v.symbol == symbol)
    }

    pub fn rank_table(&self) -> Vec<RankScore> {
        self.ranking.scores()
    }

    pub fn capital(&self) -> CapitalView {
        CapitalView {
            limits: self.capital.limits(),
            ledger: self.capital.snapshot(),
            available: self.capital.available(),
        }
    }

    pub fn quarantined(&self) -> Vec<QuarantinedEvent> {
        self.coordinator.quarantined()
    }

    pub fn unconfirmed(&self) -> Vec<IntentRecord> {
        self.coordinator.unconfirmed()
    }

    pub fn prices(&self) -> &PriceCache {
        &self.prices
    }

    pub fn candles(&self) -> &CandleAggregator {
        &self.candles
    }

    pub async fn trade_history(&self, symbol: &str) -> Result<Vec<Trade>, EngineError> {
        Ok(self.trades.trade_history(symbol).await?)
    }
}
