use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::broker::{
    Broker, BrokerError, BrokerEvent, BrokerEventKind, OrderAck, OrderRef, OrderRequest,
    OrderState, TriggerRequest,
};
use crate::config::StrategyConfig;
use crate::models::{ExecutionMode, Side, Tier, Trade, TradeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IntentKind {
    Entry,
    Exit,
    Stop,
}

impl IntentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentKind::Entry => "ENTRY",
            IntentKind::Exit => "EXIT",
            IntentKind::Stop => "STOP",
        }
    }
}

/// Idempotency key of one order intent
///
/// The string form is sent to the broker as the client order id, so every
/// retry of the same intent lands on the same broker order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IntentKey {
    pub symbol: String,
    pub ladder_seq: u64,
    pub tier: Tier,
    pub kind: IntentKind,
}

impl IntentKey {
    pub fn new(symbol: impl Into<String>, ladder_seq: u64, tier: Tier, kind: IntentKind) -> Self {
        Self {
            symbol: symbol.into(),
            ladder_seq,
            tier,
            kind,
        }
    }

    pub fn for_trade(trade: &Trade, kind: IntentKind) -> Self {
        Self::new(trade.symbol.clone(), trade.ladder_seq, trade.tier, kind)
    }
}

impl fmt::Display for IntentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-L{}-T{}-{}",
            self.symbol,
            self.ladder_seq,
            self.tier.number(),
            self.kind.as_str()
        )
    }
}

impl FromStr for IntentKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Symbols may contain '-', so split from the right
        let mut parts = s.rsplitn(4, '-');
        let (kind, tier, seq, symbol) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(k), Some(t), Some(l), Some(sym)) if !sym.is_empty() => (k, t, l, sym),
            _ => return Err(format!("malformed intent key '{}'", s)),
        };

        let kind = match kind {
            "ENTRY" => IntentKind::Entry,
            "EXIT" => IntentKind::Exit,
            "STOP" => IntentKind::Stop,
            other => return Err(format!("unknown intent kind '{}'", other)),
        };
        let tier = tier
            .strip_prefix('T')
            .and_then(|n| n.parse::<u8>().ok())
            .and_then(Tier::from_number)
            .ok_or_else(|| format!("bad tier in '{}'", s))?;
        let ladder_seq = seq
            .strip_prefix('L')
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| format!("bad ladder sequence in '{}'", s))?;

        Ok(IntentKey::new(symbol, ladder_seq, tier, kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntentState {
    Submitted,
    Working,
    Filled,
    Rejected,
    Unconfirmed,
    /// Stop trigger live at the broker
    Active,
    Cancelled,
    Fired,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentRecord {
    pub key: IntentKey,
    pub trade_id: Uuid,
    pub broker_id: Option<String>,
    pub state: IntentState,
    /// Last stop price sent to the broker, for trigger intents
    pub stop_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Result of driving one order intent to a known broker state
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    Filled {
        order_id: String,
        fill_price: f64,
        filled_qty: u64,
    },
    /// Working at the broker, fill arrives as an event
    Accepted { order_id: String },
    Rejected { reason: String },
    /// Outcome unknown after every attempt
    Unconfirmed { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopUpdate {
    Modified { stop_price: f64 },
    /// Move smaller than the minimum delta; broker left unchanged
    Throttled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QuarantineReason {
    Unmatched,
    Duplicate,
    Inconsistent(String),
}

/// Event that could not be applied automatically
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedEvent {
    pub id: Uuid,
    pub event: BrokerEvent,
    pub reason: QuarantineReason,
    pub quarantined_at: DateTime<Utc>,
}

/// Event matched to the intent it belongs to
#[derive(Debug, Clone)]
pub struct MatchedEvent {
    pub key: IntentKey,
    pub trade_id: Uuid,
    pub event: BrokerEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("{operation} for {key} timed out")]
    Timeout { operation: &'static str, key: String },

    #[error("no trigger registered under {0}")]
    UnknownTrigger(String),

    #[error("stop for {key} would move down from {current} to {requested}")]
    StopNotRaised {
        key: String,
        current: f64,
        requested: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorSettings {
    pub timeout: Duration,
    pub status_max_retries: u32,
    pub placement_attempts: u32,
    pub retry_backoff: Duration,
    pub min_trigger_delta_pct: f64,
}

impl CoordinatorSettings {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            timeout: cfg.broker_timeout(),
            status_max_retries: cfg.status_max_retries,
            placement_attempts: cfg.placement_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            min_trigger_delta_pct: cfg.min_trigger_delta_pct,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    /// Client key -> record
    intents: HashMap<String, IntentRecord>,
    /// Broker trigger id -> client key
    triggers: HashMap<String, String>,
    /// Events already applied, by client key and kind
    processed: HashSet<String>,
    /// Outcomes learned from a synchronous answer; the matching event is a confirmation
    settled: HashSet<String>,
    quarantine: Vec<QuarantinedEvent>,
    /// Finished ladders (symbol, seq) -> prune round they were retired in
    retired: HashMap<(String, u64), u64>,
    prune_round: u64,
}

impl Registry {
    fn has_ladder(&self, symbol: &str, ladder_seq: u64) -> bool {
        self.intents
            .values()
            .any(|r| r.key.symbol == symbol && r.key.ladder_seq == ladder_seq)
    }
}

/// Ladder a registry key (`client_key` or `client_key:kind`) belongs to
fn ladder_of(key: &str) -> Option<(String, u64)> {
    let client_key = key.split(':').next()?;
    let key = client_key.parse::<IntentKey>().ok()?;
    Some((key.symbol, key.ladder_seq))
}

/// Owns every broker interaction
///
/// Tracks order intents by idempotency key, bounds each call with a timeout,
/// resolves ambiguous outcomes by status lookup and routes asynchronous
/// events back to the trade they belong to.
pub struct OrderCoordinator {
    broker: RwLock<Arc<dyn Broker>>,
    settings: RwLock<CoordinatorSettings>,
    registry: Mutex<Registry>,
}

impl OrderCoordinator {
    pub fn new(broker: Arc<dyn Broker>, settings: CoordinatorSettings) -> Self {
        Self {
            broker: RwLock::new(broker),
            settings: RwLock::new(settings),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn mode(&self) -> ExecutionMode {
        self.broker().mode()
    }

    /// Route future orders to a different venue
    pub fn swap_broker(&self, broker: Arc<dyn Broker>) {
        let mode = broker.mode();
        *self.broker.write().unwrap_or_else(PoisonError::into_inner) = broker;
        tracing::info!(%mode, "Broker switched");
    }

    pub fn settings(&self) -> CoordinatorSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_settings(&self, settings: CoordinatorSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upsert_intent(&self, key: &IntentKey, trade_id: Uuid, state: IntentState) {
        let mut registry = self.registry();
        let record = registry
            .intents
            .entry(key.to_string())
            .or_insert_with(|| IntentRecord {
                key: key.clone(),
                trade_id,
                broker_id: None,
                state,
                stop_price: None,
                updated_at: Utc::now(),
            });
        record.state = state;
        record.trade_id = trade_id;
        record.updated_at = Utc::now();
    }

    fn set_intent_state(&self, key: &str, state: IntentState, broker_id: Option<&str>) {
        let mut registry = self.registry();
        if let Some(record) = registry.intents.get_mut(key) {
            record.state = state;
            if let Some(id) = broker_id {
                record.broker_id = Some(id.to_string());
            }
            record.updated_at = Utc::now();
        }
    }

    pub fn intent(&self, key: &IntentKey) -> Option<IntentRecord> {
        self.registry().intents.get(&key.to_string()).cloned()
    }

    /// Exponential backoff with up to 50% random jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings().retry_backoff;
        let exp = base.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_ms = (exp.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        exp + Duration::from_millis(jitter)
    }

    /// Buy order opening `trade`, keyed by its entry intent
    pub async fn submit_entry(&self, trade: &Trade) -> PlacementOutcome {
        let key = IntentKey::for_trade(trade, IntentKind::Entry);
        self.submit_order(&key, trade.id, Side::Buy, trade.qty, trade.entry_price)
            .await
    }

    /// Sell order closing `trade` at about `price`, keyed by its exit intent
    pub async fn submit_exit(&self, trade: &Trade, price: f64) -> PlacementOutcome {
        let key = IntentKey::for_trade(trade, IntentKind::Exit);
        self.submit_order(&key, trade.id, Side::Sell, trade.qty, price)
            .await
    }

    /// Drive a market order to a known outcome
    ///
    /// An ambiguous placement (timeout or transient failure) is resolved by
    /// looking the order up under its client key. Only when the broker has no
    /// record of it is the order submitted again, under the same key.
    pub async fn submit_order(
        &self,
        key: &IntentKey,
        trade_id: Uuid,
        side: Side,
        qty: u64,
        price: f64,
    ) -> PlacementOutcome {
        let client_key = key.to_string();

        let previous = self.registry().intents.get(&client_key).map(|r| r.state);
        if let Some(state @ (IntentState::Filled | IntentState::Rejected)) = previous {
            tracing::warn!(%client_key, ?state, "Order intent already settled, resubmitting under the same key");
        }
        self.upsert_intent(key, trade_id, IntentState::Submitted);

        let settings = self.settings();
        let request = OrderRequest {
            client_key: client_key.clone(),
            symbol: key.symbol.clone(),
            side,
            qty,
            price,
        };

        for attempt in 1..=settings.placement_attempts {
            let broker = self.broker();
            let placed = timeout(settings.timeout, broker.place_order(request.clone())).await;

            let uncertain = match placed {
                Ok(Ok(ack)) => return self.settle(&client_key, ack),
                Ok(Err(BrokerError::Rejected(reason))) | Ok(Err(BrokerError::NotFound(reason))) => {
                    tracing::warn!(%client_key, %reason, "Order rejected");
                    self.set_intent_state(&client_key, IntentState::Rejected, None);
                    return PlacementOutcome::Rejected { reason };
                }
                Ok(Err(e)) => e,
                Err(_) => BrokerError::Timeout {
                    operation: "place_order",
                },
            };

            tracing::warn!(
                %client_key,
                attempt,
                attempts = settings.placement_attempts,
                error = %uncertain,
                "Order placement outcome unknown, checking status"
            );

            match self.lookup(&client_key).await {
                Ok(Some(ack)) => return self.settle(&client_key, ack),
                Ok(None) => {
                    tracing::info!(%client_key, "Broker has no record of the order, resubmitting");
                }
                Err(e) => {
                    tracing::warn!(%client_key, error = %e, "Status lookup failed");
                }
            }

            if attempt < settings.placement_attempts {
                sleep(self.backoff(attempt)).await;
            }
        }

        tracing::error!(
            %client_key,
            attempts = settings.placement_attempts,
            "Order outcome unknown after all attempts, marking UNCONFIRMED"
        );
        self.set_intent_state(&client_key, IntentState::Unconfirmed, None);
        PlacementOutcome::Unconfirmed {
            attempts: settings.placement_attempts,
        }
    }

    /// Status lookup by client key with bounded retries.
    /// `Ok(None)` means the broker reports no such order.
    async fn lookup(&self, client_key: &str) -> Result<Option<OrderAck>, BrokerError> {
        let settings = self.settings();
        let mut last_error = BrokerError::Timeout {
            operation: "order_status",
        };

        for attempt in 1..=settings.status_max_retries.max(1) {
            let broker = self.broker();
            let status = timeout(
                settings.timeout,
                broker.order_status(OrderRef::ClientKey(client_key.to_string())),
            )
            .await;

            match status {
                Ok(Ok(ack)) => return Ok(Some(ack)),
                Ok(Err(BrokerError::NotFound(_))) => return Ok(None),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    last_error = BrokerError::Timeout {
                        operation: "order_status",
                    }
                }
            }

            if attempt < settings.status_max_retries {
                sleep(self.backoff(attempt)).await;
            }
        }

        Err(last_error)
    }

    fn settle(&self, client_key: &str, ack: OrderAck) -> PlacementOutcome {
        let tag = match ack.state {
            OrderState::Filled if ack.fill_price.is_some() => Some("filled"),
            OrderState::Rejected | OrderState::Cancelled => Some("rejected"),
            _ => None,
        };
        if let Some(tag) = tag {
            self.registry()
                .settled
                .insert(format!("{}:{}", client_key, tag));
        }

        match ack.state {
            OrderState::Filled => {
                self.set_intent_state(client_key, IntentState::Filled, Some(&ack.order_id));
                match ack.fill_price {
                    Some(fill_price) => PlacementOutcome::Filled {
                        order_id: ack.order_id,
                        fill_price,
                        filled_qty: ack.filled_qty,
                    },
                    None => {
                        tracing::warn!(%client_key, "Filled order without a fill price, awaiting event");
                        self.set_intent_state(client_key, IntentState::Working, None);
                        PlacementOutcome::Accepted {
                            order_id: ack.order_id,
                        }
                    }
                }
            }
            OrderState::Accepted => {
                self.set_intent_state(client_key, IntentState::Working, Some(&ack.order_id));
                PlacementOutcome::Accepted {
                    order_id: ack.order_id,
                }
            }
            OrderState::Rejected | OrderState::Cancelled => {
                self.set_intent_state(client_key, IntentState::Rejected, Some(&ack.order_id));
                PlacementOutcome::Rejected {
                    reason: ack.reason.unwrap_or_else(|| format!("order {:?}", ack.state)),
                }
            }
        }
    }

    /// Place the protective sell-stop for an open tier. Returns the trigger id.
    pub async fn place_stop(&self, trade: &Trade) -> Result<String, CoordinatorError> {
        let key = IntentKey::for_trade(trade, IntentKind::Stop);
        let client_key = key.to_string();
        self.upsert_intent(&key, trade.id, IntentState::Submitted);

        let settings = self.settings();
        let request = TriggerRequest {
            client_key: client_key.clone(),
            symbol: trade.symbol.clone(),
            qty: trade.qty,
            stop_price: trade.stop_loss,
        };

        let mut last_error = CoordinatorError::Timeout {
            operation: "place_trigger",
            key: client_key.clone(),
        };

        // The trigger endpoint is idempotent on client key, so retrying is safe
        for attempt in 1..=settings.placement_attempts {
            let broker = self.broker();
            match timeout(settings.timeout, broker.place_trigger(request.clone())).await {
                Ok(Ok(ack)) => {
                    let mut registry = self.registry();
                    registry
                        .triggers
                        .insert(ack.trigger_id.clone(), client_key.clone());
                    if let Some(record) = registry.intents.get_mut(&client_key) {
                        record.state = IntentState::Active;
                        record.broker_id = Some(ack.trigger_id.clone());
                        record.stop_price = Some(ack.stop_price);
                        record.updated_at = Utc::now();
                    }
                    tracing::info!(%client_key, trigger_id = %ack.trigger_id, stop = ack.stop_price, "Stop trigger placed");
                    return Ok(ack.trigger_id);
                }
                Ok(Err(e)) if !e.is_transient() => {
                    self.set_intent_state(&client_key, IntentState::Rejected, None);
                    return Err(e.into());
                }
                Ok(Err(e)) => last_error = e.into(),
                Err(_) => {
                    last_error = CoordinatorError::Timeout {
                        operation: "place_trigger",
                        key: client_key.clone(),
                    }
                }
            }

            if attempt < settings.placement_attempts {
                sleep(self.backoff(attempt)).await;
            }
        }

        self.set_intent_state(&client_key, IntentState::Unconfirmed, None);
        Err(last_error)
    }

    /// Move a trigger up to `stop_price`
    ///
    /// Moves below the configured minimum delta are skipped; the next larger
    /// raise will carry them. The recorded stop only changes once the broker
    /// acknowledged the modification.
    pub async fn adjust_stop(
        &self,
        trigger_id: &str,
        stop_price: f64,
    ) -> Result<StopUpdate, CoordinatorError> {
        let (client_key, current) = {
            let registry = self.registry();
            let client_key = registry
                .triggers
                .get(trigger_id)
                .cloned()
                .ok_or_else(|| CoordinatorError::UnknownTrigger(trigger_id.to_string()))?;
            let current = registry
                .intents
                .get(&client_key)
                .and_then(|r| r.stop_price)
                .unwrap_or(0.0);
            (client_key, current)
        };

        if stop_price <= current {
            if stop_price < current {
                return Err(CoordinatorError::StopNotRaised {
                    key: client_key,
                    current,
                    requested: stop_price,
                });
            }
            return Ok(StopUpdate::Throttled);
        }

        let settings = self.settings();
        if current > 0.0 && (stop_price - current) / current * 100.0 < settings.min_trigger_delta_pct {
            tracing::debug!(%client_key, current, stop_price, "Stop move below minimum delta");
            return Ok(StopUpdate::Throttled);
        }

        let broker = self.broker();
        match timeout(settings.timeout, broker.modify_trigger(trigger_id, stop_price)).await {
            Ok(Ok(())) => {
                let mut registry = self.registry();
                if let Some(record) = registry.intents.get_mut(&client_key) {
                    record.stop_price = Some(stop_price);
                    record.updated_at = Utc::now();
                }
                tracing::debug!(%client_key, stop_price, "Stop trigger raised");
                Ok(StopUpdate::Modified { stop_price })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CoordinatorError::Timeout {
                operation: "modify_trigger",
                key: client_key,
            }),
        }
    }

    pub async fn cancel_stop(&self, trigger_id: &str) -> Result<(), CoordinatorError> {
        let settings = self.settings();
        let broker = self.broker();
        match timeout(settings.timeout, broker.cancel_trigger(trigger_id)).await {
            Ok(Ok(())) => {
                let client_key = self.registry().triggers.get(trigger_id).cloned();
                if let Some(key) = client_key {
                    self.set_intent_state(&key, IntentState::Cancelled, None);
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CoordinatorError::Timeout {
                operation: "cancel_trigger",
                key: trigger_id.to_string(),
            }),
        }
    }

    /// Current broker status of an order intent
    pub async fn status(&self, key: &IntentKey) -> Result<Option<OrderAck>, BrokerError> {
        self.lookup(&key.to_string()).await
    }

    /// Match an event to its intent
    ///
    /// Unknown and repeated events are quarantined and `None` is returned.
    pub fn reconcile(&self, event: BrokerEvent) -> Option<MatchedEvent> {
        let mut registry = self.registry();

        let client_key = match event.kind {
            BrokerEventKind::TriggerFired => registry
                .triggers
                .get(&event.broker_id)
                .cloned()
                .or_else(|| {
                    registry
                        .intents
                        .contains_key(&event.client_key)
                        .then(|| event.client_key.clone())
                }),
            _ => registry
                .intents
                .contains_key(&event.client_key)
                .then(|| event.client_key.clone()),
        };

        let Some(client_key) = client_key else {
            tracing::warn!(client_key = %event.client_key, kind = ?event.kind, "Unmatched broker event quarantined");
            push_quarantine(&mut registry, event, QuarantineReason::Unmatched);
            return None;
        };

        let kind_tag = match event.kind {
            BrokerEventKind::OrderFilled => "filled",
            BrokerEventKind::OrderRejected { .. } => "rejected",
            BrokerEventKind::TriggerFired => "fired",
        };
        let event_key = format!("{}:{}", client_key, kind_tag);
        if registry.settled.remove(&event_key) {
            tracing::debug!(%client_key, kind = kind_tag, "Event confirms an already settled order");
            registry.processed.insert(event_key);
            return None;
        }
        if !registry.processed.insert(event_key) {
            tracing::warn!(%client_key, kind = kind_tag, "Duplicate broker event quarantined");
            push_quarantine(&mut registry, event, QuarantineReason::Duplicate);
            return None;
        }

        let record = registry.intents.get_mut(&client_key)?;
        record.state = match event.kind {
            BrokerEventKind::OrderFilled => IntentState::Filled,
            BrokerEventKind::OrderRejected { .. } => IntentState::Rejected,
            BrokerEventKind::TriggerFired => IntentState::Fired,
        };
        record.updated_at = Utc::now();

        Some(MatchedEvent {
            key: record.key.clone(),
            trade_id: record.trade_id,
            event,
        })
    }

    /// Schedule a finished ladder's bookkeeping for removal
    ///
    /// Its intents stay matchable until the next [`Self::prune_retired`] call
    /// after the current one, so confirmations still in flight are recognised.
    pub fn retire_ladder(&self, symbol: &str, ladder_seq: u64) {
        let mut registry = self.registry();
        if !registry.has_ladder(symbol, ladder_seq) {
            return;
        }
        let round = registry.prune_round;
        registry
            .retired
            .entry((symbol.to_string(), ladder_seq))
            .or_insert(round);
    }

    /// Forget intents, triggers and event marks of ladders retired in an
    /// earlier round. Returns how many intents were removed.
    pub fn prune_retired(&self) -> usize {
        let mut registry = self.registry();
        let round = registry.prune_round;
        registry.prune_round += 1;

        let expired: HashSet<(String, u64)> = registry
            .retired
            .iter()
            .filter(|(_, &retired_in)| retired_in < round)
            .map(|(ladder, _)| ladder.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }
        registry.retired.retain(|ladder, _| !expired.contains(ladder));

        let belongs = |key: &str| ladder_of(key).is_some_and(|ladder| expired.contains(&ladder));
        let before = registry.intents.len();
        registry.intents.retain(|key, _| !belongs(key.as_str()));
        registry.triggers.retain(|_, key| !belongs(key.as_str()));
        registry.processed.retain(|key| !belongs(key.as_str()));
        registry.settled.retain(|key| !belongs(key.as_str()));
        let removed = before - registry.intents.len();

        tracing::debug!(ladders = expired.len(), intents = removed, "Pruned finished ladders");
        removed
    }

    /// Set aside an event that matched an intent but could not be applied
    pub fn quarantine(&self, event: BrokerEvent, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(client_key = %event.client_key, %reason, "Broker event quarantined");
        push_quarantine(
            &mut self.registry(),
            event,
            QuarantineReason::Inconsistent(reason),
        );
    }

    pub fn quarantined(&self) -> Vec<QuarantinedEvent> {
        self.registry().quarantine.clone()
    }

    /// Remove a quarantined event after manual handling
    pub fn resolve_quarantined(&self, id: Uuid) -> Option<QuarantinedEvent> {
        let mut registry = self.registry();
        let index = registry.quarantine.iter().position(|q| q.id == id)?;
        Some(registry.quarantine.remove(index))
    }

    pub fn unconfirmed(&self) -> Vec<IntentRecord> {
        let mut records: Vec<_> = self
            .registry()
            .intents
            .values()
            .filter(|r| r.state == IntentState::Unconfirmed)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        records
    }

    /// Record an intent's outcome decided outside the normal flow
    pub fn mark(&self, key: &IntentKey, state: IntentState) {
        self.set_intent_state(&key.to_string(), state, None);
    }

    /// Re-register the intents of a recovered trade so later events match
    pub fn restore_intent(&self, trade: &Trade) {
        let exit_unconfirmed =
            trade.status == TradeStatus::Unconfirmed && trade.exit_reason.is_some();
        let entry_state = match trade.status {
            TradeStatus::Pending => IntentState::Working,
            TradeStatus::Unconfirmed if !exit_unconfirmed => IntentState::Unconfirmed,
            _ => IntentState::Filled,
        };
        let entry = IntentKey::for_trade(trade, IntentKind::Entry);
        self.upsert_intent(&entry, trade.id, entry_state);
        if let Some(order_id) = &trade.entry_order_id {
            self.set_intent_state(&entry.to_string(), entry_state, Some(order_id));
        }

        if trade.status == TradeStatus::Closing || exit_unconfirmed {
            let exit = IntentKey::for_trade(trade, IntentKind::Exit);
            let state = if exit_unconfirmed {
                IntentState::Unconfirmed
            } else {
                IntentState::Working
            };
            self.upsert_intent(&exit, trade.id, state);
        }

        if let Some(trigger_id) = &trade.linked_trigger_id {
            let stop = IntentKey::for_trade(trade, IntentKind::Stop);
            let client_key = stop.to_string();
            self.upsert_intent(&stop, trade.id, IntentState::Active);
            let mut registry = self.registry();
            registry.triggers.insert(trigger_id.clone(), client_key.clone());
            if let Some(record) = registry.intents.get_mut(&client_key) {
                record.broker_id = Some(trigger_id.clone());
                record.stop_price = Some(trade.stop_loss);
            }
        }
    }
}

fn push_quarantine(registry: &mut Registry, event: BrokerEvent, reason: QuarantineReason) {
    registry.quarantine.push(QuarantinedEvent {
        id: Uuid::new_v4(),
        event,
        reason,
        quarantined_at: Utc::now(),
    });
}
