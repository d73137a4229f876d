use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    Broker, BrokerError, BrokerEvent, BrokerEventKind, OrderAck, OrderRef, OrderRequest,
    OrderState, TriggerAck, TriggerRequest,
};
use crate::execution::events::{EventOutbox, EventPublisher};
use crate::models::ExecutionMode;

/// Failure injection counters. Each counter is consumed one call at a time.
#[derive(Debug, Default)]
pub struct SimFaults {
    /// Record the order, then never answer (caller times out)
    stall_after_accept: AtomicU32,
    /// Fail before the order reaches the book
    fail_before_accept: AtomicU32,
    reject: AtomicU32,
    /// Accept orders as working instead of filling them immediately
    defer_fill: AtomicU32,
    fail_status: AtomicU32,
    fail_trigger: AtomicU32,
}

impl SimFaults {
    pub fn stall_after_accept(&self, n: u32) {
        self.stall_after_accept.store(n, Ordering::SeqCst);
    }

    pub fn fail_before_accept(&self, n: u32) {
        self.fail_before_accept.store(n, Ordering::SeqCst);
    }

    pub fn reject(&self, n: u32) {
        self.reject.store(n, Ordering::SeqCst);
    }

    pub fn defer_fill(&self, n: u32) {
        self.defer_fill.store(n, Ordering::SeqCst);
    }

    pub fn fail_status(&self, n: u32) {
        self.fail_status.store(n, Ordering::SeqCst);
    }

    pub fn fail_trigger(&self, n: u32) {
        self.fail_trigger.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug, Clone)]
struct SimTrigger {
    client_key: String,
    symbol: String,
    qty: u64,
    stop_price: f64,
    active: bool,
}

#[derive(Debug, Default)]
struct Book {
    orders: HashMap<String, OrderAck>,
    order_keys: HashMap<String, String>,
    order_symbols: HashMap<String, String>,
    triggers: HashMap<String, SimTrigger>,
    trigger_keys: HashMap<String, String>,
}

/// In-memory venue: fills market orders at the reference price and fires
/// sell-stops when the market trades through them
#[derive(Debug)]
pub struct SimulatedBroker {
    mode: ExecutionMode,
    book: Mutex<Book>,
    outbox: EventOutbox,
    next_id: AtomicU64,
    place_calls: AtomicU64,
    faults: SimFaults,
}

impl SimulatedBroker {
    pub fn new(publisher: EventPublisher) -> Self {
        Self::with_mode(ExecutionMode::Simulated, publisher)
    }

    pub(crate) fn with_mode(mode: ExecutionMode, publisher: EventPublisher) -> Self {
        Self {
            mode,
            book: Mutex::new(Book::default()),
            outbox: EventOutbox::new(publisher),
            next_id: AtomicU64::new(1),
            place_calls: AtomicU64::new(0),
            faults: SimFaults::default(),
        }
    }

    pub fn faults(&self) -> &SimFaults {
        &self.faults
    }

    /// Distinct orders on the book
    pub fn order_count(&self) -> usize {
        self.book().orders.len()
    }

    pub fn place_calls(&self) -> u64 {
        self.place_calls.load(Ordering::SeqCst)
    }

    pub fn active_trigger(&self, trigger_id: &str) -> Option<f64> {
        self.book()
            .triggers
            .get(trigger_id)
            .filter(|t| t.active)
            .map(|t| t.stop_price)
    }

    pub fn active_triggers(&self) -> usize {
        self.book().triggers.values().filter(|t| t.active).count()
    }

    /// Fill a working order and emit its fill event
    pub fn complete_order(&self, client_key: &str, fill_price: f64) -> Result<(), BrokerError> {
        let event = {
            let mut book = self.book();
            let order = book
                .orders
                .get_mut(client_key)
                .ok_or_else(|| BrokerError::NotFound(client_key.to_string()))?;
            if order.state != OrderState::Accepted {
                return Err(BrokerError::Rejected(format!(
                    "order {} is not working",
                    order.order_id
                )));
            }
            order.state = OrderState::Filled;
            order.fill_price = Some(fill_price);
            let (broker_id, qty) = (order.order_id.clone(), order.filled_qty);
            BrokerEvent {
                client_key: client_key.to_string(),
                broker_id,
                symbol: book.order_symbols.get(client_key).cloned().unwrap_or_default(),
                kind: BrokerEventKind::OrderFilled,
                price: Some(fill_price),
                qty,
                timestamp: Utc::now(),
            }
        };
        self.outbox.push(event);
        Ok(())
    }

    pub fn pending_events(&self) -> usize {
        self.outbox.pending()
    }

    pub(crate) async fn fill_at(
        &self,
        request: OrderRequest,
        fill_price: f64,
    ) -> Result<OrderAck, BrokerError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);

        let existing = self.book().orders.get(&request.client_key).cloned();
        if let Some(existing) = existing {
            tracing::debug!(client_key = %request.client_key, "Duplicate client key, returning existing order");
            return Ok(existing);
        }

        if SimFaults::take(&self.faults.fail_before_accept) {
            return Err(BrokerError::Transient("simulated outage".to_string()));
        }

        if request.qty == 0 {
            return Err(BrokerError::Rejected("quantity must be positive".to_string()));
        }
        if SimFaults::take(&self.faults.reject) {
            return Err(BrokerError::Rejected("simulated rejection".to_string()));
        }

        let order_id = self.next_id("ord");
        let deferred = SimFaults::take(&self.faults.defer_fill);
        let ack = OrderAck {
            order_id: order_id.clone(),
            client_key: request.client_key.clone(),
            state: if deferred {
                OrderState::Accepted
            } else {
                OrderState::Filled
            },
            fill_price: (!deferred).then_some(fill_price),
            filled_qty: request.qty,
            reason: None,
        };

        {
            let mut book = self.book();
            book.orders.insert(request.client_key.clone(), ack.clone());
            book.order_keys.insert(order_id, request.client_key.clone());
            book.order_symbols
                .insert(request.client_key.clone(), request.symbol.clone());
        }

        if SimFaults::take(&self.faults.stall_after_accept) {
            tracing::debug!(client_key = %request.client_key, "Simulated stall after accept");
            std::future::pending::<()>().await;
        }

        Ok(ack)
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn book(&self) -> std::sync::MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Broker for SimulatedBroker {
    fn mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, BrokerError> {
        let price = request.price;
        self.fill_at(request, price).await
    }

    async fn order_status(&self, order: OrderRef) -> Result<OrderAck, BrokerError> {
        if SimFaults::take(&self.faults.fail_status) {
            return Err(BrokerError::Transient("status unavailable".to_string()));
        }

        let book = self.book();
        let found = match &order {
            OrderRef::ClientKey(key) => book.orders.get(key),
            OrderRef::Id(id) => book.order_keys.get(id).and_then(|k| book.orders.get(k)),
        };

        found.cloned().ok_or_else(|| {
            BrokerError::NotFound(match order {
                OrderRef::ClientKey(key) | OrderRef::Id(key) => key,
            })
        })
    }

    async fn place_trigger(&self, request: TriggerRequest) -> Result<TriggerAck, BrokerError> {
        if SimFaults::take(&self.faults.fail_trigger) {
            return Err(BrokerError::Transient("trigger service unavailable".to_string()));
        }
        if !(request.stop_price.is_finite() && request.stop_price > 0.0) {
            return Err(BrokerError::Rejected(format!(
                "invalid stop price {}",
                request.stop_price
            )));
        }

        let mut book = self.book();
        if let Some(id) = book.trigger_keys.get(&request.client_key).cloned() {
            if let Some(existing) = book.triggers.get(&id) {
                return Ok(TriggerAck {
                    trigger_id: id,
                    client_key: request.client_key,
                    stop_price: existing.stop_price,
                });
            }
        }

        let trigger_id = self.next_id("trg");
        book.triggers.insert(
            trigger_id.clone(),
            SimTrigger {
                client_key: request.client_key.clone(),
                symbol: request.symbol,
                qty: request.qty,
                stop_price: request.stop_price,
                active: true,
            },
        );
        book.trigger_keys
            .insert(request.client_key.clone(), trigger_id.clone());

        Ok(TriggerAck {
            trigger_id,
            client_key: request.client_key,
            stop_price: request.stop_price,
        })
    }

    async fn modify_trigger(&self, trigger_id: &str, stop_price: f64) -> Result<(), BrokerError> {
        if SimFaults::take(&self.faults.fail_trigger) {
            return Err(BrokerError::Transient("trigger service unavailable".to_string()));
        }

        let mut book = self.book();
        let trigger = book
            .triggers
            .get_mut(trigger_id)
            .filter(|t| t.active)
            .ok_or_else(|| BrokerError::NotFound(trigger_id.to_string()))?;
        trigger.stop_price = stop_price;
        Ok(())
    }

    async fn cancel_trigger(&self, trigger_id: &str) -> Result<(), BrokerError> {
        let mut book = self.book();
        let trigger = book
            .triggers
            .get_mut(trigger_id)
            .filter(|t| t.active)
            .ok_or_else(|| BrokerError::NotFound(trigger_id.to_string()))?;
        trigger.active = false;
        Ok(())
    }

    fn on_market_price(&self, symbol: &str, price: f64, timestamp: DateTime<Utc>) {
        let fired: Vec<BrokerEvent> = {
            let mut book = self.book();
            book.triggers
                .iter_mut()
                .filter(|(_, t)| t.active && t.symbol == symbol && price <= t.stop_price)
                .map(|(id, t)| {
                    t.active = false;
                    BrokerEvent {
                        client_key: t.client_key.clone(),
                        broker_id: id.clone(),
                        symbol: t.symbol.clone(),
                        kind: BrokerEventKind::TriggerFired,
                        price: Some(price),
                        qty: t.qty,
                        timestamp,
                    }
                })
                .collect()
        };

        for event in fired {
            tracing::info!(
                symbol,
                client_key = %event.client_key,
                price,
                "Simulated stop triggered"
            );
            self.outbox.push(event);
        }

        if self.outbox.pending() > 0 {
            self.outbox.flush();
        }
    }

    fn flush_events(&self) -> usize {
        self.outbox.flush()
    }
}
