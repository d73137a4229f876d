use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::simulated::SimulatedBroker;
use super::{Broker, BrokerError, OrderAck, OrderRef, OrderRequest, TriggerAck, TriggerRequest};
use crate::execution::events::EventPublisher;
use crate::execution::PriceCache;
use crate::models::{ExecutionMode, Side};

/// Paper trading: simulated book priced off live quotes with slippage
pub struct PaperBroker {
    book: SimulatedBroker,
    prices: Arc<PriceCache>,
    slippage_bps: f64,
}

impl PaperBroker {
    pub fn new(prices: Arc<PriceCache>, slippage_bps: f64, publisher: EventPublisher) -> Self {
        Self {
            book: SimulatedBroker::with_mode(ExecutionMode::Paper, publisher),
            prices,
            slippage_bps: slippage_bps.max(0.0),
        }
    }

    /// Buys fill above the last quote, sells below it
    pub fn fill_price(&self, request: &OrderRequest) -> f64 {
        let base = self.prices.get(&request.symbol).unwrap_or(request.price);
        let slip = base * self.slippage_bps / 10_000.0;
        match request.side {
            Side::Buy => base + slip,
            Side::Sell => base - slip,
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Paper
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, BrokerError> {
        let price = self.fill_price(&request);
        self.book.fill_at(request, price).await
    }

    async fn order_status(&self, order: OrderRef) -> Result<OrderAck, BrokerError> {
        self.book.order_status(order).await
    }

    async fn place_trigger(&self, request: TriggerRequest) -> Result<TriggerAck, BrokerError> {
        self.book.place_trigger(request).await
    }

    async fn modify_trigger(&self, trigger_id: &str, stop_price: f64) -> Result<(), BrokerError> {
        self.book.modify_trigger(trigger_id, stop_price).await
    }

    async fn cancel_trigger(&self, trigger_id: &str) -> Result<(), BrokerError> {
        self.book.cancel_trigger(trigger_id).await
    }

    fn on_market_price(&self, symbol: &str, price: f64, timestamp: DateTime<Utc>) {
        self.book.on_market_price(symbol, price, timestamp)
    }

    fn flush_events(&self) -> usize {
        self.book.flush_events()
    }
}
