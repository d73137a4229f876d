// Broker adapters: one trait, three execution modes
pub mod live;
pub mod paper;
pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ExecutionMode, Side};

pub use live::RestBroker;
pub use paper::PaperBroker;
pub use simulated::{SimFaults, SimulatedBroker};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker did not answer {operation} in time")]
    Timeout { operation: &'static str },

    #[error("broker rate limit hit")]
    RateLimited,

    #[error("transient broker failure: {0}")]
    Transient(String),

    #[error("broker rejected request: {0}")]
    Rejected(String),

    #[error("not found at broker: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// The request may or may not have reached the broker
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout { .. }
                | BrokerError::RateLimited
                | BrokerError::Transient(_)
                | BrokerError::Transport(_)
        )
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BrokerError::Timeout {
                operation: "http request",
            }
        } else if e.is_decode() {
            BrokerError::Transient(format!("malformed response: {}", e))
        } else {
            BrokerError::Transport(e.to_string())
        }
    }
}

/// Market order. `client_key` is the idempotency key: submitting the same key
/// twice never creates a second order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_key: String,
    pub symbol: String,
    pub side: Side,
    pub qty: u64,
    /// Reference price the decision was made at
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Filled,
    /// Working at the broker; the fill arrives as an event
    Accepted,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_key: String,
    pub state: OrderState,
    pub fill_price: Option<f64>,
    pub filled_qty: u64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Sell-stop protecting an open tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub client_key: String,
    pub symbol: String,
    pub qty: u64,
    pub stop_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerAck {
    pub trigger_id: String,
    pub client_key: String,
    pub stop_price: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef {
    Id(String),
    ClientKey(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerEventKind {
    OrderFilled,
    OrderRejected { reason: String },
    TriggerFired,
}

/// Asynchronous notification from a broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEvent {
    /// Client key of the order or trigger the event is about
    pub client_key: String,
    /// Broker-side order or trigger id
    pub broker_id: String,
    pub symbol: String,
    pub kind: BrokerEventKind,
    pub price: Option<f64>,
    pub qty: u64,
    pub timestamp: DateTime<Utc>,
}

/// Execution venue
///
/// Implementations must honor `client_key` idempotency for orders and triggers.
#[async_trait]
pub trait Broker: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, BrokerError>;

    async fn order_status(&self, order: OrderRef) -> Result<OrderAck, BrokerError>;

    async fn place_trigger(&self, request: TriggerRequest) -> Result<TriggerAck, BrokerError>;

    async fn modify_trigger(&self, trigger_id: &str, stop_price: f64) -> Result<(), BrokerError>;

    async fn cancel_trigger(&self, trigger_id: &str) -> Result<(), BrokerError>;

    /// Pull pending events, for venues without push delivery
    async fn poll_events(&self) -> Result<Vec<BrokerEvent>, BrokerError> {
        Ok(Vec::new())
    }

    /// Market data hook for venues that simulate trigger execution locally
    fn on_market_price(&self, _symbol: &str, _price: f64, _timestamp: DateTime<Utc>) {}

    /// Redeliver events held back by a full channel. Returns how many went out.
    fn flush_events(&self) -> usize {
        0
    }
}
