use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    Broker, BrokerError, BrokerEvent, BrokerEventKind, OrderAck, OrderRef, OrderRequest,
    TriggerAck, TriggerRequest,
};
use crate::config::BrokerSettings;
use crate::models::{ExecutionMode, Side};

type BrokerRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Serialize)]
struct NewOrder<'a> {
    client_order_id: &'a str,
    symbol: &'a str,
    side: Side,
    qty: u64,
    #[serde(rename = "type")]
    order_type: &'static str,
}

#[derive(Debug, Serialize)]
struct NewTrigger<'a> {
    client_order_id: &'a str,
    symbol: &'a str,
    side: Side,
    qty: u64,
    stop_price: f64,
}

#[derive(Debug, Serialize)]
struct TriggerUpdate {
    stop_price: f64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    client_order_id: String,
    status: super::OrderState,
    #[serde(default)]
    fill_price: Option<f64>,
    #[serde(default)]
    filled_qty: u64,
    #[serde(default)]
    reason: Option<String>,
}

impl From<OrderResponse> for OrderAck {
    fn from(r: OrderResponse) -> Self {
        OrderAck {
            order_id: r.id,
            client_key: r.client_order_id,
            state: r.status,
            fill_price: r.fill_price,
            filled_qty: r.filled_qty,
            reason: r.reason,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    id: String,
    client_order_id: String,
    stop_price: f64,
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    sequence: u64,
    client_order_id: String,
    broker_id: String,
    symbol: String,
    kind: String,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    qty: u64,
    #[serde(default)]
    reason: Option<String>,
    timestamp: DateTime<Utc>,
}

impl EventResponse {
    fn into_event(self) -> Option<BrokerEvent> {
        let kind = match self.kind.as_str() {
            "order_filled" => BrokerEventKind::OrderFilled,
            "order_rejected" => BrokerEventKind::OrderRejected {
                reason: self.reason.unwrap_or_default(),
            },
            "trigger_fired" => BrokerEventKind::TriggerFired,
            other => {
                tracing::warn!(kind = other, client_key = %self.client_order_id, "Unknown broker event kind");
                return None;
            }
        };

        Some(BrokerEvent {
            client_key: self.client_order_id,
            broker_id: self.broker_id,
            symbol: self.symbol,
            kind,
            price: self.price,
            qty: self.qty,
            timestamp: self.timestamp,
        })
    }
}

/// REST adapter for a live venue
///
/// No retries happen here; the order coordinator owns retry and
/// reconciliation so every attempt reuses the same client key.
#[derive(Clone)]
pub struct RestBroker {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<BrokerRateLimiter>,
    /// Last event sequence consumed from `/events`
    cursor: Arc<AtomicU64>,
}

impl RestBroker {
    pub fn new(settings: &BrokerSettings, timeout: Duration) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Transport(format!("failed to build HTTP client: {}", e)))?;

        let rps = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            rate_limiter,
            cursor: Arc::new(AtomicU64::new(0)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, BrokerError> {
        self.rate_limiter.until_ready().await;

        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(status, body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BrokerError> {
        let response = self.send(request).await?;
        Ok(response.json::<T>().await?)
    }
}

fn classify(status: StatusCode, body: String) -> BrokerError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => BrokerError::RateLimited,
        StatusCode::NOT_FOUND => BrokerError::NotFound(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BrokerError::Timeout {
            operation: "http request",
        },
        s if s.is_server_error() => BrokerError::Transient(format!("{}: {}", s, body)),
        s => BrokerError::Rejected(format!("{}: {}", s, body)),
    }
}

#[async_trait]
impl Broker for RestBroker {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Live
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, BrokerError> {
        let body = NewOrder {
            client_order_id: &request.client_key,
            symbol: &request.symbol,
            side: request.side,
            qty: request.qty,
            order_type: "market",
        };

        let response: OrderResponse = self
            .send_json(self.client.post(self.url("/orders")).json(&body))
            .await?;

        tracing::info!(
            client_key = %request.client_key,
            order_id = %response.id,
            status = ?response.status,
            "Order placed"
        );

        Ok(response.into())
    }

    async fn order_status(&self, order: OrderRef) -> Result<OrderAck, BrokerError> {
        let request = match &order {
            OrderRef::Id(id) => self.client.get(self.url(&format!("/orders/{}", id))),
            OrderRef::ClientKey(key) => self
                .client
                .get(self.url("/orders"))
                .query(&[("client_order_id", key.as_str())]),
        };

        let response: OrderResponse = self.send_json(request).await?;
        Ok(response.into())
    }

    async fn place_trigger(&self, request: TriggerRequest) -> Result<TriggerAck, BrokerError> {
        let body = NewTrigger {
            client_order_id: &request.client_key,
            symbol: &request.symbol,
            side: Side::Sell,
            qty: request.qty,
            stop_price: request.stop_price,
        };

        let response: TriggerResponse = self
            .send_json(self.client.post(self.url("/triggers")).json(&body))
            .await?;

        Ok(TriggerAck {
            trigger_id: response.id,
            client_key: response.client_order_id,
            stop_price: response.stop_price,
        })
    }

    async fn modify_trigger(&self, trigger_id: &str, stop_price: f64) -> Result<(), BrokerError> {
        let url = self.url(&format!("/triggers/{}", trigger_id));
        self.send(self.client.patch(url).json(&TriggerUpdate { stop_price }))
            .await?;
        Ok(())
    }

    async fn cancel_trigger(&self, trigger_id: &str) -> Result<(), BrokerError> {
        let url = self.url(&format!("/triggers/{}", trigger_id));
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn poll_events(&self) -> Result<Vec<BrokerEvent>, BrokerError> {
        let after = self.cursor.load(Ordering::SeqCst);
        let request = self
            .client
            .get(self.url("/events"))
            .query(&[("after", after)]);

        let raw: Vec<EventResponse> = self.send_json(request).await?;
        if let Some(last) = raw.iter().map(|e| e.sequence).max() {
            self.cursor.fetch_max(last, Ordering::SeqCst);
        }

        Ok(raw.into_iter().filter_map(EventResponse::into_event).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, String::new()),
            BrokerError::RateLimited
        );
        assert!(classify(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, "gone".into()),
            BrokerError::NotFound(_)
        ));
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, "qty".into()),
            BrokerError::Rejected(_)
        ));
    }

    #[test]
    fn test_unknown_event_kind_is_skipped() {
        let raw = EventResponse {
            sequence: 1,
            client_order_id: "k".into(),
            broker_id: "b".into(),
            symbol: "X".into(),
            kind: "margin_call".into(),
            price: None,
            qty: 0,
            reason: None,
            timestamp: Utc::now(),
        };
        assert!(raw.into_event().is_none());
    }
}
