use crate::models::PriceTick;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

type QuoteRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Anything that can produce the latest price for a set of symbols
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quotes(&self, symbols: &[String]) -> Result<Vec<PriceTick>>;
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    symbol: String,
    price: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Client for the venue's `/quotes` endpoint
#[derive(Clone)]
pub struct RestQuoteClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<QuoteRateLimiter>,
}

impl RestQuoteClient {
    pub fn new(base_url: &str, api_key: Option<String>, requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        }
    }

    /// Fetch quotes with retry and exponential backoff on failure
    pub async fn get_quotes(&self, symbols: &[String]) -> Result<Vec<PriceTick>> {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.fetch_once(symbols).await {
                Ok(ticks) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Fetched quotes after retry");
                    }
                    return Ok(ticks);
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                        tracing::warn!(
                            "Quote fetch attempt {}/{} failed: {}. Retrying in {}ms...",
                            attempt,
                            MAX_RETRIES,
                            e,
                            backoff_ms
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All retry attempts failed".into()))
    }

    async fn fetch_once(&self, symbols: &[String]) -> Result<Vec<PriceTick>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/quotes", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .query(&[("symbols", symbols.join(","))]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?.error_for_status()?;
        let quotes: Vec<QuoteData> = response.json().await?;
        let now = Utc::now();

        Ok(quotes
            .into_iter()
            .filter(|q| q.price.is_finite() && q.price > 0.0)
            .map(|q| PriceTick::new(q.symbol, q.price, q.timestamp.unwrap_or(now)))
            .collect())
    }
}

#[async_trait]
impl QuoteSource for RestQuoteClient {
    async fn fetch_quotes(&self, symbols: &[String]) -> Result<Vec<PriceTick>> {
        self.get_quotes(symbols).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_quotes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/quotes")
            .match_query(mockito::Matcher::UrlEncoded(
                "symbols".into(),
                "AAA,BBB".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"symbol":"AAA","price":12.5,"timestamp":"2024-01-01T00:00:00Z"},
                    {"symbol":"BBB","price":0.0}]"#,
            )
            .create_async()
            .await;

        let client = RestQuoteClient::new(&server.url(), None, 100);
        let ticks = client
            .fetch_quotes(&["AAA".to_string(), "BBB".to_string()])
            .await
            .unwrap();

        mock.assert_async().await;
        // Non-positive prices are dropped
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].symbol, "AAA");
        assert_eq!(ticks[0].price, 12.5);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/quotes")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .expect(MAX_RETRIES as usize)
            .create_async()
            .await;

        let client = RestQuoteClient::new(&server.url(), None, 100);
        let result = client.fetch_quotes(&["AAA".to_string()]).await;

        assert!(result.is_err());
        failing.assert_async().await;
    }
}
