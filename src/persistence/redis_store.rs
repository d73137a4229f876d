use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

use super::{CandleStore, StoreError};
use crate::models::Candle;

/// Redis persistence for closed candles
///
/// Uses one sorted set per symbol, `candles:{symbol}`, scored by interval
/// start so range and latest lookups stay cheap.
#[derive(Clone)]
pub struct RedisPersistence {
    conn: ConnectionManager,
    max_candles: usize,
}

impl RedisPersistence {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `max_candles` - Candles retained per symbol
    pub async fn new(redis_url: &str, max_candles: usize) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(format!("redis at {} after 5 seconds", redis_url)))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            max_candles: max_candles.max(1),
        })
    }

    fn key(symbol: &str) -> String {
        format!("candles:{}", symbol)
    }

    /// Get count of stored candles for a symbol
    pub async fn count_candles(&self, symbol: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let count: usize = conn.zcard(Self::key(symbol)).await?;
        Ok(count)
    }
}

#[async_trait]
impl CandleStore for RedisPersistence {
    async fn save_candle(&self, candle: &Candle) -> Result<(), StoreError> {
        let key = Self::key(&candle.symbol);
        let score = candle.interval_start.timestamp() as f64;
        let value = serde_json::to_string(candle)?;

        let mut conn = self.conn.clone();
        // One entry per interval: replace whatever was stored for it
        conn.zrembyscore::<_, _, _, ()>(&key, score, score).await?;
        conn.zadd::<_, _, _, ()>(&key, value, score).await?;

        let keep = self.max_candles as isize;
        let removed: usize = conn.zremrangebyrank(&key, 0, -(keep + 1)).await?;
        if removed > 0 {
            tracing::debug!("Trimmed {} old candles for {}", removed, candle.symbol);
        }

        Ok(())
    }

    async fn latest_candle(&self, symbol: &str) -> Result<Option<Candle>, StoreError> {
        let mut conn = self.conn.clone();
        let results: Vec<String> = conn.zrange(Self::key(symbol), -1, -1).await?;

        results
            .first()
            .map(|json| serde_json::from_str::<Candle>(json))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let start = -(limit as isize);
        let results: Vec<String> = conn.zrange(Self::key(symbol), start, -1).await?;

        let candles = results
            .iter()
            .map(|json| serde_json::from_str::<Candle>(json))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!("Loaded {} candles for {} from Redis", candles.len(), symbol);

        Ok(candles)
    }
}
