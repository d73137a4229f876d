// Trade and candle storage
pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{Candle, Trade};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisPersistence;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("connection timed out: {0}")]
    Timeout(String),
}

/// Durable trade records, the source of truth across restarts
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Insert or update by trade id
    async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError>;

    /// Remove a trade whose entry never reached the broker
    async fn delete_trade(&self, id: Uuid) -> Result<(), StoreError>;

    /// Every trade not yet CLOSED or STOPPED
    async fn load_live_trades(&self) -> Result<Vec<Trade>, StoreError>;

    /// All tiers of one ladder, including closed ones
    async fn load_ladder(&self, symbol: &str, ladder_seq: u64) -> Result<Vec<Trade>, StoreError>;

    /// Highest ladder sequence ever used, per symbol
    async fn max_ladder_seqs(&self) -> Result<HashMap<String, u64>, StoreError>;

    async fn trade_history(&self, symbol: &str) -> Result<Vec<Trade>, StoreError>;
}

/// Closed candles with their EMA state
#[async_trait]
pub trait CandleStore: Send + Sync {
    async fn save_candle(&self, candle: &Candle) -> Result<(), StoreError>;

    async fn latest_candle(&self, symbol: &str) -> Result<Option<Candle>, StoreError>;

    /// Up to `limit` most recent candles, oldest first
    async fn recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError>;
}
