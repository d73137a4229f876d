use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CandleStore, StoreError, TradeStore};
use crate::models::{Candle, Trade};

/// In-process store, used in simulated mode and when no database is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    trades: RwLock<HashMap<Uuid, Trade>>,
    candles: RwLock<HashMap<String, BTreeMap<i64, Candle>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trade_count(&self) -> usize {
        self.trades.read().await.len()
    }
}

fn sorted(mut trades: Vec<Trade>) -> Vec<Trade> {
    trades.sort_by(|a, b| {
        a.symbol
            .cmp(&b.symbol)
            .then(a.ladder_seq.cmp(&b.ladder_seq))
            .then(a.tier.cmp(&b.tier))
    });
    trades
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        self.trades.write().await.insert(trade.id, trade.clone());
        Ok(())
    }

    async fn delete_trade(&self, id: Uuid) -> Result<(), StoreError> {
        self.trades.write().await.remove(&id);
        Ok(())
    }

    async fn load_live_trades(&self) -> Result<Vec<Trade>, StoreError> {
        let trades = self.trades.read().await;
        Ok(sorted(trades.values().filter(|t| t.is_live()).cloned().collect()))
    }

    async fn load_ladder(&self, symbol: &str, ladder_seq: u64) -> Result<Vec<Trade>, StoreError> {
        let trades = self.trades.read().await;
        Ok(sorted(
            trades
                .values()
                .filter(|t| t.symbol == symbol && t.ladder_seq == ladder_seq)
                .cloned()
                .collect(),
        ))
    }

    async fn max_ladder_seqs(&self) -> Result<HashMap<String, u64>, StoreError> {
        let trades = self.trades.read().await;
        let mut seqs: HashMap<String, u64> = HashMap::new();
        for trade in trades.values() {
            let seq = seqs.entry(trade.symbol.clone()).or_insert(0);
            *seq = (*seq).max(trade.ladder_seq);
        }
        Ok(seqs)
    }

    async fn trade_history(&self, symbol: &str) -> Result<Vec<Trade>, StoreError> {
        let trades = self.trades.read().await;
        Ok(sorted(
            trades
                .values()
                .filter(|t| t.symbol == symbol)
                .cloned()
                .collect(),
        ))
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn save_candle(&self, candle: &Candle) -> Result<(), StoreError> {
        self.candles
            .write()
            .await
            .entry(candle.symbol.clone())
            .or_default()
            .insert(candle.interval_start.timestamp(), candle.clone());
        Ok(())
    }

    async fn latest_candle(&self, symbol: &str) -> Result<Option<Candle>, StoreError> {
        let candles = self.candles.read().await;
        Ok(candles
            .get(symbol)
            .and_then(|series| series.values().next_back().cloned()))
    }

    async fn recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError> {
        let candles = self.candles.read().await;
        let Some(series) = candles.get(symbol) else {
            return Ok(Vec::new());
        };
        let skip = series.len().saturating_sub(limit);
        Ok(series.values().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionMode, Tier, TradeStatus};
    use chrono::{Duration, Utc};

    fn create_test_trade(symbol: &str, seq: u64, tier: Tier, status: TradeStatus) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            ladder_seq: seq,
            tier,
            entry_price: 100.0,
            qty: 30,
            entry_time: Utc::now(),
            stop_loss: 97.5,
            target: Some(105.0),
            trail_pct: None,
            highest_price_since_entry: 100.0,
            entry_order_id: None,
            linked_trigger_id: None,
            reserved_capital: 3_000.0,
            status,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            realized_pnl: None,
            mode: ExecutionMode::Simulated,
        }
    }

    fn create_test_candle(symbol: &str, minutes_ago: i64, close: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval_start: Utc::now() - Duration::minutes(minutes_ago),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            emas: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_live_trades_and_sequences() {
        let store = MemoryStore::new();
        store
            .save_trade(&create_test_trade("A", 1, Tier::One, TradeStatus::Closed))
            .await
            .unwrap();
        store
            .save_trade(&create_test_trade("A", 2, Tier::One, TradeStatus::Open))
            .await
            .unwrap();
        store
            .save_trade(&create_test_trade("B", 4, Tier::One, TradeStatus::Stopped))
            .await
            .unwrap();

        let live = store.load_live_trades().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].ladder_seq, 2);

        let seqs = store.max_ladder_seqs().await.unwrap();
        assert_eq!(seqs["A"], 2);
        assert_eq!(seqs["B"], 4);
    }

    #[tokio::test]
    async fn test_save_is_upsert_and_delete_removes() {
        let store = MemoryStore::new();
        let mut trade = create_test_trade("A", 1, Tier::One, TradeStatus::Pending);
        store.save_trade(&trade).await.unwrap();

        trade.status = TradeStatus::Open;
        store.save_trade(&trade).await.unwrap();
        assert_eq!(store.trade_count().await, 1);
        assert_eq!(
            store.load_ladder("A", 1).await.unwrap()[0].status,
            TradeStatus::Open
        );

        store.delete_trade(trade.id).await.unwrap();
        assert_eq!(store.trade_count().await, 0);
    }

    #[tokio::test]
    async fn test_candles_ordered_by_interval() {
        let store = MemoryStore::new();
        store.save_candle(&create_test_candle("A", 30, 1.0)).await.unwrap();
        store.save_candle(&create_test_candle("A", 15, 2.0)).await.unwrap();
        store.save_candle(&create_test_candle("A", 45, 0.5)).await.unwrap();

        assert_eq!(store.latest_candle("A").await.unwrap().unwrap().close, 2.0);
        let recent = store.recent_candles("A", 2).await.unwrap();
        assert_eq!(recent.iter().map(|c| c.close).collect::<Vec<_>>(), vec![1.0, 2.0]);
        assert!(store.latest_candle("B").await.unwrap().is_none());
    }
}
