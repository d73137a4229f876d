use crate::models::{ExecutionMode, ExitReason, Tier, Trade, TradeStatus};
use crate::persistence::{StoreError, TradeStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

const TRADE_COLUMNS: &str = r#"
    id, symbol, ladder_seq, tier, entry_price, qty, entry_time,
    stop_loss, target, trail_pct, highest_price, entry_order_id,
    linked_trigger_id, reserved_capital, status, exit_price, exit_time,
    exit_reason, realized_pnl, mode
"#;

/// Postgres persistence for ladder trades
pub struct PostgresPersistence {
    pool: PgPool,
}

fn to_decimal(field: &str, value: f64) -> Result<Decimal, StoreError> {
    Decimal::try_from(value)
        .map_err(|e| StoreError::Corrupt(format!("{} = {} is not storable: {}", field, value, e)))
}

fn opt_decimal(field: &str, value: Option<f64>) -> Result<Option<Decimal>, StoreError> {
    value.map(|v| to_decimal(field, v)).transpose()
}

fn to_f64(field: &str, value: Decimal) -> Result<f64, StoreError> {
    value
        .to_f64()
        .ok_or_else(|| StoreError::Corrupt(format!("{} = {} out of range", field, value)))
}

fn opt_f64(field: &str, value: Option<Decimal>) -> Result<Option<f64>, StoreError> {
    value.map(|v| to_f64(field, v)).transpose()
}

fn trade_from_row(row: &PgRow) -> Result<Trade, StoreError> {
    let tier_num: i16 = row.try_get("tier")?;
    let tier = u8::try_from(tier_num)
        .ok()
        .and_then(Tier::from_number)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid tier {}", tier_num)))?;

    let status_str: String = row.try_get("status")?;
    let status = status_str.parse::<TradeStatus>().map_err(StoreError::Corrupt)?;

    let exit_reason = row
        .try_get::<Option<String>, _>("exit_reason")?
        .map(|s| s.parse::<ExitReason>())
        .transpose()
        .map_err(StoreError::Corrupt)?;

    let mode = row
        .try_get::<String, _>("mode")?
        .parse::<ExecutionMode>()
        .map_err(StoreError::Corrupt)?;

    let ladder_seq: i64 = row.try_get("ladder_seq")?;
    let qty: i64 = row.try_get("qty")?;

    Ok(Trade {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        ladder_seq: u64::try_from(ladder_seq)
            .map_err(|_| StoreError::Corrupt(format!("negative ladder_seq {}", ladder_seq)))?,
        tier,
        entry_price: to_f64("entry_price", row.try_get("entry_price")?)?,
        qty: u64::try_from(qty).map_err(|_| StoreError::Corrupt(format!("negative qty {}", qty)))?,
        entry_time: row.try_get::<DateTime<Utc>, _>("entry_time")?,
        stop_loss: to_f64("stop_loss", row.try_get("stop_loss")?)?,
        target: opt_f64("target", row.try_get("target")?)?,
        trail_pct: opt_f64("trail_pct", row.try_get("trail_pct")?)?,
        highest_price_since_entry: to_f64("highest_price", row.try_get("highest_price")?)?,
        entry_order_id: row.try_get("entry_order_id")?,
        linked_trigger_id: row.try_get("linked_trigger_id")?,
        reserved_capital: to_f64("reserved_capital", row.try_get("reserved_capital")?)?,
        status,
        exit_price: opt_f64("exit_price", row.try_get("exit_price")?)?,
        exit_time: row.try_get("exit_time")?,
        exit_reason,
        realized_pnl: opt_f64("realized_pnl", row.try_get("realized_pnl")?)?,
        mode,
    })
}

impl PostgresPersistence {
    /// Connect to Postgres and run pending migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    async fn query_trades(
        &self,
        filter: &str,
        bind: impl FnOnce(
            sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Trade>, StoreError> {
        let sql = format!(
            "SELECT {} FROM trades {} ORDER BY symbol, ladder_seq, tier",
            TRADE_COLUMNS, filter
        );
        let rows = bind(sqlx::query(&sql)).fetch_all(&self.pool).await?;
        rows.iter().map(trade_from_row).collect()
    }

    /// Delete all trades (tests only)
    #[cfg(test)]
    async fn clear_all_trades(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM trades").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TradeStore for PostgresPersistence {
    async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, symbol, ladder_seq, tier, entry_price, qty, entry_time,
                stop_loss, target, trail_pct, highest_price, entry_order_id,
                linked_trigger_id, reserved_capital, status, exit_price, exit_time,
                exit_reason, realized_pnl, mode
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (id) DO UPDATE SET
                entry_price = EXCLUDED.entry_price,
                qty = EXCLUDED.qty,
                entry_time = EXCLUDED.entry_time,
                stop_loss = EXCLUDED.stop_loss,
                target = EXCLUDED.target,
                highest_price = EXCLUDED.highest_price,
                entry_order_id = EXCLUDED.entry_order_id,
                linked_trigger_id = EXCLUDED.linked_trigger_id,
                reserved_capital = EXCLUDED.reserved_capital,
                status = EXCLUDED.status,
                exit_price = EXCLUDED.exit_price,
                exit_time = EXCLUDED.exit_time,
                exit_reason = EXCLUDED.exit_reason,
                realized_pnl = EXCLUDED.realized_pnl,
                updated_at = NOW()
            "#,
        )
        .bind(trade.id)
        .bind(&trade.symbol)
        .bind(trade.ladder_seq as i64)
        .bind(trade.tier.number() as i16)
        .bind(to_decimal("entry_price", trade.entry_price)?)
        .bind(trade.qty as i64)
        .bind(trade.entry_time)
        .bind(to_decimal("stop_loss", trade.stop_loss)?)
        .bind(opt_decimal("target", trade.target)?)
        .bind(opt_decimal("trail_pct", trade.trail_pct)?)
        .bind(to_decimal("highest_price", trade.highest_price_since_entry)?)
        .bind(&trade.entry_order_id)
        .bind(&trade.linked_trigger_id)
        .bind(to_decimal("reserved_capital", trade.reserved_capital)?)
        .bind(trade.status.as_str())
        .bind(opt_decimal("exit_price", trade.exit_price)?)
        .bind(trade.exit_time)
        .bind(trade.exit_reason.map(|r| r.as_str()))
        .bind(opt_decimal("realized_pnl", trade.realized_pnl)?)
        .bind(trade.mode.to_string())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved {} {} (L{}) as {}",
            trade.symbol,
            trade.tier,
            trade.ladder_seq,
            trade.status.as_str()
        );

        Ok(())
    }

    async fn delete_trade(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM trades WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_live_trades(&self) -> Result<Vec<Trade>, StoreError> {
        let trades = self
            .query_trades("WHERE status NOT IN ('CLOSED', 'STOPPED')", |q| q)
            .await?;
        tracing::info!("Loaded {} live trades from Postgres", trades.len());
        Ok(trades)
    }

    async fn load_ladder(&self, symbol: &str, ladder_seq: u64) -> Result<Vec<Trade>, StoreError> {
        let symbol = symbol.to_string();
        self.query_trades("WHERE symbol = $1 AND ladder_seq = $2", move |q| {
            q.bind(symbol).bind(ladder_seq as i64)
        })
        .await
    }

    async fn max_ladder_seqs(&self) -> Result<HashMap<String, u64>, StoreError> {
        let rows = sqlx::query("SELECT symbol, MAX(ladder_seq) AS seq FROM trades GROUP BY symbol")
            .fetch_all(&self.pool)
            .await?;

        let mut seqs = HashMap::new();
        for row in rows {
            let symbol: String = row.try_get("symbol")?;
            let seq: i64 = row.try_get("seq")?;
            seqs.insert(symbol, seq.max(0) as u64);
        }
        Ok(seqs)
    }

    async fn trade_history(&self, symbol: &str) -> Result<Vec<Trade>, StoreError> {
        let symbol = symbol.to_string();
        self.query_trades("WHERE symbol = $1", move |q| q.bind(symbol))
            .await
    }
}
