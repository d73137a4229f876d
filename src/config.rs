use crate::models::ExecutionMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Connection settings for the REST broker and quote source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub requests_per_second: u32,
    /// Paper fills are priced off the last cached price plus this slippage
    pub paper_slippage_bps: f64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            requests_per_second: 10,
            paper_slippage_bps: 5.0,
        }
    }
}

/// Strategy parameters. Percentages are expressed in percent (2.5 == 2.5%).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategyConfig {
    pub mode: ExecutionMode,
    pub symbols: Vec<String>,

    // Capital
    pub total_capital: f64,
    pub per_position_capital: f64,
    pub max_positions: usize,
    pub lot_size: u64,

    // Scan cycle / indicators
    pub scan_interval_secs: u64,
    pub ema_short_period: usize,
    pub ema_long_period: usize,
    pub max_candles: usize,
    pub stale_after_secs: u64,

    // Ranking
    pub min_rank_threshold: f64,
    pub accel_weight: f64,

    // Ladder
    pub tier1_stop_loss_pct: f64,
    pub tier1_target_pct: f64,
    pub tier2_entry_pnl_pct: f64,
    pub tier2_trail_pct: f64,
    pub tier3_entry_avg_pnl_pct: f64,
    pub tier3_trail_pct: f64,

    // Order handling
    pub min_trigger_delta_pct: f64,
    pub broker_timeout_ms: u64,
    pub status_max_retries: u32,
    pub placement_attempts: u32,
    pub retry_backoff_ms: u64,
    pub event_channel_capacity: usize,
    pub tick_channel_capacity: usize,
    pub quote_poll_secs: u64,
    pub shutdown_grace_secs: u64,

    pub broker: BrokerSettings,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Simulated,
            symbols: Vec::new(),
            total_capital: 240_000.0,
            per_position_capital: 3_000.0,
            max_positions: 80,
            lot_size: 1,
            scan_interval_secs: 900,
            ema_short_period: 20,
            ema_long_period: 50,
            max_candles: 500,
            stale_after_secs: 120,
            min_rank_threshold: 2.5,
            accel_weight: 0.3,
            tier1_stop_loss_pct: 2.5,
            tier1_target_pct: 5.0,
            tier2_entry_pnl_pct: 0.25,
            tier2_trail_pct: 2.5,
            tier3_entry_avg_pnl_pct: 1.0,
            tier3_trail_pct: 5.0,
            min_trigger_delta_pct: 0.05,
            broker_timeout_ms: 5_000,
            status_max_retries: 3,
            placement_attempts: 2,
            retry_backoff_ms: 250,
            event_channel_capacity: 1_024,
            tick_channel_capacity: 4_096,
            quote_poll_secs: 5,
            shutdown_grace_secs: 30,
            broker: BrokerSettings::default(),
        }
    }
}

impl StrategyConfig {
    /// Layered load: defaults, then the optional file, then `LADDER_*` env vars
    ///
    /// Nested keys use a double underscore, e.g. `LADDER_BROKER__BASE_URL`.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("LADDER")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("symbols")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: StrategyConfig = settings.try_deserialize()?;
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if !(self.total_capital.is_finite() && self.total_capital > 0.0) {
            return Err(invalid("total_capital", "must be positive"));
        }
        if !(self.per_position_capital.is_finite() && self.per_position_capital > 0.0) {
            return Err(invalid("per_position_capital", "must be positive"));
        }
        if self.per_position_capital > self.total_capital {
            return Err(invalid(
                "per_position_capital",
                "cannot exceed total_capital",
            ));
        }
        if self.max_positions == 0 {
            return Err(invalid("max_positions", "must be at least 1"));
        }
        if self.lot_size == 0 {
            return Err(invalid("lot_size", "must be at least 1"));
        }
        if self.scan_interval_secs == 0 {
            return Err(invalid("scan_interval_secs", "must be positive"));
        }
        if self.ema_short_period == 0 || self.ema_long_period == 0 {
            return Err(invalid("ema_short_period", "EMA periods must be positive"));
        }
        if self.ema_short_period >= self.ema_long_period {
            return Err(invalid(
                "ema_short_period",
                "must be shorter than ema_long_period",
            ));
        }
        if !self.min_rank_threshold.is_finite() {
            return Err(invalid("min_rank_threshold", "must be finite"));
        }
        if !(self.accel_weight.is_finite() && self.accel_weight >= 0.0) {
            return Err(invalid("accel_weight", "must be a non-negative number"));
        }

        let pct_fields = [
            ("tier1_stop_loss_pct", self.tier1_stop_loss_pct),
            ("tier1_target_pct", self.tier1_target_pct),
            ("tier2_trail_pct", self.tier2_trail_pct),
            ("tier3_trail_pct", self.tier3_trail_pct),
        ];
        for (field, value) in pct_fields {
            if !(value > 0.0 && value < 100.0) {
                return Err(invalid(field, format!("{} is outside (0, 100)", value)));
            }
        }
        if !(self.tier2_entry_pnl_pct.is_finite() && self.tier2_entry_pnl_pct >= 0.0) {
            return Err(invalid("tier2_entry_pnl_pct", "must be non-negative"));
        }
        if !(self.tier3_entry_avg_pnl_pct.is_finite() && self.tier3_entry_avg_pnl_pct >= 0.0) {
            return Err(invalid("tier3_entry_avg_pnl_pct", "must be non-negative"));
        }
        if !(self.min_trigger_delta_pct.is_finite() && self.min_trigger_delta_pct >= 0.0) {
            return Err(invalid("min_trigger_delta_pct", "must be non-negative"));
        }
        if self.broker_timeout_ms == 0 {
            return Err(invalid("broker_timeout_ms", "must be positive"));
        }
        if self.placement_attempts == 0 {
            return Err(invalid("placement_attempts", "must be at least 1"));
        }
        if self.event_channel_capacity == 0 || self.tick_channel_capacity == 0 {
            return Err(invalid(
                "event_channel_capacity",
                "channel capacities must be positive",
            ));
        }

        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    /// Capacity implied by the capital limits alone
    pub fn capital_slots(&self) -> usize {
        (self.total_capital / self.per_position_capital).floor() as usize
    }
}
