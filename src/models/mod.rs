use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A single price update from the feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(symbol: impl Into<String>, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
        }
    }
}

/// OHLCV candle with the EMAs computed when it closed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub interval_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// EMA value per period, empty while the candle is still in progress
    #[serde(default)]
    pub emas: BTreeMap<usize, f64>,
}

impl Candle {
    pub fn ema(&self, period: usize) -> Option<f64> {
        self.emas.get(&period).copied()
    }
}

/// Which broker implementation orders are routed to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Simulated,
    Paper,
    Live,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::Simulated => "simulated",
            ExecutionMode::Paper => "paper",
            ExecutionMode::Live => "live",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simulated" | "sim" => Ok(ExecutionMode::Simulated),
            "paper" => Ok(ExecutionMode::Paper),
            "live" | "real" => Ok(ExecutionMode::Live),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Ladder tier. Tiers open strictly in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    One,
    Two,
    Three,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::One, Tier::Two, Tier::Three];

    pub fn number(self) -> u8 {
        match self {
            Tier::One => 1,
            Tier::Two => 2,
            Tier::Three => 3,
        }
    }

    pub fn from_number(n: u8) -> Option<Tier> {
        match n {
            1 => Some(Tier::One),
            2 => Some(Tier::Two),
            3 => Some(Tier::Three),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Tier> {
        Tier::from_number(self.number() + 1)
    }

    pub fn previous(self) -> Option<Tier> {
        self.number().checked_sub(1).and_then(Tier::from_number)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeStatus {
    /// Entry order sent, fill not yet confirmed
    Pending,
    Open,
    /// Exit order sent, fill not yet confirmed
    Closing,
    Closed,
    Stopped,
    /// Broker outcome unknown after retries, needs manual resolution
    Unconfirmed,
}

impl TradeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TradeStatus::Closed | TradeStatus::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeStatus::Pending => "PENDING",
            TradeStatus::Open => "OPEN",
            TradeStatus::Closing => "CLOSING",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::Stopped => "STOPPED",
            TradeStatus::Unconfirmed => "UNCONFIRMED",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TradeStatus::Pending),
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSING" => Ok(TradeStatus::Closing),
            "CLOSED" => Ok(TradeStatus::Closed),
            "STOPPED" => Ok(TradeStatus::Stopped),
            "UNCONFIRMED" => Ok(TradeStatus::Unconfirmed),
            other => Err(format!("invalid trade status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    Target,
    Manual,
}

impl ExitReason {
    /// Terminal status a trade takes when it exits for this reason
    pub fn final_status(self) -> TradeStatus {
        match self {
            ExitReason::StopLoss | ExitReason::TrailingStop => TradeStatus::Stopped,
            ExitReason::Target | ExitReason::Manual => TradeStatus::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "StopLoss",
            ExitReason::TrailingStop => "TrailingStop",
            ExitReason::Target => "Target",
            ExitReason::Manual => "Manual",
        }
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "StopLoss" => Ok(ExitReason::StopLoss),
            "TrailingStop" => Ok(ExitReason::TrailingStop),
            "Target" => Ok(ExitReason::Target),
            "Manual" => Ok(ExitReason::Manual),
            other => Err(format!("invalid exit reason '{}'", other)),
        }
    }
}

/// One tier of a ladder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: String,
    pub ladder_seq: u64,
    pub tier: Tier,
    pub entry_price: f64,
    pub qty: u64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    pub target: Option<f64>, // tier 1 only
    pub trail_pct: Option<f64>, // tiers 2-3 only
    pub highest_price_since_entry: f64,
    pub entry_order_id: Option<String>,
    pub linked_trigger_id: Option<String>,
    pub reserved_capital: f64,
    pub status: TradeStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<f64>,
    pub mode: ExecutionMode,
}

impl Trade {
    /// Holds or may hold a position at the broker
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.qty as f64
    }

    pub fn unrealized_pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }
}

/// Momentum score for one symbol in one scan cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankScore {
    pub symbol: String,
    pub cycle: u64,
    pub rank_gm: f64,
    pub rank_gm_previous: Option<f64>,
    pub acceleration: f64,
    pub rank_final: f64,
    pub passes_filter: bool,
    /// Last price was older than the freshness threshold when scored
    pub stale: bool,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert_eq!(Tier::One.next(), Some(Tier::Two));
        assert_eq!(Tier::Three.next(), None);
        assert_eq!(Tier::One.previous(), None);
        assert_eq!(Tier::Three.previous(), Some(Tier::Two));
        assert!(Tier::One < Tier::Three);
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            TradeStatus::Pending,
            TradeStatus::Open,
            TradeStatus::Closing,
            TradeStatus::Closed,
            TradeStatus::Stopped,
            TradeStatus::Unconfirmed,
        ] {
            assert_eq!(status.as_str().parse::<TradeStatus>().unwrap(), status);
        }
        assert!("open".parse::<TradeStatus>().is_err());
    }

    #[test]
    fn test_exit_reason_final_status() {
        assert_eq!(ExitReason::TrailingStop.final_status(), TradeStatus::Stopped);
        assert_eq!(ExitReason::Target.final_status(), TradeStatus::Closed);
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("PAPER".parse::<ExecutionMode>().unwrap(), ExecutionMode::Paper);
        assert_eq!("real".parse::<ExecutionMode>().unwrap(), ExecutionMode::Live);
        assert!("dry".parse::<ExecutionMode>().is_err());
    }
}
