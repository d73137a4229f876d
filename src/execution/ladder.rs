use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StrategyConfig;
use crate::models::{ExecutionMode, ExitReason, Tier, Trade, TradeStatus};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LadderError {
    #[error("{symbol} ladder is halted: {reason}")]
    Halted { symbol: String, reason: String },

    #[error("{symbol} {tier} cannot open: {reason}")]
    OutOfOrder {
        symbol: String,
        tier: Tier,
        reason: String,
    },

    #[error("{symbol} has no {tier} trade")]
    NoSuchTier { symbol: String, tier: Tier },

    #[error("{symbol} {tier} is {status:?}, expected {expected}")]
    InvalidTransition {
        symbol: String,
        tier: Tier,
        status: TradeStatus,
        expected: &'static str,
    },

    #[error("{symbol} ladder invariant violated: {detail}")]
    InvariantViolation { symbol: String, detail: String },
}

/// Tier entry/exit parameters, percentages in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LadderParams {
    pub per_position_capital: f64,
    pub lot_size: u64,
    pub tier1_stop_loss_pct: f64,
    pub tier1_target_pct: f64,
    pub tier2_entry_pnl_pct: f64,
    pub tier2_trail_pct: f64,
    pub tier3_entry_avg_pnl_pct: f64,
    pub tier3_trail_pct: f64,
}

impl LadderParams {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            per_position_capital: cfg.per_position_capital,
            lot_size: cfg.lot_size,
            tier1_stop_loss_pct: cfg.tier1_stop_loss_pct,
            tier1_target_pct: cfg.tier1_target_pct,
            tier2_entry_pnl_pct: cfg.tier2_entry_pnl_pct,
            tier2_trail_pct: cfg.tier2_trail_pct,
            tier3_entry_avg_pnl_pct: cfg.tier3_entry_avg_pnl_pct,
            tier3_trail_pct: cfg.tier3_trail_pct,
        }
    }

    /// Units bought per tier: whole lots of `per_position_capital / price`,
    /// at least one lot
    pub fn quantity(&self, price: f64) -> u64 {
        let lot = self.lot_size.max(1);
        if !price.is_finite() || price <= 0.0 {
            return lot;
        }
        let units = (self.per_position_capital / price).floor() as u64;
        let lots = units / lot;
        if lots == 0 {
            lot
        } else {
            lots * lot
        }
    }

    pub fn trail_pct(&self, tier: Tier) -> Option<f64> {
        match tier {
            Tier::One => None,
            Tier::Two => Some(self.tier2_trail_pct),
            Tier::Three => Some(self.tier3_trail_pct),
        }
    }

    /// Initial (stop, target) for a tier filled at `price`
    pub fn initial_levels(&self, tier: Tier, price: f64) -> (f64, Option<f64>) {
        match tier {
            Tier::One => (
                price * (1.0 - self.tier1_stop_loss_pct / 100.0),
                Some(price * (1.0 + self.tier1_target_pct / 100.0)),
            ),
            Tier::Two | Tier::Three => {
                let trail = self.trail_pct(tier).unwrap_or(0.0);
                (price * (1.0 - trail / 100.0), None)
            }
        }
    }
}

impl Default for LadderParams {
    fn default() -> Self {
        Self::from_config(&StrategyConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LadderState {
    Empty,
    Tier1Open,
    Tier2Open,
    Tier3Open,
}

/// What the ladder wants done after a price update
#[derive(Debug, Clone, PartialEq)]
pub enum LadderAction {
    /// Trailing stop moved up; the broker trigger should follow
    AdjustStop { tier: Tier, stop_loss: f64 },
    OpenTier { tier: Tier, price: f64 },
    Exit {
        tier: Tier,
        reason: ExitReason,
        price: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierPnl {
    pub tier: Tier,
    pub pnl: f64,
    pub pnl_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LadderPnl {
    pub total: f64,
    pub tiers: Vec<TierPnl>,
}

/// Per-symbol sequence of up to three tiers
///
/// Pure state: no I/O happens here. Entries and exits go through a
/// begin/confirm (or abort) pair so an order in flight blocks any conflicting
/// transition on the same tier.
#[derive(Debug, Clone)]
pub struct Ladder {
    symbol: String,
    seq: u64,
    trades: Vec<Trade>,
    halted: Option<String>,
    /// Escalation refused this scan cycle (capital or broker rejection)
    escalation_paused: Option<String>,
}

impl Ladder {
    /// `last_seq` is the highest ladder sequence already used for the symbol
    pub fn new(symbol: impl Into<String>, last_seq: u64) -> Self {
        Self {
            symbol: symbol.into(),
            seq: last_seq,
            trades: Vec::new(),
            halted: None,
            escalation_paused: None,
        }
    }

    /// Rebuild from persisted trades of the symbol's latest ladder
    ///
    /// A ladder that fails validation comes back halted rather than failing
    /// recovery for every symbol.
    pub fn from_trades(symbol: impl Into<String>, mut trades: Vec<Trade>) -> Self {
        let symbol = symbol.into();
        let seq = trades.iter().map(|t| t.ladder_seq).max().unwrap_or(0);
        trades.retain(|t| t.ladder_seq == seq);
        trades.sort_by_key(|t| t.tier);

        let mut ladder = Self {
            symbol,
            seq,
            trades,
            halted: None,
            escalation_paused: None,
        };

        if let Err(e) = ladder.check_invariants() {
            tracing::error!(symbol = %ladder.symbol, error = %e, "Recovered ladder failed validation");
            ladder.halt(e.to_string());
        }

        ladder
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn trade(&self, tier: Tier) -> Option<&Trade> {
        self.trades.iter().find(|t| t.tier == tier)
    }

    fn trade_mut(&mut self, tier: Tier) -> Result<&mut Trade, LadderError> {
        let symbol = self.symbol.clone();
        self.trades
            .iter_mut()
            .find(|t| t.tier == tier)
            .ok_or(LadderError::NoSuchTier { symbol, tier })
    }

    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(symbol = %self.symbol, %reason, "Ladder halted, entries blocked until reset");
        self.halted = Some(reason);
    }

    /// Stop proposing tier 2/3 entries until the next scan cycle
    pub fn pause_escalation(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.escalation_paused.is_none() {
            tracing::info!(symbol = %self.symbol, %reason, "Escalation paused until the next scan cycle");
        }
        self.escalation_paused = Some(reason);
    }

    pub fn resume_escalation(&mut self) {
        self.escalation_paused = None;
    }

    pub fn escalation_paused(&self) -> Option<&str> {
        self.escalation_paused.as_deref()
    }

    /// Manual reset after an invariant violation was resolved
    pub fn reset(&mut self) -> Result<(), LadderError> {
        self.check_invariants()?;
        self.halted = None;
        tracing::info!(symbol = %self.symbol, "Ladder halt cleared");
        Ok(())
    }

    /// No tier holds or may hold a position
    pub fn is_empty(&self) -> bool {
        self.trades.iter().all(|t| !t.is_live())
    }

    pub fn live_trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter().filter(|t| t.is_live())
    }

    pub fn state(&self) -> LadderState {
        match self.live_trades().map(|t| t.tier).max() {
            None => LadderState::Empty,
            Some(Tier::One) => LadderState::Tier1Open,
            Some(Tier::Two) => LadderState::Tier2Open,
            Some(Tier::Three) => LadderState::Tier3Open,
        }
    }

    fn is_open(&self, tier: Tier) -> bool {
        self.trade(tier)
            .is_some_and(|t| t.status == TradeStatus::Open)
    }

    /// Register a tier entry before its order is sent
    pub fn begin_entry(
        &mut self,
        tier: Tier,
        price: f64,
        reserved_capital: f64,
        mode: ExecutionMode,
        now: DateTime<Utc>,
        params: &LadderParams,
    ) -> Result<Trade, LadderError> {
        if let Some(reason) = &self.halted {
            return Err(LadderError::Halted {
                symbol: self.symbol.clone(),
                reason: reason.clone(),
            });
        }

        match tier.previous() {
            None => {
                if !self.is_empty() {
                    return Err(self.out_of_order(tier, "a ladder is already open"));
                }
                // Closed tiers of the previous ladder are already persisted
                self.trades.clear();
                self.escalation_paused = None;
                self.seq += 1;
            }
            Some(parent) => {
                if !self.is_open(parent) {
                    return Err(self.out_of_order(tier, format!("{} is not open", parent)));
                }
                if self.trade(tier).is_some() {
                    return Err(self.out_of_order(tier, "tier already used in this ladder"));
                }
            }
        }

        let (stop_loss, target) = params.initial_levels(tier, price);
        let trade = Trade {
            id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            ladder_seq: self.seq,
            tier,
            entry_price: price,
            qty: params.quantity(price),
            entry_time: now,
            stop_loss,
            target,
            trail_pct: params.trail_pct(tier),
            highest_price_since_entry: price,
            entry_order_id: None,
            linked_trigger_id: None,
            reserved_capital,
            status: TradeStatus::Pending,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            realized_pnl: None,
            mode,
        };

        self.trades.push(trade.clone());
        Ok(trade)
    }

    /// Entry filled: levels are fixed from the fill price
    pub fn confirm_entry(
        &mut self,
        tier: Tier,
        fill_price: f64,
        filled_qty: u64,
        order_id: Option<String>,
        now: DateTime<Utc>,
        params: &LadderParams,
    ) -> Result<Trade, LadderError> {
        let symbol = self.symbol.clone();
        let trade = self.trade_mut(tier)?;
        if !matches!(trade.status, TradeStatus::Pending | TradeStatus::Unconfirmed) {
            return Err(LadderError::InvalidTransition {
                symbol,
                tier,
                status: trade.status,
                expected: "PENDING or UNCONFIRMED",
            });
        }

        let (stop_loss, target) = params.initial_levels(tier, fill_price);
        trade.entry_price = fill_price;
        if filled_qty > 0 {
            trade.qty = filled_qty;
        }
        trade.entry_time = now;
        trade.stop_loss = stop_loss;
        trade.target = target;
        trade.highest_price_since_entry = fill_price;
        if order_id.is_some() {
            trade.entry_order_id = order_id;
        }
        trade.status = TradeStatus::Open;

        tracing::info!(
            symbol = %trade.symbol,
            tier = %tier,
            entry = fill_price,
            qty = trade.qty,
            stop = trade.stop_loss,
            target = ?trade.target,
            "Tier opened"
        );

        Ok(trade.clone())
    }

    pub fn set_entry_order(&mut self, tier: Tier, order_id: String) -> Result<(), LadderError> {
        self.trade_mut(tier)?.entry_order_id = Some(order_id);
        Ok(())
    }

    /// Entry order failed; removes the tier and returns it so its capital can be released
    pub fn abort_entry(&mut self, tier: Tier) -> Result<Trade, LadderError> {
        let index = self
            .trades
            .iter()
            .position(|t| t.tier == tier)
            .ok_or_else(|| LadderError::NoSuchTier {
                symbol: self.symbol.clone(),
                tier,
            })?;

        let status = self.trades[index].status;
        if !matches!(status, TradeStatus::Pending | TradeStatus::Unconfirmed) {
            return Err(LadderError::InvalidTransition {
                symbol: self.symbol.clone(),
                tier,
                status,
                expected: "PENDING or UNCONFIRMED",
            });
        }

        Ok(self.trades.remove(index))
    }

    pub fn mark_unconfirmed(&mut self, tier: Tier) -> Result<Trade, LadderError> {
        let symbol = self.symbol.clone();
        let trade = self.trade_mut(tier)?;
        if !matches!(trade.status, TradeStatus::Pending | TradeStatus::Closing) {
            return Err(LadderError::InvalidTransition {
                symbol,
                tier,
                status: trade.status,
                expected: "PENDING or CLOSING",
            });
        }
        trade.status = TradeStatus::Unconfirmed;
        tracing::warn!(symbol = %trade.symbol, tier = %tier, "Trade marked UNCONFIRMED");
        Ok(trade.clone())
    }

    /// Capital currently held by the allocator for this tier, 0 when released
    pub fn set_reserved_capital(&mut self, tier: Tier, amount: f64) -> Result<(), LadderError> {
        self.trade_mut(tier)?.reserved_capital = amount;
        Ok(())
    }

    pub fn link_trigger(&mut self, tier: Tier, trigger_id: Option<String>) -> Result<(), LadderError> {
        self.trade_mut(tier)?.linked_trigger_id = trigger_id;
        Ok(())
    }

    /// Raise a trailing stop. Returns false when the candidate would not raise it.
    pub fn raise_stop(&mut self, tier: Tier, candidate: f64) -> Result<bool, LadderError> {
        let trade = self.trade_mut(tier)?;
        if trade.trail_pct.is_none() || !candidate.is_finite() || candidate <= trade.stop_loss {
            return Ok(false);
        }
        trade.stop_loss = candidate;
        Ok(true)
    }

    /// Track highs, trail stops, detect exits and escalations for one price update
    pub fn on_price(&mut self, price: f64, params: &LadderParams) -> Vec<LadderAction> {
        let mut actions = Vec::new();
        if !price.is_finite() || price <= 0.0 {
            return actions;
        }

        let mut raised = Vec::new();
        for trade in self
            .trades
            .iter_mut()
            .filter(|t| t.status == TradeStatus::Open)
        {
            if price > trade.highest_price_since_entry {
                trade.highest_price_since_entry = price;
                if let Some(trail) = trade.trail_pct {
                    raised.push((trade.tier, price * (1.0 - trail / 100.0)));
                }
            }
        }
        for (tier, candidate) in raised {
            if let Ok(true) = self.raise_stop(tier, candidate) {
                actions.push(LadderAction::AdjustStop {
                    tier,
                    stop_loss: candidate,
                });
            }
        }

        let mut exiting = Vec::new();
        for trade in self.trades.iter().filter(|t| t.status == TradeStatus::Open) {
            if let Some(target) = trade.target {
                if price >= target {
                    exiting.push(trade.tier);
                    actions.push(LadderAction::Exit {
                        tier: trade.tier,
                        reason: ExitReason::Target,
                        price,
                    });
                    continue;
                }
            }
            // With a trigger at the broker the stop fires there
            if trade.linked_trigger_id.is_none() && price <= trade.stop_loss {
                let reason = if trade.trail_pct.is_some() {
                    ExitReason::TrailingStop
                } else {
                    ExitReason::StopLoss
                };
                exiting.push(trade.tier);
                actions.push(LadderAction::Exit {
                    tier: trade.tier,
                    reason,
                    price,
                });
            }
        }

        if self.halted.is_none() && self.escalation_paused.is_none() {
            if let Some(tier) = self.escalation(price, params, &exiting) {
                actions.push(LadderAction::OpenTier { tier, price });
            }
        }

        actions
    }

    /// Next tier to open at `price`, if its entry condition holds
    pub fn escalation(&self, price: f64, params: &LadderParams, exiting: &[Tier]) -> Option<Tier> {
        let open = |tier: Tier| self.is_open(tier) && !exiting.contains(&tier);

        if self.trade(Tier::Two).is_none() {
            let tier1 = self.trade(Tier::One).filter(|_| open(Tier::One))?;
            return (tier1.unrealized_pnl_pct(price) > params.tier2_entry_pnl_pct)
                .then_some(Tier::Two);
        }

        if self.trade(Tier::Three).is_none() && open(Tier::Two) {
            let pcts: Vec<f64> = [Tier::One, Tier::Two]
                .into_iter()
                .filter(|t| open(*t))
                .filter_map(|t| self.trade(t))
                .map(|t| t.unrealized_pnl_pct(price))
                .collect();
            let avg = pcts.iter().sum::<f64>() / pcts.len() as f64;
            return (avg > params.tier3_entry_avg_pnl_pct).then_some(Tier::Three);
        }

        None
    }

    /// Mark an exit in flight so no second exit is issued for the tier
    pub fn begin_exit(&mut self, tier: Tier, reason: ExitReason) -> Result<Trade, LadderError> {
        let symbol = self.symbol.clone();
        let trade = self.trade_mut(tier)?;
        if trade.status != TradeStatus::Open {
            return Err(LadderError::InvalidTransition {
                symbol,
                tier,
                status: trade.status,
                expected: "OPEN",
            });
        }
        trade.status = TradeStatus::Closing;
        trade.exit_reason = Some(reason);
        Ok(trade.clone())
    }

    /// Exit did not happen; the tier is open again
    pub fn abort_exit(&mut self, tier: Tier) -> Result<(), LadderError> {
        let symbol = self.symbol.clone();
        let trade = self.trade_mut(tier)?;
        let exiting = trade.status == TradeStatus::Closing
            || (trade.status == TradeStatus::Unconfirmed && trade.exit_reason.is_some());
        if !exiting {
            return Err(LadderError::InvalidTransition {
                symbol,
                tier,
                status: trade.status,
                expected: "CLOSING",
            });
        }
        trade.status = TradeStatus::Open;
        trade.exit_reason = None;
        Ok(())
    }

    /// Final exit of a tier. The returned trade is immutable from here on.
    pub fn close_tier(
        &mut self,
        tier: Tier,
        exit_price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<Trade, LadderError> {
        let symbol = self.symbol.clone();
        let trade = self.trade_mut(tier)?;
        if !matches!(
            trade.status,
            TradeStatus::Open | TradeStatus::Closing | TradeStatus::Unconfirmed
        ) {
            return Err(LadderError::InvalidTransition {
                symbol,
                tier,
                status: trade.status,
                expected: "OPEN, CLOSING or UNCONFIRMED",
            });
        }

        let pnl = (exit_price - trade.entry_price) * trade.qty as f64;
        trade.status = reason.final_status();
        trade.exit_price = Some(exit_price);
        trade.exit_time = Some(now);
        trade.exit_reason = Some(reason);
        trade.realized_pnl = Some(pnl);

        tracing::info!(
            symbol = %trade.symbol,
            tier = %tier,
            exit = exit_price,
            reason = reason.as_str(),
            pnl,
            "Tier closed"
        );

        Ok(trade.clone())
    }

    pub fn unrealized_pnl(&self, price: f64) -> LadderPnl {
        let tiers: Vec<TierPnl> = self
            .trades
            .iter()
            .filter(|t| matches!(t.status, TradeStatus::Open | TradeStatus::Closing))
            .map(|t| TierPnl {
                tier: t.tier,
                pnl: t.unrealized_pnl(price),
                pnl_pct: t.unrealized_pnl_pct(price),
            })
            .collect();

        LadderPnl {
            total: tiers.iter().map(|t| t.pnl).sum(),
            tiers,
        }
    }

    /// Structural checks: contiguous increasing tiers of one ladder, sane levels
    pub fn check_invariants(&self) -> Result<(), LadderError> {
        let violation = |detail: String| LadderError::InvariantViolation {
            symbol: self.symbol.clone(),
            detail,
        };

        if self.trades.len() > Tier::ALL.len() {
            return Err(violation(format!("{} tiers in one ladder", self.trades.len())));
        }

        for (index, trade) in self.trades.iter().enumerate() {
            let expected = Tier::ALL[index];
            if trade.tier != expected {
                return Err(violation(format!(
                    "tier gap: found {} where {} was expected",
                    trade.tier, expected
                )));
            }
            if trade.symbol != self.symbol || trade.ladder_seq != self.seq {
                return Err(violation(format!(
                    "{} belongs to {} ladder {}",
                    trade.tier, trade.symbol, trade.ladder_seq
                )));
            }
            if trade.is_live() && (trade.qty == 0 || trade.entry_price <= 0.0) {
                return Err(violation(format!("{} has no position size", trade.tier)));
            }
            if trade.status == TradeStatus::Open
                && trade.trail_pct.is_some()
                && trade.stop_loss > trade.highest_price_since_entry
            {
                return Err(violation(format!(
                    "{} stop {} above high {}",
                    trade.tier, trade.stop_loss, trade.highest_price_since_entry
                )));
            }
            if index > 0 && trade.entry_time < self.trades[index - 1].entry_time {
                return Err(violation(format!(
                    "{} entered before its parent tier",
                    trade.tier
                )));
            }
        }

        Ok(())
    }

    fn out_of_order(&self, tier: Tier, reason: impl Into<String>) -> LadderError {
        LadderError::OutOfOrder {
            symbol: self.symbol.clone(),
            tier,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn params() -> LadderParams {
        LadderParams::default()
    }

    fn open_tier(ladder: &mut Ladder, tier: Tier, price: f64) -> Trade {
        let p = params();
        ladder
            .begin_entry(tier, price, 3_000.0, ExecutionMode::Simulated, Utc::now(), &p)
            .unwrap();
        ladder
            .confirm_entry(tier, price, 0, Some(format!("ord-{}", tier)), Utc::now(), &p)
            .unwrap()
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_quantity_rounding() {
        let p = params();
        assert_eq!(p.quantity(3085.0), 1); // floor(3000/3085) = 0 -> one lot
        assert_eq!(p.quantity(100.0), 30);

        let lots = LadderParams {
            lot_size: 25,
            ..params()
        };
        assert_eq!(lots.quantity(100.0), 25);
        assert_eq!(lots.quantity(50.0), 50);
        assert_eq!(lots.quantity(1_000.0), 25);
    }

    #[test]
    fn test_tier1_levels() {
        let mut ladder = Ladder::new("X", 0);
        let trade = open_tier(&mut ladder, Tier::One, 3085.0);

        assert_close(trade.stop_loss, 3007.875);
        assert_close(trade.target.unwrap(), 3239.25);
        assert_eq!(trade.trail_pct, None);
        assert_eq!(trade.ladder_seq, 1);
        assert_eq!(ladder.state(), LadderState::Tier1Open);
    }

    #[test]
    fn test_tier2_requires_open_tier1() {
        let mut ladder = Ladder::new("X", 0);
        let p = params();

        let err = ladder
            .begin_entry(Tier::Two, 100.0, 3_000.0, ExecutionMode::Simulated, Utc::now(), &p)
            .unwrap_err();
        assert!(matches!(err, LadderError::OutOfOrder { tier: Tier::Two, .. }));

        // Pending tier 1 is not enough
        ladder
            .begin_entry(Tier::One, 100.0, 3_000.0, ExecutionMode::Simulated, Utc::now(), &p)
            .unwrap();
        assert!(ladder
            .begin_entry(Tier::Two, 100.0, 3_000.0, ExecutionMode::Simulated, Utc::now(), &p)
            .is_err());
    }

    #[test]
    fn test_tier3_requires_open_tier2() {
        let mut ladder = Ladder::new("X", 0);
        let p = params();
        open_tier(&mut ladder, Tier::One, 100.0);

        assert!(ladder
            .begin_entry(Tier::Three, 100.0, 3_000.0, ExecutionMode::Simulated, Utc::now(), &p)
            .is_err());
    }

    #[test]
    fn test_cannot_open_second_ladder() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);

        let err = ladder
            .begin_entry(Tier::One, 101.0, 3_000.0, ExecutionMode::Simulated, Utc::now(), &params())
            .unwrap_err();
        assert!(err.to_string().contains("already open"));
    }

    #[test]
    fn test_escalation_to_tier2() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 3085.0);

        // +0.1% is below the 0.25% threshold
        let actions = ladder.on_price(3088.0, &params());
        assert!(actions.is_empty());

        let actions = ladder.on_price(3120.0, &params());
        assert_eq!(
            actions,
            vec![LadderAction::OpenTier {
                tier: Tier::Two,
                price: 3120.0
            }]
        );

        let tier2 = open_tier(&mut ladder, Tier::Two, 3120.0);
        assert_close(tier2.stop_loss, 3042.0);
        assert_eq!(tier2.target, None);
        assert_eq!(ladder.state(), LadderState::Tier2Open);
    }

    #[test]
    fn test_escalation_to_tier3_uses_average_pnl() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);
        open_tier(&mut ladder, Tier::Two, 101.0);

        // T1 +1.2%, T2 +0.198% -> avg 0.699%
        let actions = ladder.on_price(101.2, &params());
        assert!(!actions
            .iter()
            .any(|a| matches!(a, LadderAction::OpenTier { .. })));

        // T1 +2%, T2 +0.99% -> avg 1.495%
        let actions = ladder.on_price(102.0, &params());
        assert!(actions.contains(&LadderAction::OpenTier {
            tier: Tier::Three,
            price: 102.0
        }));

        let tier3 = open_tier(&mut ladder, Tier::Three, 102.0);
        assert_close(tier3.stop_loss, 96.9);
        assert_eq!(ladder.state(), LadderState::Tier3Open);

        // Nothing beyond tier 3
        assert!(!ladder
            .on_price(110.0, &params())
            .iter()
            .any(|a| matches!(a, LadderAction::OpenTier { .. })));
    }

    #[test]
    fn test_no_escalation_while_entry_pending() {
        let mut ladder = Ladder::new("X", 0);
        let p = params();
        open_tier(&mut ladder, Tier::One, 100.0);
        ladder
            .begin_entry(Tier::Two, 101.0, 3_000.0, ExecutionMode::Simulated, Utc::now(), &p)
            .unwrap();

        let actions = ladder.on_price(105.0, &p);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, LadderAction::OpenTier { .. })));
    }

    #[test]
    fn test_trailing_stop_follows_high() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);
        open_tier(&mut ladder, Tier::Two, 100.0);

        let actions = ladder.on_price(110.0, &params());
        let raised = actions.iter().find_map(|a| match a {
            LadderAction::AdjustStop {
                tier: Tier::Two,
                stop_loss,
            } => Some(*stop_loss),
            _ => None,
        });
        assert_close(raised.unwrap(), 107.25);
        let tier2 = ladder.trade(Tier::Two).unwrap();
        assert_eq!(tier2.highest_price_since_entry, 110.0);

        // Pullback does not move the stop
        let actions = ladder.on_price(108.0, &params());
        assert!(!actions
            .iter()
            .any(|a| matches!(a, LadderAction::AdjustStop { .. })));
        assert_close(ladder.trade(Tier::Two).unwrap().stop_loss, 107.25);
    }

    #[test]
    fn test_tier1_levels_never_move() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);

        ladder.on_price(104.0, &params());
        let tier1 = ladder.trade(Tier::One).unwrap();
        assert_close(tier1.stop_loss, 97.5);
        assert_close(tier1.target.unwrap(), 105.0);
        assert_eq!(tier1.highest_price_since_entry, 104.0);
    }

    #[test]
    fn test_raise_stop_rejects_lower_values() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);
        open_tier(&mut ladder, Tier::Two, 100.0);

        assert!(ladder.raise_stop(Tier::Two, 99.0).unwrap());
        assert!(!ladder.raise_stop(Tier::Two, 98.0).unwrap());
        assert!(!ladder.raise_stop(Tier::Two, 99.0).unwrap());
        assert_eq!(ladder.trade(Tier::Two).unwrap().stop_loss, 99.0);

        // Tier 1 has no trail
        assert!(!ladder.raise_stop(Tier::One, 99.9).unwrap());
    }

    #[test]
    fn test_trailing_stop_is_monotonic_for_random_paths() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let mut ladder = Ladder::new("X", 0);
            open_tier(&mut ladder, Tier::One, 100.0);
            open_tier(&mut ladder, Tier::Two, 100.0);
            // Keep the trades open: exits are decided by the broker trigger
            ladder.link_trigger(Tier::One, Some("t1".into())).unwrap();
            ladder.link_trigger(Tier::Two, Some("t2".into())).unwrap();

            let mut price = 100.0;
            let mut last_stop = ladder.trade(Tier::Two).unwrap().stop_loss;
            for _ in 0..500 {
                price *= 1.0 + rng.gen_range(-0.02..0.02);
                ladder.on_price(price, &params());
                let stop = ladder.trade(Tier::Two).unwrap().stop_loss;
                assert!(stop >= last_stop, "stop dropped from {} to {}", last_stop, stop);
                last_stop = stop;
            }
        }
    }

    #[test]
    fn test_target_exit_for_tier1() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);
        ladder.link_trigger(Tier::One, Some("trg".into())).unwrap();

        let actions = ladder.on_price(105.5, &params());
        assert!(actions.contains(&LadderAction::Exit {
            tier: Tier::One,
            reason: ExitReason::Target,
            price: 105.5
        }));
        // Tier 1 exiting this tick, so no escalation off it
        assert!(!actions
            .iter()
            .any(|a| matches!(a, LadderAction::OpenTier { .. })));
    }

    #[test]
    fn test_local_stop_only_without_trigger() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);

        let actions = ladder.on_price(97.0, &params());
        assert_eq!(
            actions,
            vec![LadderAction::Exit {
                tier: Tier::One,
                reason: ExitReason::StopLoss,
                price: 97.0
            }]
        );

        ladder.link_trigger(Tier::One, Some("trg".into())).unwrap();
        assert!(ladder.on_price(97.0, &params()).is_empty());
    }

    #[test]
    fn test_tiers_close_independently() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);
        open_tier(&mut ladder, Tier::Two, 101.0);

        ladder.begin_exit(Tier::One, ExitReason::Target).unwrap();
        let closed = ladder
            .close_tier(Tier::One, 105.0, ExitReason::Target, Utc::now())
            .unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.realized_pnl, Some(5.0 * closed.qty as f64));

        assert_eq!(ladder.state(), LadderState::Tier2Open);
        assert!(!ladder.is_empty());

        // Tier 2 still open but no new tier 1 while the ladder lives
        assert!(ladder
            .begin_entry(Tier::One, 105.0, 3_000.0, ExecutionMode::Simulated, Utc::now(), &params())
            .is_err());

        ladder
            .close_tier(Tier::Two, 104.0, ExitReason::TrailingStop, Utc::now())
            .unwrap();
        assert_eq!(ladder.trade(Tier::Two).unwrap().status, TradeStatus::Stopped);
        assert_eq!(ladder.state(), LadderState::Empty);
        assert!(ladder.is_empty());
    }

    #[test]
    fn test_closed_trade_is_immutable() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);
        ladder
            .close_tier(Tier::One, 97.0, ExitReason::StopLoss, Utc::now())
            .unwrap();

        assert!(ladder
            .close_tier(Tier::One, 90.0, ExitReason::Manual, Utc::now())
            .is_err());
        assert!(ladder.begin_exit(Tier::One, ExitReason::Manual).is_err());
        assert!(ladder.on_price(200.0, &params()).is_empty());
        assert_eq!(ladder.trade(Tier::One).unwrap().highest_price_since_entry, 100.0);
    }

    #[test]
    fn test_new_ladder_gets_next_sequence() {
        let mut ladder = Ladder::new("X", 4);
        open_tier(&mut ladder, Tier::One, 100.0);
        assert_eq!(ladder.seq(), 5);

        ladder
            .close_tier(Tier::One, 105.0, ExitReason::Target, Utc::now())
            .unwrap();
        let trade = open_tier(&mut ladder, Tier::One, 100.0);
        assert_eq!(trade.ladder_seq, 6);
        assert_eq!(ladder.trades().len(), 1);
    }

    #[test]
    fn test_abort_entry_returns_reservation() {
        let mut ladder = Ladder::new("X", 0);
        ladder
            .begin_entry(Tier::One, 100.0, 3_000.0, ExecutionMode::Simulated, Utc::now(), &params())
            .unwrap();

        let aborted = ladder.abort_entry(Tier::One).unwrap();
        assert_eq!(aborted.reserved_capital, 3_000.0);
        assert!(ladder.is_empty());
        assert_eq!(ladder.state(), LadderState::Empty);

        open_tier(&mut ladder, Tier::One, 100.0);
        assert!(ladder.abort_entry(Tier::One).is_err());
    }

    #[test]
    fn test_exit_abort_restores_open() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);

        ladder.begin_exit(Tier::One, ExitReason::Manual).unwrap();
        assert!(ladder.begin_exit(Tier::One, ExitReason::Manual).is_err());
        ladder.abort_exit(Tier::One).unwrap();
        assert_eq!(ladder.trade(Tier::One).unwrap().status, TradeStatus::Open);
    }

    #[test]
    fn test_unconfirmed_entry_can_be_confirmed_later() {
        let mut ladder = Ladder::new("X", 0);
        let p = params();
        ladder
            .begin_entry(Tier::One, 100.0, 3_000.0, ExecutionMode::Simulated, Utc::now(), &p)
            .unwrap();
        ladder.mark_unconfirmed(Tier::One).unwrap();
        assert_eq!(ladder.state(), LadderState::Tier1Open);

        let trade = ladder
            .confirm_entry(Tier::One, 100.5, 30, None, Utc::now(), &p)
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.qty, 30);
    }

    #[test]
    fn test_unrealized_pnl() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);
        open_tier(&mut ladder, Tier::Two, 110.0);

        let pnl = ladder.unrealized_pnl(110.0);
        assert_eq!(pnl.tiers.len(), 2);
        assert_eq!(pnl.tiers[0].pnl, 300.0); // 30 units * 10
        assert_close(pnl.tiers[0].pnl_pct, 10.0);
        assert_eq!(pnl.tiers[1].pnl, 0.0);
        assert_eq!(pnl.total, 300.0);
    }

    #[test]
    fn test_halted_ladder_blocks_entries_but_manages_exits() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);
        ladder.halt("manual check");

        let actions = ladder.on_price(101.0, &params());
        assert!(actions.is_empty());
        let actions = ladder.on_price(90.0, &params());
        assert!(matches!(actions[0], LadderAction::Exit { .. }));

        assert!(matches!(
            ladder.begin_entry(Tier::Two, 101.0, 3_000.0, ExecutionMode::Simulated, Utc::now(), &params()),
            Err(LadderError::Halted { .. })
        ));

        ladder.reset().unwrap();
        assert!(ladder.halted().is_none());
    }

    #[test]
    fn test_paused_escalation_still_trails_and_exits() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);
        ladder.pause_escalation("capital exhausted");

        assert!(ladder.on_price(101.0, &params()).is_empty());
        assert!(matches!(
            ladder.on_price(106.0, &params())[..],
            [LadderAction::Exit {
                reason: ExitReason::Target,
                ..
            }]
        ));

        ladder.resume_escalation();
        assert!(ladder.escalation_paused().is_none());
        assert_eq!(
            ladder.escalation(101.0, &params(), &[]),
            Some(Tier::Two)
        );
    }

    #[test]
    fn test_new_ladder_clears_paused_escalation() {
        let mut ladder = Ladder::new("X", 0);
        open_tier(&mut ladder, Tier::One, 100.0);
        ladder.pause_escalation("rejected");
        ladder.begin_exit(Tier::One, ExitReason::Manual).unwrap();
        ladder
            .close_tier(Tier::One, 100.0, ExitReason::Manual, Utc::now())
            .unwrap();

        open_tier(&mut ladder, Tier::One, 100.0);
        assert!(ladder.escalation_paused().is_none());
    }

    #[test]
    fn test_from_trades_detects_tier_gap() {
        let mut source = Ladder::new("X", 0);
        open_tier(&mut source, Tier::One, 100.0);
        open_tier(&mut source, Tier::Two, 101.0);
        let tier2 = source.trade(Tier::Two).unwrap().clone();

        // Tier 2 without tier 1
        let recovered = Ladder::from_trades("X", vec![tier2]);
        assert!(recovered.halted().is_some());
        assert!(recovered.check_invariants().is_err());

        let recovered = Ladder::from_trades("X", source.trades().to_vec());
        assert!(recovered.halted().is_none());
        assert_eq!(recovered.state(), LadderState::Tier2Open);
        assert_eq!(recovered.seq(), 1);
    }
}
