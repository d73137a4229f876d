use crate::config::StrategyConfig;
use crate::indicators::pct_deviation;
use crate::models::{Candle, RankScore};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RankError {
    /// sqrt(g1 * g2) has no real value when a growth factor is negative
    #[error("geometric mean undefined for {symbol}: pct_a={pct_a}, pct_b={pct_b}")]
    UndefinedGeometricMean {
        symbol: String,
        pct_a: f64,
        pct_b: f64,
    },

    #[error("{symbol} candle is missing EMA({period})")]
    MissingIndicator { symbol: String, period: usize },

    #[error("non-finite rank input for {symbol}")]
    NonFinite { symbol: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingParams {
    pub accel_weight: f64,
    pub min_threshold: f64,
    pub short_period: usize,
    pub long_period: usize,
}

impl RankingParams {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            accel_weight: cfg.accel_weight,
            min_threshold: cfg.min_rank_threshold,
            short_period: cfg.ema_short_period,
            long_period: cfg.ema_long_period,
        }
    }
}

impl Default for RankingParams {
    fn default() -> Self {
        Self {
            accel_weight: 0.3,
            min_threshold: 2.5,
            short_period: 20,
            long_period: 50,
        }
    }
}

/// Geometric-mean momentum score of two percent deviations
///
/// Fails when either growth factor `1 + pct/100` is negative.
pub fn rank_gm(symbol: &str, pct_a: f64, pct_b: f64) -> Result<f64, RankError> {
    if !pct_a.is_finite() || !pct_b.is_finite() {
        return Err(RankError::NonFinite {
            symbol: symbol.to_string(),
        });
    }

    let g1 = 1.0 + pct_a / 100.0;
    let g2 = 1.0 + pct_b / 100.0;
    if g1 < 0.0 || g2 < 0.0 {
        return Err(RankError::UndefinedGeometricMean {
            symbol: symbol.to_string(),
            pct_a,
            pct_b,
        });
    }

    Ok(((g1 * g2).sqrt() - 1.0) * 100.0)
}

pub fn rank_final(rank_gm: f64, acceleration: f64, accel_weight: f64) -> f64 {
    rank_gm + accel_weight * acceleration
}

#[derive(Debug, Default)]
struct SymbolRank {
    /// rank_gm by scan-cycle index, only the latest two cycles are retained
    by_cycle: BTreeMap<u64, f64>,
    current: Option<RankScore>,
}

/// Per-symbol momentum scoring with a one-cycle lag term
pub struct RankingEngine {
    params: RwLock<RankingParams>,
    ranks: RwLock<HashMap<String, SymbolRank>>,
}

impl RankingEngine {
    pub fn new(params: RankingParams) -> Self {
        Self {
            params: RwLock::new(params),
            ranks: RwLock::new(HashMap::new()),
        }
    }

    pub fn params(&self) -> RankingParams {
        *self.params.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the parameters; only called between scan cycles
    pub fn set_params(&self, params: RankingParams) {
        *self.params.write().unwrap_or_else(PoisonError::into_inner) = params;
    }

    /// Score `symbol` for scan cycle `cycle`
    ///
    /// The lag term uses the rank from cycle `cycle - 1` only. When that cycle
    /// was skipped there is no previous value and acceleration is zero.
    pub fn evaluate(
        &self,
        symbol: &str,
        pct_a: f64,
        pct_b: f64,
        cycle: u64,
        stale: bool,
        now: DateTime<Utc>,
    ) -> Result<RankScore, RankError> {
        let params = self.params();
        let gm = rank_gm(symbol, pct_a, pct_b)?;

        let mut ranks = self.ranks.write().unwrap_or_else(PoisonError::into_inner);
        let entry = ranks.entry(symbol.to_string()).or_default();

        let previous = cycle
            .checked_sub(1)
            .and_then(|prev| entry.by_cycle.get(&prev).copied());
        let acceleration = previous.map_or(0.0, |p| gm - p);
        let final_score = rank_final(gm, acceleration, params.accel_weight);

        entry.by_cycle.insert(cycle, gm);
        while entry.by_cycle.len() > 2 {
            entry.by_cycle.pop_first();
        }

        let score = RankScore {
            symbol: symbol.to_string(),
            cycle,
            rank_gm: gm,
            rank_gm_previous: previous,
            acceleration,
            rank_final: final_score,
            passes_filter: final_score >= params.min_threshold,
            stale,
            computed_at: now,
        };

        tracing::debug!(
            symbol,
            cycle,
            rank_gm = gm,
            acceleration,
            rank_final = final_score,
            passes = score.passes_filter,
            "Ranked symbol"
        );

        entry.current = Some(score.clone());
        Ok(score)
    }

    /// Score a closed candle against its short and long EMAs
    pub fn evaluate_candle(
        &self,
        candle: &Candle,
        cycle: u64,
        stale: bool,
        now: DateTime<Utc>,
    ) -> Result<RankScore, RankError> {
        let params = self.params();
        let deviation = |period: usize| {
            let ema = candle.ema(period).ok_or_else(|| RankError::MissingIndicator {
                symbol: candle.symbol.clone(),
                period,
            })?;
            pct_deviation(candle.close, ema).ok_or_else(|| RankError::NonFinite {
                symbol: candle.symbol.clone(),
            })
        };

        let pct_a = deviation(params.short_period)?;
        let pct_b = deviation(params.long_period)?;
        self.evaluate(&candle.symbol, pct_a, pct_b, cycle, stale, now)
    }

    pub fn score(&self, symbol: &str) -> Option<RankScore> {
        let ranks = self.ranks.read().unwrap_or_else(PoisonError::into_inner);
        ranks.get(symbol).and_then(|r| r.current.clone())
    }

    /// Current score table, best `rank_final` first
    pub fn scores(&self) -> Vec<RankScore> {
        let ranks = self.ranks.read().unwrap_or_else(PoisonError::into_inner);
        let mut scores: Vec<RankScore> =
            ranks.values().filter_map(|r| r.current.clone()).collect();
        scores.sort_by(|a, b| {
            b.rank_final
                .total_cmp(&a.rank_final)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        scores
    }

    /// Scores of `cycle` that pass the entry filter, best first
    pub fn candidates(&self, cycle: u64) -> Vec<RankScore> {
        self.scores()
            .into_iter()
            .filter(|s| s.cycle == cycle && s.passes_filter)
            .collect()
    }
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self::new(RankingParams::default())
    }
}
