// Technical indicators module
// EMA/SMA used by the candle aggregator and ranking

pub mod moving_average;

pub use moving_average::{calculate_ema, calculate_sma, ema_multiplier, ema_step, pct_deviation};
