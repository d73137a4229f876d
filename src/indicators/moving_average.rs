/// Smoothing factor k = 2 / (N + 1)
pub fn ema_multiplier(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

/// One exponential smoothing step: EMA_t = price * k + EMA_{t-1} * (1 - k)
pub fn ema_step(previous: f64, price: f64, period: usize) -> f64 {
    let k = ema_multiplier(period);
    price * k + previous * (1.0 - k)
}

/// Calculate Simple Moving Average (SMA) over the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Calculate Exponential Moving Average (EMA), seeded with the SMA of the first period
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let mut ema = calculate_sma(&prices[0..period], period)?;
    for price in &prices[period..] {
        ema = ema_step(ema, *price, period);
    }

    Some(ema)
}

/// Percent deviation of `price` from `average`
pub fn pct_deviation(price: f64, average: f64) -> Option<f64> {
    if average == 0.0 || !average.is_finite() || !price.is_finite() {
        return None;
    }
    Some((price - average) / average * 100.0)
}
