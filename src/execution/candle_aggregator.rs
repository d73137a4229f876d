use crate::indicators::ema_step;
use crate::models::Candle;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
struct SymbolSeries {
    current: Option<Candle>,
    closed: VecDeque<Candle>,
    emas: BTreeMap<usize, f64>,
}

/// Thread-safe candle builder
///
/// Buckets ticks into fixed-width intervals aligned to the epoch, keeps a
/// rolling window of closed candles per symbol and the running EMA state for
/// each configured period.
#[derive(Clone)]
pub struct CandleAggregator {
    data: Arc<RwLock<HashMap<String, SymbolSeries>>>,
    interval_secs: i64,
    periods: Vec<usize>,
    max_candles: usize,
}

impl CandleAggregator {
    /// # Arguments
    /// * `interval` - Candle width (the scan interval)
    /// * `periods` - EMA periods maintained on every close
    /// * `max_candles` - Closed candles kept per symbol
    pub fn new(interval: std::time::Duration, periods: Vec<usize>, max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            interval_secs: interval.as_secs().max(1) as i64,
            periods,
            max_candles: max_candles.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_secs)
    }

    pub fn periods(&self) -> &[usize] {
        &self.periods
    }

    /// Start of the interval containing `ts`
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp().div_euclid(self.interval_secs) * self.interval_secs;
        DateTime::from_timestamp(secs, 0).unwrap_or(ts)
    }

    /// Scan-cycle index of the interval containing `ts`
    pub fn cycle_of(&self, ts: DateTime<Utc>) -> u64 {
        ts.timestamp().div_euclid(self.interval_secs).max(0) as u64
    }

    /// Feed one tick. Returns the candle it closed, if it crossed into a new interval.
    pub fn on_price(&self, symbol: &str, price: f64, ts: DateTime<Utc>) -> Option<Candle> {
        let start = self.bucket_start(ts);
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let series = data.entry(symbol.to_string()).or_default();

        let current_start = series.current.as_ref().map(|c| c.interval_start);
        match current_start {
            Some(cs) if start == cs => {
                if let Some(candle) = series.current.as_mut() {
                    candle.high = candle.high.max(price);
                    candle.low = candle.low.min(price);
                    candle.close = price;
                    candle.volume += 1.0;
                }
                None
            }
            Some(cs) if start < cs => {
                tracing::debug!(symbol, %ts, "Dropped tick for an already closed interval");
                None
            }
            Some(_) => {
                let finished = series.current.take().map(|c| self.finalize(series, c));
                series.current = Some(Self::open_candle(symbol, start, price));
                finished
            }
            None => {
                let late = series
                    .closed
                    .back()
                    .is_some_and(|last| start <= last.interval_start);
                if late {
                    tracing::debug!(symbol, %ts, "Dropped tick for an already closed interval");
                } else {
                    series.current = Some(Self::open_candle(symbol, start, price));
                }
                None
            }
        }
    }

    /// Close every in-progress candle whose interval has ended by `now`
    pub fn close_due(&self, now: DateTime<Utc>) -> Vec<Candle> {
        let interval = self.interval();
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let mut finished = Vec::new();

        for series in data.values_mut() {
            let due = series
                .current
                .as_ref()
                .is_some_and(|c| c.interval_start + interval <= now);
            if due {
                if let Some(candle) = series.current.take() {
                    finished.push(self.finalize(series, candle));
                }
            }
        }

        finished.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        finished
    }

    /// Close a tickless interval at the last known price
    ///
    /// Produces a flat candle (volume 0) starting at `start` and steps the
    /// EMAs with it. Returns `None` when the symbol already has a candle for
    /// that interval or a later one.
    pub fn carry_forward(&self, symbol: &str, start: DateTime<Utc>, price: f64) -> Option<Candle> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        let start = self.bucket_start(start);
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let series = data.entry(symbol.to_string()).or_default();

        let covered = series
            .closed
            .back()
            .is_some_and(|last| last.interval_start >= start)
            || series
                .current
                .as_ref()
                .is_some_and(|c| c.interval_start <= start);
        if covered {
            return None;
        }

        let mut candle = Self::open_candle(symbol, start, price);
        candle.volume = 0.0;
        Some(self.finalize(series, candle))
    }

    /// Restore EMA state from the most recent persisted candle
    pub fn seed(&self, candle: Candle) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let series = data.entry(candle.symbol.clone()).or_default();

        let newer = series
            .closed
            .back()
            .map_or(true, |last| candle.interval_start > last.interval_start);
        if !newer {
            return;
        }

        series.emas = candle.emas.clone();
        tracing::info!(
            symbol = %candle.symbol,
            interval_start = %candle.interval_start,
            periods = candle.emas.len(),
            "Seeded EMA state from persisted candle"
        );
        series.closed.push_back(candle);
        while series.closed.len() > self.max_candles {
            series.closed.pop_front();
        }
    }

    pub fn ema(&self, symbol: &str, period: usize) -> Option<f64> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(symbol).and_then(|s| s.emas.get(&period).copied())
    }

    pub fn last_candle(&self, symbol: &str) -> Option<Candle> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(symbol).and_then(|s| s.closed.back().cloned())
    }

    /// In-progress candle, if any
    pub fn current_candle(&self, symbol: &str) -> Option<Candle> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(symbol).and_then(|s| s.current.clone())
    }

    pub fn candles(&self, symbol: &str) -> Vec<Candle> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(symbol)
            .map(|s| s.closed.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get the N most recent closed candles for a symbol
    pub fn recent_candles(&self, symbol: &str, n: usize) -> Vec<Candle> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(symbol)
            .map(|s| s.closed.iter().rev().take(n).rev().cloned().collect())
            .unwrap_or_default()
    }

    pub fn candle_count(&self, symbol: &str) -> usize {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(symbol).map(|s| s.closed.len()).unwrap_or(0)
    }

    pub fn symbols(&self) -> Vec<String> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let mut symbols: Vec<String> = data.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn clear_symbol(&self, symbol: &str) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.remove(symbol);
    }

    fn open_candle(symbol: &str, start: DateTime<Utc>, price: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval_start: start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1.0,
            emas: BTreeMap::new(),
        }
    }

    fn finalize(&self, series: &mut SymbolSeries, mut candle: Candle) -> Candle {
        for &period in &self.periods {
            let ema = match series.emas.get(&period) {
                Some(&previous) => ema_step(previous, candle.close, period),
                None => candle.close,
            };
            series.emas.insert(period, ema);
        }
        candle.emas = series.emas.clone();

        series.closed.push_back(candle.clone());
        while series.closed.len() > self.max_candles {
            series.closed.pop_front();
        }

        candle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIFTEEN_MIN: std::time::Duration = std::time::Duration::from_secs(900);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn aggregator() -> CandleAggregator {
        CandleAggregator::new(FIFTEEN_MIN, vec![3, 5], 100)
    }

    #[test]
    fn test_ticks_in_same_interval_build_one_candle() {
        let agg = aggregator();

        assert!(agg.on_price("SOL", 100.0, at(0)).is_none());
        assert!(agg.on_price("SOL", 104.0, at(60)).is_none());
        assert!(agg.on_price("SOL", 98.0, at(120)).is_none());
        assert!(agg.on_price("SOL", 101.0, at(899)).is_none());

        let current = agg.current_candle("SOL").unwrap();
        assert_eq!(current.open, 100.0);
        assert_eq!(current.high, 104.0);
        assert_eq!(current.low, 98.0);
        assert_eq!(current.close, 101.0);
        assert_eq!(current.volume, 4.0);
        assert_eq!(agg.candle_count("SOL"), 0);
    }

    #[test]
    fn test_crossing_interval_emits_candle() {
        let agg = aggregator();

        agg.on_price("SOL", 100.0, at(10));
        let closed = agg.on_price("SOL", 110.0, at(900)).unwrap();

        assert_eq!(closed.interval_start, at(0));
        assert_eq!(closed.close, 100.0);
        // First candle seeds every EMA with its close
        assert_eq!(closed.ema(3), Some(100.0));
        assert_eq!(closed.ema(5), Some(100.0));
        assert_eq!(agg.current_candle("SOL").unwrap().interval_start, at(900));
    }

    #[test]
    fn test_ema_smoothing_across_candles() {
        let agg = aggregator();

        agg.on_price("SOL", 100.0, at(0));
        agg.on_price("SOL", 110.0, at(900));
        let second = agg.on_price("SOL", 120.0, at(1800)).unwrap();

        // k = 2 / (3 + 1) = 0.5 -> 110 * 0.5 + 100 * 0.5
        assert_eq!(second.ema(3), Some(105.0));
        // k = 2 / 6 -> 110 / 3 + 100 * 2 / 3
        let expected = 110.0 / 3.0 + 100.0 * 2.0 / 3.0;
        assert!((second.ema(5).unwrap() - expected).abs() < 1e-9);
        assert_eq!(agg.ema("SOL", 3), Some(105.0));
    }

    #[test]
    fn test_late_tick_is_dropped() {
        let agg = aggregator();

        agg.on_price("SOL", 100.0, at(0));
        agg.on_price("SOL", 110.0, at(900));
        assert!(agg.on_price("SOL", 50.0, at(300)).is_none());

        let current = agg.current_candle("SOL").unwrap();
        assert_eq!(current.low, 110.0);
        assert_eq!(agg.candles("SOL")[0].low, 100.0);
    }

    #[test]
    fn test_close_due_finalizes_quiet_symbols() {
        let agg = aggregator();

        agg.on_price("SOL", 100.0, at(10));
        agg.on_price("JUP", 1.0, at(20));

        assert!(agg.close_due(at(899)).is_empty());

        let closed = agg.close_due(at(900));
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].symbol, "JUP");
        assert_eq!(closed[1].symbol, "SOL");
        assert!(agg.current_candle("SOL").is_none());

        // A tick for the interval that was just closed is late
        assert!(agg.on_price("SOL", 99.0, at(890)).is_none());
        assert!(agg.current_candle("SOL").is_none());
    }

    #[test]
    fn test_carry_forward_fills_tickless_interval() {
        let agg = aggregator();
        agg.on_price("SOL", 100.0, at(10));
        agg.on_price("SOL", 102.0, at(20));
        agg.close_due(at(900));

        let carried = agg.carry_forward("SOL", at(900), 102.0).unwrap();
        assert_eq!(carried.interval_start, at(900));
        assert_eq!((carried.open, carried.high, carried.low, carried.close), (102.0, 102.0, 102.0, 102.0));
        assert_eq!(carried.volume, 0.0);
        // First close seeded the EMA at 102, a flat candle keeps it there
        assert_eq!(carried.ema(3), Some(102.0));
        assert_eq!(agg.candle_count("SOL"), 2);

        // Already covered
        assert!(agg.carry_forward("SOL", at(900), 50.0).is_none());
        assert!(agg.carry_forward("SOL", at(0), 50.0).is_none());
        // A tick for the carried interval is late now
        assert!(agg.on_price("SOL", 99.0, at(950)).is_none());
        assert!(agg.current_candle("SOL").is_none());
    }

    #[test]
    fn test_carry_forward_leaves_interval_with_ticks_alone() {
        let agg = aggregator();
        agg.on_price("SOL", 100.0, at(10));

        // In-progress candle covers [0, 900)
        assert!(agg.carry_forward("SOL", at(0), 100.0).is_none());
        // A later interval is still empty and gets filled
        assert!(agg.carry_forward("JUP", at(900), 1.5).is_some());
        assert!(agg.carry_forward("JUP", at(900), f64::NAN).is_none());
    }

    #[test]
    fn test_seed_continues_from_persisted_ema() {
        let agg = aggregator();

        let mut emas = BTreeMap::new();
        emas.insert(3, 200.0);
        emas.insert(5, 190.0);
        agg.seed(Candle {
            symbol: "SOL".to_string(),
            interval_start: at(0),
            open: 200.0,
            high: 200.0,
            low: 200.0,
            close: 200.0,
            volume: 10.0,
            emas,
        });

        agg.on_price("SOL", 210.0, at(900));
        let closed = agg.close_due(at(1800));

        // Continues from the seeded 200, not from zero or from 210
        assert_eq!(closed[0].ema(3), Some(205.0));
    }

    #[test]
    fn test_max_candles_limit() {
        let agg = CandleAggregator::new(FIFTEEN_MIN, vec![3], 5);

        for i in 0..10 {
            agg.on_price("SOL", 100.0 + i as f64, at(i * 900));
        }

        let candles = agg.candles("SOL");
        assert_eq!(candles.len(), 5);
        assert_eq!(candles[0].close, 104.0);
        assert_eq!(candles[4].close, 108.0);

        let recent = agg.recent_candles("SOL", 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].close, 108.0);
    }

    #[test]
    fn test_cycle_index() {
        let agg = aggregator();
        assert_eq!(agg.cycle_of(at(0)), 0);
        assert_eq!(agg.cycle_of(at(899)), 0);
        assert_eq!(agg.cycle_of(at(900)), 1);
        assert_eq!(agg.bucket_start(at(1799)), at(900));
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let agg = aggregator();
        let agg_clone = agg.clone();

        let handle = thread::spawn(move || {
            for i in 0..50 {
                agg_clone.on_price("SOL", 100.0 + i as f64, at(i));
            }
        });

        for i in 0..50 {
            agg.on_price("JUP", 1.0 + i as f64, at(i));
        }

        handle.join().unwrap();

        assert_eq!(agg.current_candle("SOL").unwrap().volume, 50.0);
        assert_eq!(agg.current_candle("JUP").unwrap().volume, 50.0);
    }
}
