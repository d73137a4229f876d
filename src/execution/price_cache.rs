use chrono::{DateTime, Duration, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock};

const SHARD_COUNT: usize = 16;

/// Last known price for a symbol
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceEntry {
    pub price: f64,
    pub updated_at: DateTime<Utc>,
}

/// A cached price together with its freshness
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub price: f64,
    pub updated_at: DateTime<Utc>,
    pub stale: bool,
}

/// Thread-safe last-known-price store
///
/// Symbols are spread over independently locked shards so writers for
/// different feeds rarely contend. Each symbol's entry is replaced atomically.
pub struct PriceCache {
    shards: Vec<RwLock<HashMap<String, PriceEntry>>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, symbol: &str) -> &RwLock<HashMap<String, PriceEntry>> {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Store a price unless a newer one is already cached
    ///
    /// Returns true when the update was applied. Equal timestamps overwrite.
    pub fn update(&self, symbol: &str, price: f64, timestamp: DateTime<Utc>) -> bool {
        if !price.is_finite() || price <= 0.0 {
            tracing::warn!(symbol, price, "Rejected invalid price update");
            return false;
        }

        let mut shard = self
            .shard(symbol)
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match shard.get_mut(symbol) {
            Some(entry) if timestamp < entry.updated_at => {
                tracing::debug!(
                    symbol,
                    stored = %entry.updated_at,
                    received = %timestamp,
                    "Ignored out-of-order price update"
                );
                false
            }
            Some(entry) => {
                entry.price = price;
                entry.updated_at = timestamp;
                true
            }
            None => {
                shard.insert(
                    symbol.to_string(),
                    PriceEntry {
                        price,
                        updated_at: timestamp,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.entry(symbol).map(|e| e.price)
    }

    pub fn entry(&self, symbol: &str) -> Option<PriceEntry> {
        self.shard(symbol)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied()
    }

    /// Cached price flagged as stale when older than `max_age` at `now`
    pub fn quote(&self, symbol: &str, now: DateTime<Utc>, max_age: Duration) -> Option<Quote> {
        self.entry(symbol).map(|e| Quote {
            price: e.price,
            updated_at: e.updated_at,
            stale: now - e.updated_at > max_age,
        })
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        let mut prices = HashMap::new();
        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            prices.extend(shard.iter().map(|(k, v)| (k.clone(), v.price)));
        }
        prices
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}
