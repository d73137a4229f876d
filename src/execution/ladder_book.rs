use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;

use super::ladder::{Ladder, LadderPnl, LadderState};
use crate::models::Trade;

/// One symbol's ladder plus the gate serializing its broker operations
///
/// `ladder` is only held for short synchronous mutations and never across an
/// await. `gate` is held for a whole entry/exit/stop sequence so two
/// operations on the same symbol never interleave at the broker.
#[derive(Debug)]
pub struct SymbolSlot {
    ladder: Mutex<Ladder>,
    gate: tokio::sync::Mutex<()>,
}

impl SymbolSlot {
    fn new(ladder: Ladder) -> Self {
        Self {
            ladder: Mutex::new(ladder),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Ladder> {
        self.ladder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }
}

/// Read-only view of one ladder for the query surface
#[derive(Debug, Clone, Serialize)]
pub struct LadderView {
    pub symbol: String,
    pub ladder_seq: u64,
    pub state: LadderState,
    pub halted: Option<String>,
    pub trades: Vec<Trade>,
    pub last_price: Option<f64>,
    pub unrealized: Option<LadderPnl>,
}

/// All ladders, keyed by symbol
#[derive(Debug, Default)]
pub struct LadderBook {
    slots: RwLock<HashMap<String, Arc<SymbolSlot>>>,
    /// Highest ladder sequence known per symbol, seeded from storage
    last_seqs: RwLock<HashMap<String, u64>>,
}

impl LadderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<SymbolSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned()
    }

    /// Slot for `symbol`, creating an empty ladder on first use
    pub fn slot(&self, symbol: &str) -> Arc<SymbolSlot> {
        if let Some(slot) = self.get(symbol) {
            return slot;
        }

        let last_seq = self
            .last_seqs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied()
            .unwrap_or(0);

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(SymbolSlot::new(Ladder::new(symbol, last_seq))))
            .clone()
    }

    /// Install a recovered ladder, replacing any existing slot
    pub fn insert(&self, ladder: Ladder) -> Arc<SymbolSlot> {
        let symbol = ladder.symbol().to_string();
        self.note_seq(&symbol, ladder.seq());
        let slot = Arc::new(SymbolSlot::new(ladder));
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol, slot.clone());
        slot
    }

    /// Record a sequence already used for `symbol` so new ladders never reuse it
    pub fn note_seq(&self, symbol: &str, seq: u64) {
        let mut seqs = self.last_seqs.write().unwrap_or_else(PoisonError::into_inner);
        let entry = seqs.entry(symbol.to_string()).or_insert(0);
        *entry = (*entry).max(seq);
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        symbols.sort();
        symbols
    }

    pub fn slots(&self) -> Vec<(String, Arc<SymbolSlot>)> {
        let mut slots: Vec<_> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(symbol, slot)| (symbol.clone(), slot.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    /// Symbols with at least one live tier
    pub fn active_symbols(&self) -> Vec<String> {
        self.slots()
            .into_iter()
            .filter(|(_, slot)| !slot.lock().is_empty())
            .map(|(symbol, _)| symbol)
            .collect()
    }

    pub fn has_active(&self) -> bool {
        self.slots().iter().any(|(_, slot)| !slot.lock().is_empty())
    }

    /// Snapshot views, pricing open tiers with `price_of`
    pub fn views(&self, price_of: impl Fn(&str) -> Option<f64>) -> Vec<LadderView> {
        self.slots()
            .into_iter()
            .map(|(symbol, slot)| {
                let ladder = slot.lock();
                let last_price = price_of(&symbol);
                LadderView {
                    ladder_seq: ladder.seq(),
                    state: ladder.state(),
                    halted: ladder.halted().map(str::to_string),
                    trades: ladder.trades().to_vec(),
                    unrealized: last_price.map(|p| ladder.unrealized_pnl(p)),
                    last_price,
                    symbol,
                }
            })
            .collect()
    }
}
