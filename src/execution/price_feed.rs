use crate::api::QuoteSource;
use crate::models::PriceTick;
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Producer side of the tick channel
///
/// Never blocks the feed. When the consumer falls behind the newest tick is
/// dropped with a warning; the next quote for the symbol supersedes it.
#[derive(Debug, Clone)]
pub struct TickSender {
    tx: mpsc::Sender<PriceTick>,
    dropped: Arc<AtomicU64>,
}

impl TickSender {
    /// Returns false if the tick was not queued
    pub fn send(&self, tick: PriceTick) -> bool {
        match self.tx.try_send(tick) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(tick)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(symbol = %tick.symbol, dropped, "Tick channel full, dropping tick");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn tick_channel(capacity: usize) -> (TickSender, mpsc::Receiver<PriceTick>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        TickSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Polls a quote source for the watched symbols and pushes ticks downstream
pub struct PriceFeedManager {
    source: Arc<dyn QuoteSource>,
    symbols: Vec<String>,
    sender: TickSender,
}

impl PriceFeedManager {
    pub fn new(source: Arc<dyn QuoteSource>, symbols: Vec<String>, sender: TickSender) -> Self {
        Self {
            source,
            symbols,
            sender,
        }
    }

    /// Fetch once and queue every tick. Returns how many were queued.
    pub async fn poll_once(&self) -> Result<usize> {
        if self.symbols.is_empty() {
            return Ok(0);
        }

        let ticks = self.source.fetch_quotes(&self.symbols).await?;
        let total = ticks.len();
        let queued = ticks
            .into_iter()
            .filter(|tick| self.sender.send(tick.clone()))
            .count();

        tracing::debug!(total, queued, "Polled quotes");
        Ok(queued)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }
}
