use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::broker::BrokerEvent;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Channel at capacity; the event is handed back to the producer
    #[error("event channel full")]
    Full(BrokerEvent),

    #[error("event channel closed")]
    Closed(BrokerEvent),
}

impl PublishError {
    pub fn into_event(self) -> BrokerEvent {
        match self {
            PublishError::Full(event) | PublishError::Closed(event) => event,
        }
    }
}

/// Producer side of the broker event channel
///
/// Never blocks. A full channel returns the event so the producer keeps it
/// and delivers it again later; nothing is silently dropped.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<BrokerEvent>,
    backpressure: Arc<AtomicU64>,
}

impl EventPublisher {
    pub fn publish(&self, event: BrokerEvent) -> Result<(), PublishError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                let hits = self.backpressure.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    client_key = %event.client_key,
                    hits,
                    "Event channel full, producer keeps event for redelivery"
                );
                Err(PublishError::Full(event))
            }
            Err(mpsc::error::TrySendError::Closed(event)) => Err(PublishError::Closed(event)),
        }
    }

    /// Times a publish found the channel full
    pub fn backpressure_count(&self) -> u64 {
        self.backpressure.load(Ordering::Relaxed)
    }
}

pub fn event_channel(capacity: usize) -> (EventPublisher, mpsc::Receiver<BrokerEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventPublisher {
            tx,
            backpressure: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Ordered buffer of events a producer could not hand off yet
#[derive(Debug)]
pub struct EventOutbox {
    publisher: EventPublisher,
    pending: Mutex<VecDeque<BrokerEvent>>,
}

impl EventOutbox {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            publisher,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue `event` behind anything already pending, then try to deliver
    pub fn push(&self, event: BrokerEvent) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
        self.flush();
    }

    /// Deliver pending events in order until the channel pushes back.
    /// Returns how many were delivered.
    pub fn flush(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;

        while let Some(event) = pending.pop_front() {
            match self.publisher.publish(event) {
                Ok(()) => delivered += 1,
                Err(PublishError::Full(event)) => {
                    pending.push_front(event);
                    break;
                }
                Err(PublishError::Closed(event)) => {
                    tracing::error!(
                        client_key = %event.client_key,
                        "Event channel closed, event kept in outbox"
                    );
                    pending.push_front(event);
                    break;
                }
            }
        }

        delivered
    }

    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }
}
