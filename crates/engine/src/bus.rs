// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process publish/subscribe for lifecycle events.
//!
//! Delivery is best-effort and never blocks a producer: the channel is
//! bounded and a subscriber that falls behind loses the oldest events,
//! counted per subscription.

use contimg_core::{Event, EventSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast hub for [`Event`]s.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// `capacity` bounds the per-subscriber backlog.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Never blocks; with no subscribers the event
    /// is simply dropped.
    pub fn publish(&self, event: Event) {
        debug!(event = %event.log_summary(), "bus publish");
        let _ = self.tx.send(event);
    }

    /// Open a subscription receiving all events from this point on.
    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            rx: self.tx.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Total events lost across all lagged subscribers.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: &Event) {
        EventBus::publish(self, event.clone());
    }
}

/// One subscriber's view of the bus.
pub struct BusSubscription {
    rx: broadcast::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl BusSubscription {
    /// Next event, skipping over any lost to lag. `None` when the bus
    /// is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event matching `predicate`.
    pub async fn recv_matching(&mut self, predicate: impl Fn(&Event) -> bool) -> Option<Event> {
        loop {
            let event = self.recv().await?;
            if predicate(&event) {
                return Some(event);
            }
        }
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
