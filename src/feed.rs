//! Broadcast hub backing the reference stores' change feeds.
//!
//! Events published to the hub fan out to every live subscription. A
//! subscription only sees events for its table that pass its row filter.

use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::store::{ChangeEvent, ChangeKind, RowFilter, Table};

/// Default channel capacity for the broadcast channel.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct FeedHub {
    sender: Mutex<Option<broadcast::Sender<ChangeEvent>>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        FeedHub {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Publish an event. Publishing with no subscribers, or after shutdown, is a no-op.
    pub fn publish(&self, event: ChangeEvent) {
        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                let _ = sender.send(event);
            }
        }
    }

    pub fn subscribe(&self, table: Table, filter: Option<RowFilter>) -> StoreResult<Subscription> {
        let guard = self.sender.lock().map_err(|_| StoreError::FeedClosed)?;
        let sender = guard.as_ref().ok_or(StoreError::FeedClosed)?;
        Ok(Subscription {
            table,
            filter,
            receiver: sender.subscribe(),
        })
    }

    /// Drop the sender; every subscription then drains and ends.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            let _ = guard.take();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.receiver_count()))
            .unwrap_or(0)
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to one table. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    table: Table,
    filter: Option<RowFilter>,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn table(&self) -> Table {
        self.table
    }

    /// Wait for the next matching event.
    ///
    /// Returns `None` once the feed has shut down. If the subscriber fell
    /// behind, a synthetic update event stands in for the skipped ones.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.table != self.table {
                        continue;
                    }
                    if self.filter.as_ref().map_or(true, |f| f.matches(&event)) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(table = ?self.table, skipped, "change feed subscriber lagged");
                    return Some(ChangeEvent::new(self.table, ChangeKind::Update));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Explicitly end the subscription.
    pub fn unsubscribe(self) {}
}
