//! In-process change bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`ChangeBus`] is the fan-out hub for [`ChangeEvent`]s. Store adapters
//! publish into it after every write; it also implements [`ChangeFeed`], so
//! the query layer can subscribe with a table and filter and receive only
//! the events that concern it.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::change::ChangeEvent;
use crate::feed::{
    subscription_filter, ChangeFeed, FeedError, FeedMessage, Subscription, SubscriptionStatus,
};

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out change bus.
///
/// Designed to be shared via `Arc<ChangeBus>`.
///
/// ```rust
/// use serde_json::json;
/// use vigil_events::{ChangeBus, ChangeEvent, ChangeKind};
///
/// let bus = ChangeBus::default();
/// let mut rx = bus.receiver();
///
/// bus.publish(ChangeEvent::new("presence_records", ChangeKind::Insert, json!({"user_id": 1})));
/// ```
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed events are dropped
    /// and slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current receivers.
    ///
    /// With no receivers the event is silently dropped.
    pub fn publish(&self, event: ChangeEvent) {
        // Ignore the SendError -- it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Raw, unfiltered receiver of every published event.
    pub fn receiver(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Number of live raw receivers (one per open subscription).
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl ChangeFeed for ChangeBus {
    async fn subscribe(&self, table: &str, filter: Option<&str>) -> Result<Subscription, FeedError> {
        let filter = subscription_filter(table, filter);
        let cancel = CancellationToken::new();
        let (sub, tx) = Subscription::channel(table, filter.clone(), cancel.clone());

        let mut events = self.sender.subscribe();
        let table = table.to_string();

        // Fresh channel with spare capacity; cannot fail.
        let _ = tx.try_send(FeedMessage::Status(SubscriptionStatus::Subscribed));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            if !event.concerns(&table, filter.as_ref()) {
                                continue;
                            }
                            if tx.send(FeedMessage::Change(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(table = %table, skipped = n, "Change subscription lagged");
                            let status = SubscriptionStatus::Error(format!("lagged by {n} events"));
                            if tx.send(FeedMessage::Status(status)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = tx.send(FeedMessage::Status(SubscriptionStatus::Closed)).await;
                            break;
                        }
                    },
                }
            }
            tracing::debug!(table = %table, "Change subscription closed");
        });

        Ok(sub)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
