//! Filtered change subscriptions.
//!
//! A [`ChangeFeed`] hands out [`Subscription`]s scoped to one table and an
//! optional filter string in the `column=op.value` mini-language. The
//! subscription first reports a [`SubscriptionStatus`], then yields every
//! matching [`ChangeEvent`]. Dropping the subscription releases the
//! underlying listener.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;
use vigil_core::filter::{parse_filter, FilterExpression};

use crate::change::ChangeEvent;

/// Buffered messages per subscription before the producer waits.
pub const SUBSCRIPTION_BUFFER: usize = 64;

/// Transport-level state of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Subscribed,
    Error(String),
    TimedOut,
    Closed,
}

impl SubscriptionStatus {
    /// Whether the subscription can no longer deliver events.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Subscribed)
    }
}

/// One item delivered on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Status(SubscriptionStatus),
    Change(ChangeEvent),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("Change feed unavailable: {0}")]
    Unavailable(String),

    #[error("Subscription setup timed out")]
    TimedOut,
}

/// Source of filtered change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription on `table`, optionally narrowed by `filter`.
    async fn subscribe(&self, table: &str, filter: Option<&str>) -> Result<Subscription, FeedError>;
}

/// Parse a subscription filter, logging when it degrades to "no filter".
pub fn subscription_filter(table: &str, filter: Option<&str>) -> Option<FilterExpression> {
    let raw = filter?;
    let parsed = parse_filter(raw);
    if parsed.is_none() {
        tracing::warn!(table, filter = raw, "Unparseable subscription filter, subscribing unfiltered");
    }
    parsed
}

/// A live change subscription.
///
/// Owns the receiving half of the delivery channel and a guard that cancels
/// the producer when the subscription is dropped.
pub struct Subscription {
    id: Uuid,
    table: String,
    filter: Option<FilterExpression>,
    rx: mpsc::Receiver<FeedMessage>,
    _guard: DropGuard,
}

impl Subscription {
    /// Create a subscription and the sender its producer should use.
    ///
    /// `cancel` is triggered when the subscription is dropped; producers
    /// should stop on it.
    pub fn channel(
        table: impl Into<String>,
        filter: Option<FilterExpression>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<FeedMessage>) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let sub = Self {
            id: Uuid::new_v4(),
            table: table.into(),
            filter,
            rx,
            _guard: cancel.drop_guard(),
        };
        (sub, tx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter(&self) -> Option<&FilterExpression> {
        self.filter.as_ref()
    }

    /// Next message, or `None` once the producer has gone away.
    pub async fn next(&mut self) -> Option<FeedMessage> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("filter", &self.filter)
            .finish()
    }
}
