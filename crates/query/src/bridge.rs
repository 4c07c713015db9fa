//! Change-feed bridge.
//!
//! Keeps one change subscription per live cache entry and turns every
//! insert, update or delete it delivers into [`QueryCache::invalidate`].
//! Event payloads are never merged into the cache; the entry's refresh
//! driver refetches instead.
//!
//! When a subscription fails the bridge logs it and keeps retrying with
//! exponential backoff. Meanwhile the entry's periodic refresh keeps the
//! data moving, so a dead push channel only costs latency. After a
//! successful re-subscribe the key is invalidated once, since events may
//! have been missed in between.

use std::sync::Arc;

use tokio_util::sync::{CancellationToken, DropGuard};
use vigil_events::reconnect::{resubscribe_loop, ReconnectConfig};
use vigil_events::{ChangeFeed, FeedMessage, Subscription, SubscriptionStatus};

use crate::cache::QueryCache;
use crate::key::QueryKey;

/// Attaches cache keys to a [`ChangeFeed`].
#[derive(Clone)]
pub struct ChangeFeedBridge {
    feed: Arc<dyn ChangeFeed>,
    cache: QueryCache,
    reconnect: ReconnectConfig,
}

/// Live attachment, owned by the cache entry it feeds. Dropping it closes
/// the subscription.
pub struct BridgeHandle {
    _guard: DropGuard,
}

impl ChangeFeedBridge {
    pub fn new(feed: Arc<dyn ChangeFeed>, cache: QueryCache) -> Self {
        Self {
            feed,
            cache,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Subscribe to `table` (narrowed by `filter`) on behalf of `key`.
    /// Called once per entry, by [`QueryCache::get_and_acquire`].
    pub fn attach(&self, key: QueryKey, table: String, filter: Option<String>) -> BridgeHandle {
        let cancel = CancellationToken::new();
        tokio::spawn(run_bridge(
            Arc::clone(&self.feed),
            self.cache.clone(),
            key,
            table,
            filter,
            self.reconnect.clone(),
            cancel.clone(),
        ));
        BridgeHandle {
            _guard: cancel.drop_guard(),
        }
    }
}

async fn run_bridge(
    feed: Arc<dyn ChangeFeed>,
    cache: QueryCache,
    key: QueryKey,
    table: String,
    filter: Option<String>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut pending = tokio::select! {
        _ = cancel.cancelled() => return,
        result = feed.subscribe(&table, filter.as_deref()) => match result {
            Ok(sub) => Some(sub),
            Err(e) => {
                tracing::warn!(key = %key, table = %table, error = %e, "Change subscription failed, relying on polling");
                None
            }
        },
    };

    loop {
        let subscription = match pending.take() {
            Some(sub) => sub,
            None => {
                let Some(sub) =
                    resubscribe_loop(feed.as_ref(), &table, filter.as_deref(), &reconnect, &cancel)
                        .await
                else {
                    break;
                };
                cache.invalidate(&key);
                sub
            }
        };

        tracing::debug!(key = %key, table = %table, subscription = %subscription.id(), "Change subscription attached");
        if !pump(subscription, &cache, &key, &cancel).await {
            break;
        }
    }
    tracing::debug!(key = %key, table = %table, "Change subscription detached");
}

/// Forward events until the subscription fails (`true`) or the bridge is
/// cancelled (`false`).
async fn pump(
    mut subscription: Subscription,
    cache: &QueryCache,
    key: &QueryKey,
    cancel: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            message = subscription.next() => match message {
                Some(FeedMessage::Change(event)) => {
                    tracing::debug!(key = %key, table = %event.table, kind = ?event.kind, "Change received");
                    cache.invalidate(key);
                }
                Some(FeedMessage::Status(SubscriptionStatus::Subscribed)) => {}
                Some(FeedMessage::Status(status)) => {
                    tracing::warn!(key = %key, table = subscription.table(), status = ?status, "Change subscription failed, relying on polling");
                    return true;
                }
                None => {
                    tracing::warn!(key = %key, table = subscription.table(), "Change subscription closed, relying on polling");
                    return true;
                }
            },
        }
    }
}
