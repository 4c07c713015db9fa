//! Consumer-facing query API.
//!
//! [`use_query`] registers a keyed select against the [`QueryClient`]'s
//! store and returns a [`QueryHandle`]. The first handle on a key attaches
//! the entry to the change feed; dropping the last one releases the entry
//! and its subscription.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use vigil_db::{Order, RemoteStore, SelectQuery};
use vigil_events::reconnect::ReconnectConfig;
use vigil_events::ChangeFeed;

use crate::bridge::ChangeFeedBridge;
use crate::cache::{EntryOptions, Fetcher, QueryCache, QueryState, DEFAULT_REFETCH_INTERVAL};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::optimistic;

// ---------------------------------------------------------------------------
// QueryClient
// ---------------------------------------------------------------------------

/// Store, change feed and cache shared by every query of one application.
#[derive(Clone)]
pub struct QueryClient {
    store: Arc<dyn RemoteStore>,
    cache: QueryCache,
    bridge: ChangeFeedBridge,
}

impl QueryClient {
    pub fn new(store: Arc<dyn RemoteStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        let cache = QueryCache::new();
        let bridge = ChangeFeedBridge::new(feed, cache.clone());
        Self {
            store,
            cache,
            bridge,
        }
    }

    /// Backoff used when change subscriptions fail.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.bridge = self.bridge.with_reconnect(reconnect);
        self
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Optimistic write against `key`; see [`optimistic::apply`].
    pub async fn mutate<T, U, W, Fut>(
        &self,
        key: &QueryKey,
        local_update: U,
        remote_write: W,
    ) -> Result<T, QueryError>
    where
        U: FnOnce(Option<&Value>) -> Option<Value>,
        W: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        optimistic::apply(&self.cache, key, local_update, remote_write).await
    }
}

// ---------------------------------------------------------------------------
// QueryOptions
// ---------------------------------------------------------------------------

/// What to select and how fresh to keep it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub table: String,
    /// `*` or a comma-separated column list.
    pub select: String,
    /// One `column=op.value` filter; also narrows the change subscription.
    pub filter: Option<String>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
    pub single: bool,
    pub stale_time: Duration,
    pub refetch_interval: Option<Duration>,
}

impl QueryOptions {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            select: "*".to_string(),
            filter: None,
            order: None,
            limit: None,
            single: false,
            stale_time: Duration::ZERO,
            refetch_interval: Some(DEFAULT_REFETCH_INTERVAL),
        }
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.select = columns.into();
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn single(mut self) -> Self {
        self.single = true;
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn refetch_interval(mut self, interval: Option<Duration>) -> Self {
        self.refetch_interval = interval;
        self
    }

    pub fn to_select(&self) -> SelectQuery {
        let mut query = SelectQuery::new(&self.table).columns(&self.select);
        if let Some(filter) = &self.filter {
            query = query.filter_str(filter);
        }
        if let Some(order) = &self.order {
            query = query.order(order.clone());
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        if self.single {
            query = query.single();
        }
        query
    }

    pub fn entry_options(&self) -> EntryOptions {
        EntryOptions {
            stale_time: self.stale_time,
            refetch_interval: self.refetch_interval,
        }
    }
}

/// Fetcher running `query` against `store`.
pub fn select_fetcher(store: Arc<dyn RemoteStore>, query: SelectQuery) -> Fetcher {
    Arc::new(move || {
        let store = Arc::clone(&store);
        let query = query.clone();
        async move { store.select(&query).await.map_err(QueryError::from) }.boxed()
    })
}

// ---------------------------------------------------------------------------
// use_query / QueryHandle
// ---------------------------------------------------------------------------

/// Attach a consumer to `key`.
///
/// Serves cached data immediately (starting the initial fetch if there is
/// none), keeps the entry refreshed while the handle lives and invalidates
/// it on every matching change event.
pub fn use_query(client: &QueryClient, key: QueryKey, options: QueryOptions) -> QueryHandle {
    let fetcher = select_fetcher(Arc::clone(&client.store), options.to_select());
    let state = client
        .cache
        .get_and_acquire(&key, fetcher, options.entry_options(), || {
            client
                .bridge
                .attach(key.clone(), options.table.clone(), options.filter.clone())
        });

    tracing::debug!(key = %key, table = %options.table, "Query attached");
    QueryHandle {
        key,
        cache: client.cache.clone(),
        state,
    }
}

/// A live consumer of one cache entry.
pub struct QueryHandle {
    key: QueryKey,
    cache: QueryCache,
    state: watch::Receiver<QueryState>,
}

impl QueryHandle {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Latest `{data, is_loading, error}`.
    pub fn state(&self) -> QueryState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn watch(&self) -> watch::Receiver<QueryState> {
        self.state.clone()
    }

    /// Force a fetch now and await it.
    pub async fn refetch(&self) -> Result<Value, QueryError> {
        self.cache.invalidate(&self.key);
        self.cache.fetch(&self.key).await
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.cache.release(&self.key);
        tracing::debug!(key = %self.key, "Query detached");
    }
}
