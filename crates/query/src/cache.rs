//! Query cache manager.
//!
//! Entries hold the last good value of one dataset together with its
//! staleness deadline. Reads never wait on the network: cached data is
//! served immediately and refreshed in the background. At most one fetch is
//! in flight per key; every concurrent requester awaits the same shared
//! future.
//!
//! An entry with at least one consumer runs a refresh driver: a task that
//! refetches on its periodic interval and whenever the entry is
//! invalidated. Entries without consumers are only refreshed on access.
//! Releasing the last consumer evicts the entry and closes its change
//! subscription.
//!
//! A fetch result is dropped only when a local write landed while it ran.
//! An invalidation during a fetch does not void it: the result is stored
//! and the entry stays stale so the driver fetches once more.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bridge::BridgeHandle;
use crate::error::QueryError;
use crate::key::QueryKey;

/// Default periodic refresh for attached entries.
pub const DEFAULT_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

pub type FetchFuture = BoxFuture<'static, Result<Value, QueryError>>;

/// Produces a fresh fetch of an entry's dataset.
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

type SharedFetch = Shared<FetchFuture>;

/// Monotonic id distinguishing an entry from a later one under the same key.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Per-entry timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOptions {
    /// How long fetched data counts as fresh. Zero means "always stale".
    pub stale_time: Duration,
    /// Periodic refresh while the entry has consumers. `None` disables it.
    pub refetch_interval: Option<Duration>,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            refetch_interval: Some(DEFAULT_REFETCH_INTERVAL),
        }
    }
}

/// What an observer sees for one key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    /// Last successfully fetched (or locally set) value.
    pub data: Option<Value>,
    /// A fetch is running and there is no data yet.
    pub is_loading: bool,
    /// Error of the most recent fetch, cleared by the next success.
    pub error: Option<QueryError>,
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

struct InFlight {
    fetch: SharedFetch,
    /// Counters of the entry when the fetch began.
    writes_at_start: u64,
    invalidations_at_start: u64,
}

struct Entry {
    generation: u64,
    fetcher: Fetcher,
    options: EntryOptions,
    data: Option<Value>,
    fetched_at: Option<Instant>,
    invalidated: bool,
    last_error: Option<QueryError>,
    in_flight: Option<InFlight>,
    /// Bumped by every local write.
    writes: u64,
    /// Bumped by every invalidation.
    invalidations: u64,
    consumers: usize,
    wake: Arc<Notify>,
    driver: Option<CancellationToken>,
    /// Change subscription, held while the entry has consumers.
    attachment: Option<BridgeHandle>,
    state_tx: watch::Sender<QueryState>,
}

impl Entry {
    fn new(fetcher: Fetcher, options: EntryOptions) -> Self {
        let (state_tx, _) = watch::channel(QueryState::default());
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            fetcher,
            options,
            data: None,
            fetched_at: None,
            invalidated: false,
            last_error: None,
            in_flight: None,
            writes: 0,
            invalidations: 0,
            consumers: 0,
            wake: Arc::new(Notify::new()),
            driver: None,
            attachment: None,
            state_tx,
        }
    }

    fn is_stale(&self, now: Instant) -> bool {
        if self.invalidated {
            return true;
        }
        match self.fetched_at {
            None => true,
            Some(at) => now.duration_since(at) >= self.options.stale_time,
        }
    }

    fn snapshot(&self) -> QueryState {
        QueryState {
            data: self.data.clone(),
            is_loading: self.in_flight.is_some() && self.data.is_none(),
            error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot());
    }

    /// Whether `fetch` began after the latest local write and invalidation.
    fn is_current(&self, fetch: &InFlight) -> bool {
        fetch.writes_at_start == self.writes && fetch.invalidations_at_start == self.invalidations
    }

    fn wake_driver(&self) {
        if self.consumers > 0 {
            self.wake.notify_one();
        }
    }
}

// ---------------------------------------------------------------------------
// QueryCache
// ---------------------------------------------------------------------------

/// Shared, cloneable handle to the cache. Must be used inside a Tokio
/// runtime: fetches and refresh drivers run as spawned tasks.
#[derive(Clone, Default)]
pub struct QueryCache {
    entries: Arc<Mutex<HashMap<QueryKey, Entry>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state of `key` served from memory, starting a background
    /// refresh when the data is missing or stale. Creates the entry on
    /// first use.
    pub fn get(&self, key: &QueryKey, fetcher: Fetcher, options: EntryOptions) -> QueryState {
        let mut entries = self.lock();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(fetcher, options));

        if entry.in_flight.is_none() && entry.is_stale(Instant::now()) {
            let _ = self.begin_fetch(key, entry);
        }
        entry.snapshot()
    }

    /// Fetch `key` now, joining an in-flight fetch if there is one.
    ///
    /// An in-flight fetch that began before the latest local write or
    /// invalidation is awaited and followed by one more, so the result
    /// always comes from a fetch started after the call. At most one such
    /// fetch is awaited, however busy the entry is.
    pub async fn fetch(&self, key: &QueryKey) -> Result<Value, QueryError> {
        let (fetch, outdated) = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(key)
                .ok_or_else(|| QueryError::UnknownKey(key.clone()))?;
            let outdated = entry
                .in_flight
                .as_ref()
                .is_some_and(|in_flight| !entry.is_current(in_flight));
            (self.begin_fetch(key, entry), outdated)
        };

        let result = fetch.await;
        if !outdated {
            return result;
        }

        // The outdated fetch has completed, so whatever is in flight now
        // started after this call.
        let fetch = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(key)
                .ok_or_else(|| QueryError::UnknownKey(key.clone()))?;
            self.begin_fetch(key, entry)
        };
        fetch.await
    }

    /// Fresh cached data, or the result of an awaited fetch.
    pub async fn ensure(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: EntryOptions,
    ) -> Result<Value, QueryError> {
        {
            let mut entries = self.lock();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(fetcher, options));
            if !entry.is_stale(Instant::now()) {
                if let Some(data) = &entry.data {
                    return Ok(data.clone());
                }
            }
        }
        self.fetch(key).await
    }

    /// Mark `key` stale. Attached entries refetch immediately through their
    /// driver; detached ones wait for the next access. Unknown keys are
    /// ignored.
    pub fn invalidate(&self, key: &QueryKey) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.invalidated = true;
        entry.invalidations += 1;
        entry.wake_driver();
        tracing::debug!(key = %key, consumers = entry.consumers, "Query invalidated");
    }

    /// Replace the cached value locally and notify observers.
    ///
    /// `updater` receives the current value and returns the new one, or
    /// `None` to leave the entry unchanged. Returns the previous value when
    /// a change was made. Unknown keys are ignored.
    pub fn set<F>(&self, key: &QueryKey, updater: F) -> Option<Value>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        let next = updater(entry.data.as_ref())?;
        let previous = entry.data.replace(next);
        entry.writes += 1;
        entry.publish();
        previous
    }

    /// Register a consumer of an existing entry. The first one starts the
    /// refresh driver.
    pub fn acquire(&self, key: &QueryKey) -> Result<(), QueryError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| QueryError::UnknownKey(key.clone()))?;
        self.add_consumer(key, entry);
        Ok(())
    }

    /// [`QueryCache::get`] and [`QueryCache::acquire`] under one lock, so a
    /// concurrent release cannot evict the entry in between. The first
    /// consumer also runs `attach`; its subscription lives until the entry
    /// is evicted. Returns the entry's state receiver.
    pub fn get_and_acquire<A>(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: EntryOptions,
        attach: A,
    ) -> watch::Receiver<QueryState>
    where
        A: FnOnce() -> BridgeHandle,
    {
        let mut entries = self.lock();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(fetcher, options));

        if entry.in_flight.is_none() && entry.is_stale(Instant::now()) {
            let _ = self.begin_fetch(key, entry);
        }
        if entry.attachment.is_none() {
            entry.attachment = Some(attach());
        }
        self.add_consumer(key, entry);
        entry.state_tx.subscribe()
    }

    /// Drop a consumer. Releasing the last one evicts the entry.
    pub fn release(&self, key: &QueryKey) {
        let removed = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.consumers = entry.consumers.saturating_sub(1);
            if entry.consumers > 0 {
                return;
            }
            entries.remove(key)
        };
        if let Some(entry) = removed {
            Self::shut_down(key, entry);
        }
    }

    /// Remove an entry, stop its driver and close its subscription.
    /// Observers see their channel close.
    pub fn evict(&self, key: &QueryKey) {
        let removed = self.lock().remove(key);
        if let Some(entry) = removed {
            Self::shut_down(key, entry);
        }
    }

    /// Observe state changes of `key`.
    pub fn subscribe(&self, key: &QueryKey) -> Option<watch::Receiver<QueryState>> {
        self.lock().get(key).map(|e| e.state_tx.subscribe())
    }

    pub fn state(&self, key: &QueryKey) -> Option<QueryState> {
        self.lock().get(key).map(Entry::snapshot)
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn consumers(&self, key: &QueryKey) -> usize {
        self.lock().get(key).map_or(0, |e| e.consumers)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // -- internals ----------------------------------------------------------

    fn add_consumer(&self, key: &QueryKey, entry: &mut Entry) {
        entry.consumers += 1;
        if entry.driver.is_none() {
            let cancel = CancellationToken::new();
            tokio::spawn(run_refresh_driver(
                self.clone(),
                key.clone(),
                Arc::clone(&entry.wake),
                entry.options.refetch_interval,
                cancel.clone(),
            ));
            entry.driver = Some(cancel);
        }
    }

    fn shut_down(key: &QueryKey, entry: Entry) {
        if let Some(driver) = entry.driver {
            driver.cancel();
        }
        tracing::debug!(key = %key, "Query evicted");
    }

    /// Join the in-flight fetch or start one. The fetch is always driven by
    /// its own task, so it completes even if every awaiter goes away.
    fn begin_fetch(&self, key: &QueryKey, entry: &mut Entry) -> SharedFetch {
        if let Some(in_flight) = &entry.in_flight {
            return in_flight.fetch.clone();
        }

        let generation = entry.generation;
        let request = (entry.fetcher)();
        let cache = self.clone();
        let key = key.clone();

        let fetch: FetchFuture = async move {
            let result = request.await;
            cache.complete_fetch(&key, generation, &result);
            result
        }
        .boxed();
        let fetch = fetch.shared();

        entry.in_flight = Some(InFlight {
            fetch: fetch.clone(),
            writes_at_start: entry.writes,
            invalidations_at_start: entry.invalidations,
        });
        entry.publish();
        tokio::spawn(fetch.clone());

        fetch
    }

    fn complete_fetch(&self, key: &QueryKey, generation: u64, result: &Result<Value, QueryError>) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        let Some(in_flight) = entry.in_flight.take() else {
            return;
        };

        match result {
            Ok(_) if in_flight.writes_at_start != entry.writes => {
                // The response may predate the local write.
                tracing::debug!(key = %key, "Discarding fetch overtaken by a local write");
                entry.invalidated = true;
                entry.wake_driver();
            }
            Ok(value) => {
                entry.data = Some(value.clone());
                entry.fetched_at = Some(Instant::now());
                entry.last_error = None;
                // A change signalled mid-fetch may be missing from `value`.
                entry.invalidated = in_flight.invalidations_at_start != entry.invalidations;
                if entry.invalidated {
                    entry.wake_driver();
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Query fetch failed, keeping previous data");
                entry.last_error = Some(e.clone());
            }
        }
        entry.publish();
    }

    /// Driver hook: refresh an entry that still exists.
    fn refresh(&self, key: &QueryKey) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                let _ = self.begin_fetch(key, entry);
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Refresh driver
// ---------------------------------------------------------------------------

async fn run_refresh_driver(
    cache: QueryCache,
    key: QueryKey,
    wake: Arc<Notify>,
    refetch_interval: Option<Duration>,
    cancel: CancellationToken,
) {
    let mut ticker = refetch_interval.filter(|p| !p.is_zero()).map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    tracing::debug!(key = %key, "Refresh driver started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            _ = next_tick(&mut ticker) => {}
        }
        if !cache.refresh(&key) {
            break;
        }
    }
    tracing::debug!(key = %key, "Refresh driver stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
