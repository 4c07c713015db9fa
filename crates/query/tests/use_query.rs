//! End-to-end tests of `use_query` over the in-memory store:
//! - initial load and change-feed driven refresh
//! - optimistic mutation rollback
//! - re-subscription after a failed change subscription
//! - one change subscription per key, however many handles
//! - teardown on drop

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use vigil_db::{MemoryStore, RemoteStore};
use vigil_events::reconnect::ReconnectConfig;
use vigil_events::{ChangeFeed, FeedError, Subscription};
use vigil_query::{use_query, QueryClient, QueryError, QueryKey, QueryOptions, QueryState};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn wait_for<F>(mut rx: watch::Receiver<QueryState>, pred: F) -> QueryState
where
    F: Fn(&QueryState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            {
                let state = rx.borrow_and_update();
                if pred(&state) {
                    return state.clone();
                }
            }
            rx.changed().await.expect("entry evicted while waiting");
        }
    })
    .await
    .expect("state condition not reached")
}

/// Wait until something is listening on the store's change bus.
async fn wait_for_listener(store: &MemoryStore) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while store.bus().receiver_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no change subscription");
}

fn row_count(state: &QueryState) -> usize {
    state
        .data
        .as_ref()
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert("items", json!({"name": "a"})).await.unwrap();
    store
}

/// Change feed whose first `failures` subscriptions fail.
struct FlakyFeed {
    inner: Arc<MemoryStore>,
    failures: AtomicUsize,
}

#[async_trait]
impl ChangeFeed for FlakyFeed {
    async fn subscribe(&self, table: &str, filter: Option<&str>) -> Result<Subscription, FeedError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(FeedError::Unavailable("socket closed".to_string()));
        }
        self.inner.subscribe(table, filter).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn loads_then_follows_change_events() {
    let store = seeded_store().await;
    let client = QueryClient::new(store.clone(), store.clone());
    let options = QueryOptions::new("items").refetch_interval(None);

    let handle = use_query(&client, QueryKey::new(["items"]), options);
    let state = wait_for(handle.watch(), |s| s.data.is_some()).await;
    assert_eq!(row_count(&state), 1);
    assert!(!state.is_loading);

    wait_for_listener(&store).await;
    store.insert("items", json!({"name": "b"})).await.unwrap();

    let state = wait_for(handle.watch(), |s| row_count(s) == 2).await;
    assert_eq!(state.error, None);
}

#[tokio::test]
async fn filtered_query_ignores_unrelated_changes() {
    let store = seeded_store().await;
    let client = QueryClient::new(store.clone(), store.clone());
    let options = QueryOptions::new("items")
        .filter("name=eq.a")
        .single()
        .refetch_interval(None);

    let handle = use_query(&client, QueryKey::new(["items", "a"]), options);
    let state = wait_for(handle.watch(), |s| s.data.is_some()).await;
    assert_eq!(state.data.unwrap()["name"], "a");

    wait_for_listener(&store).await;
    let reads = store.read_count("items").await;
    store.insert("items", json!({"name": "z"})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.read_count("items").await, reads);
}

#[tokio::test]
async fn failed_mutation_rolls_back_to_server_state() {
    let store = seeded_store().await;
    let client = QueryClient::new(store.clone(), store.clone());
    let key = QueryKey::new(["items"]);
    let handle = use_query(&client, key.clone(), QueryOptions::new("items").refetch_interval(None));
    let before = wait_for(handle.watch(), |s| s.data.is_some()).await;

    store.fail_next_writes(1);
    let writer = store.clone();
    let result: Result<Vec<Value>, QueryError> = client
        .mutate(
            &key,
            |_| Some(json!([{"id": 1, "name": "optimistic"}])),
            || async move {
                writer
                    .update("items", json!({"name": "optimistic"}), &[])
                    .await
                    .map_err(QueryError::mutation)
            },
        )
        .await;

    assert!(result.is_err());
    assert_eq!(handle.state().data, before.data);
}

#[tokio::test]
async fn successful_mutation_is_visible_immediately() {
    let store = seeded_store().await;
    let client = QueryClient::new(store.clone(), store.clone());
    let key = QueryKey::new(["items"]);
    let handle = use_query(&client, key.clone(), QueryOptions::new("items").refetch_interval(None));
    wait_for(handle.watch(), |s| s.data.is_some()).await;

    let mut rx = handle.watch();
    rx.borrow_and_update();
    let writer = store.clone();
    client
        .mutate(
            &key,
            |_| Some(json!([{"id": 1, "name": "renamed"}])),
            || async move {
                writer
                    .update("items", json!({"name": "renamed"}), &[])
                    .await
                    .map_err(QueryError::mutation)
            },
        )
        .await
        .unwrap();

    rx.changed().await.unwrap();
    assert_eq!(rx.borrow().data, Some(json!([{"id": 1, "name": "renamed"}])));
}

#[tokio::test(start_paused = true)]
async fn resubscribes_after_subscription_failure() {
    let store = seeded_store().await;
    let feed = Arc::new(FlakyFeed {
        inner: store.clone(),
        failures: AtomicUsize::new(2),
    });
    let client = QueryClient::new(store.clone(), feed).with_reconnect(ReconnectConfig {
        initial_delay: Duration::from_secs(1),
        ..Default::default()
    });

    let handle = use_query(&client, QueryKey::new(["items"]), QueryOptions::new("items").refetch_interval(None));
    wait_for(handle.watch(), |s| s.data.is_some()).await;

    // Two failures: retries at 1 s (fails) and 1 s + 2 s (succeeds).
    wait_for_listener(&store).await;
    store.insert("items", json!({"name": "b"})).await.unwrap();
    let state = wait_for(handle.watch(), |s| row_count(s) == 2).await;
    assert_eq!(state.error, None);
}

#[tokio::test]
async fn handles_on_one_key_share_a_subscription() {
    let store = seeded_store().await;
    let client = QueryClient::new(store.clone(), store.clone());
    let key = QueryKey::new(["items"]);
    let options = QueryOptions::new("items").refetch_interval(None);

    let first = use_query(&client, key.clone(), options.clone());
    let second = use_query(&client, key.clone(), options);
    wait_for(first.watch(), |s| s.data.is_some()).await;
    wait_for_listener(&store).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client.cache().consumers(&key), 2);
    assert_eq!(store.bus().receiver_count(), 1);

    // The subscription outlives the first handle.
    drop(first);
    store.insert("items", json!({"name": "b"})).await.unwrap();
    let state = wait_for(second.watch(), |s| row_count(s) == 2).await;
    assert_eq!(state.error, None);
    assert_eq!(store.bus().receiver_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handle_attached_while_another_drops_still_loads() {
    let store = seeded_store().await;
    let client = QueryClient::new(store.clone(), store.clone());
    let key = QueryKey::new(["items"]);
    let options = QueryOptions::new("items").refetch_interval(None);

    for _ in 0..50 {
        let leaving = use_query(&client, key.clone(), options.clone());
        let dropper = tokio::spawn(async move { drop(leaving) });
        let joining = use_query(&client, key.clone(), options.clone());
        dropper.await.unwrap();

        let state = wait_for(joining.watch(), |s| s.data.is_some()).await;
        assert_eq!(row_count(&state), 1);
        assert_eq!(client.cache().consumers(&key), 1);
    }
}

#[tokio::test]
async fn dropping_the_handle_tears_down() {
    let store = seeded_store().await;
    let client = QueryClient::new(store.clone(), store.clone());
    let key = QueryKey::new(["items"]);

    let handle = use_query(&client, key.clone(), QueryOptions::new("items"));
    wait_for(handle.watch(), |s| s.data.is_some()).await;
    wait_for_listener(&store).await;
    assert_eq!(client.cache().consumers(&key), 1);

    drop(handle);
    assert!(!client.cache().contains(&key));

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.bus().receiver_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscription still open");
}
