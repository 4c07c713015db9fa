//! In-process [`RemoteStore`] with a built-in change feed.
//!
//! [`MemoryStore`] keeps tables as vectors of JSON objects and publishes a
//! [`ChangeEvent`] on its [`ChangeBus`] after every successful write, so it
//! behaves like a tiny multi-writer backend. Failure injection hooks let
//! tests exercise the degraded paths of the cache and presence tracker.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use vigil_core::filter::FilterExpression;
use vigil_events::{ChangeBus, ChangeEvent, ChangeFeed, ChangeKind, FeedError, Subscription};

use crate::error::StoreError;
use crate::query::SelectQuery;
use crate::store::{row_object, RemoteStore};

type Row = Map<String, Value>;

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Row>>,
    writes: HashMap<String, usize>,
    reads: HashMap<String, usize>,
}

/// In-memory store, shared via `Arc<MemoryStore>`.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    bus: Arc<ChangeBus>,
    next_id: AtomicI64,
    failing_writes: AtomicUsize,
    reads_failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_bus(Arc::new(ChangeBus::default()))
    }

    /// Publish change events on an existing bus.
    pub fn with_bus(bus: Arc<ChangeBus>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            bus,
            next_id: AtomicI64::new(1),
            failing_writes: AtomicUsize::new(0),
            reads_failing: AtomicBool::new(false),
        }
    }

    pub fn bus(&self) -> Arc<ChangeBus> {
        Arc::clone(&self.bus)
    }

    /// Make the next `count` writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, AtomicOrdering::SeqCst);
    }

    /// Make every select fail until switched off again.
    pub fn set_reads_failing(&self, failing: bool) {
        self.reads_failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// Snapshot of a table's rows.
    pub async fn rows(&self, table: &str) -> Vec<Value> {
        let tables = self.tables.lock().await;
        tables
            .rows
            .get(table)
            .map(|rows| rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    /// Successful writes (insert, update, upsert) against `table`.
    pub async fn write_count(&self, table: &str) -> usize {
        self.tables.lock().await.writes.get(table).copied().unwrap_or(0)
    }

    /// Successful selects against `table`.
    pub async fn read_count(&self, table: &str) -> usize {
        self.tables.lock().await.reads.get(table).copied().unwrap_or(0)
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let consumed = self
            .failing_writes
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Unavailable("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn assign_id(&self, row: &mut Row) {
        if !row.contains_key("id") {
            let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
            row.insert("id".to_string(), Value::from(id));
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// RemoteStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn select(&self, query: &SelectQuery) -> Result<Value, StoreError> {
        if self.reads_failing.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }

        let mut tables = self.tables.lock().await;
        *tables.reads.entry(query.table.clone()).or_default() += 1;

        let mut matched: Vec<Row> = tables
            .rows
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_all(row, &query.filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(tables);

        if let Some(order) = &query.order {
            matched.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                );
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }

        let projection = query.projection();
        let mut out = matched.into_iter().map(|row| match &projection {
            Some(cols) => Value::Object(
                cols.iter()
                    .filter_map(|c| row.get(*c).map(|v| (c.to_string(), v.clone())))
                    .collect(),
            ),
            None => Value::Object(row),
        });

        if query.single {
            Ok(out.next().unwrap_or(Value::Null))
        } else {
            Ok(Value::Array(out.collect()))
        }
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        self.check_write()?;
        let mut row = row_object(&row)?.clone();
        self.assign_id(&mut row);

        let mut tables = self.tables.lock().await;
        tables.rows.entry(table.to_string()).or_default().push(row.clone());
        *tables.writes.entry(table.to_string()).or_default() += 1;
        drop(tables);

        let stored = Value::Object(row);
        self.bus
            .publish(ChangeEvent::new(table, ChangeKind::Insert, stored.clone()));
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        patch: Value,
        filters: &[FilterExpression],
    ) -> Result<Vec<Value>, StoreError> {
        self.check_write()?;
        let patch = row_object(&patch)?.clone();

        let mut tables = self.tables.lock().await;
        let mut changed = Vec::new();
        if let Some(rows) = tables.rows.get_mut(table) {
            for row in rows.iter_mut().filter(|row| matches_all(row, filters)) {
                let old = row.clone();
                merge(row, &patch);
                changed.push((Value::Object(old), Value::Object(row.clone())));
            }
        }
        if !changed.is_empty() {
            *tables.writes.entry(table.to_string()).or_default() += 1;
        }
        drop(tables);

        let mut updated = Vec::with_capacity(changed.len());
        for (old, new) in changed {
            self.bus.publish(
                ChangeEvent::new(table, ChangeKind::Update, new.clone()).with_old_record(old),
            );
            updated.push(new);
        }
        Ok(updated)
    }

    async fn upsert(&self, table: &str, row: Value, conflict: &[&str]) -> Result<Value, StoreError> {
        self.check_write()?;
        let mut incoming = row_object(&row)?.clone();
        for col in conflict {
            if !incoming.contains_key(*col) {
                return Err(StoreError::InvalidRow(format!(
                    "upsert row is missing conflict column '{col}'"
                )));
            }
        }

        let mut tables = self.tables.lock().await;
        let rows = tables.rows.entry(table.to_string()).or_default();
        let existing = rows
            .iter_mut()
            .find(|r| conflict.iter().all(|c| r.get(*c) == incoming.get(*c)));

        let event = match existing {
            Some(r) => {
                let old = r.clone();
                merge(r, &incoming);
                ChangeEvent::new(table, ChangeKind::Update, Value::Object(r.clone()))
                    .with_old_record(Value::Object(old))
            }
            None => {
                self.assign_id(&mut incoming);
                rows.push(incoming.clone());
                ChangeEvent::new(table, ChangeKind::Insert, Value::Object(incoming))
            }
        };
        *tables.writes.entry(table.to_string()).or_default() += 1;
        drop(tables);

        let stored = event.record.clone();
        self.bus.publish(event);
        Ok(stored)
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(&self, table: &str, filter: Option<&str>) -> Result<Subscription, FeedError> {
        self.bus.subscribe(table, filter).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn matches_all(row: &Row, filters: &[FilterExpression]) -> bool {
    // Filters evaluate against a JSON value; wrapping keeps one code path.
    let value = Value::Object(row.clone());
    filters.iter().all(|f| f.matches(&value))
}

fn merge(row: &mut Row, patch: &Row) {
    for (k, v) in patch {
        row.insert(k.clone(), v.clone());
    }
}

/// Total order for sorting: nulls first, numbers numerically, the rest by
/// their textual form.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}
