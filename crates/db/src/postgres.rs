//! PostgreSQL adapter.
//!
//! [`PgStore`] implements [`RemoteStore`] with dynamically built SQL. Rows
//! cross the boundary as `jsonb`: values are bound as text and converted to
//! each column's declared type through `jsonb_populate_record`, so no value
//! is ever spliced into the SQL text. Table and column names are validated
//! as plain identifiers before use.
//!
//! [`PgChangeFeed`] listens on the [`CHANGE_CHANNEL`] notification channel
//! (fed by the `vigil_notify_change` trigger, see migrations) and republishes
//! each notification on an in-process [`ChangeBus`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgListener;
use tokio_util::sync::CancellationToken;
use vigil_core::filter::{FilterExpression, FilterOperator, FilterValue};
use vigil_events::reconnect::{next_delay, ReconnectConfig};
use vigil_events::{ChangeBus, ChangeEvent, ChangeFeed, FeedError, Subscription};

use crate::error::StoreError;
use crate::query::SelectQuery;
use crate::store::{row_object, validate_identifier, RemoteStore};
use crate::DbPool;

/// Notification channel used by the change trigger.
pub const CHANGE_CHANNEL: &str = "vigil_changes";

// ---------------------------------------------------------------------------
// SQL building
// ---------------------------------------------------------------------------

/// A bind parameter for a generated statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Text(String),
    TextArray(Vec<String>),
    Json(Value),
}

/// Generated statement and its parameters, in `$n` order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

fn sql_operator(op: FilterOperator) -> &'static str {
    match op {
        FilterOperator::Eq | FilterOperator::In => "=",
        FilterOperator::Neq => "<>",
        FilterOperator::Gt => ">",
        FilterOperator::Gte => ">=",
        FilterOperator::Lt => "<",
        FilterOperator::Lte => "<=",
    }
}

/// Render `filters` as a `WHERE` clause on alias `x`, appending bind
/// arguments to `args`.
fn where_clause(
    table: &str,
    filters: &[FilterExpression],
    args: &mut Vec<SqlArg>,
) -> Result<String, StoreError> {
    if filters.is_empty() {
        return Ok(String::new());
    }

    let mut conditions = Vec::with_capacity(filters.len());
    for f in filters {
        validate_identifier(&f.column)?;
        let col = &f.column;
        let n = args.len() + 1;
        let condition = match (&f.operator, &f.value) {
            (FilterOperator::In, FilterValue::Set(values)) => {
                args.push(SqlArg::TextArray(values.clone()));
                format!(
                    "x.{col} IN (SELECT (jsonb_populate_record(NULL::{table}, \
                     jsonb_build_object('{col}', v))).{col} FROM unnest(${n}::text[]) AS v)"
                )
            }
            (op, FilterValue::Single(value)) => {
                args.push(SqlArg::Text(value.clone()));
                format!(
                    "x.{col} {} (jsonb_populate_record(NULL::{table}, \
                     jsonb_build_object('{col}', ${n}::text))).{col}",
                    sql_operator(*op)
                )
            }
            (op, FilterValue::Set(_)) => {
                return Err(StoreError::InvalidRow(format!(
                    "operator '{}' does not accept a value set",
                    op.as_str()
                )));
            }
        };
        conditions.push(condition);
    }

    Ok(format!(" WHERE {}", conditions.join(" AND ")))
}

/// Column names of a JSON row, validated.
fn row_columns(row: &Value) -> Result<Vec<String>, StoreError> {
    let obj = row_object(row)?;
    if obj.is_empty() {
        return Err(StoreError::InvalidRow("row has no columns".to_string()));
    }
    let cols: Vec<String> = obj.keys().cloned().collect();
    for c in &cols {
        validate_identifier(c)?;
    }
    Ok(cols)
}

/// `SELECT` returning a single `jsonb` array of rows.
pub fn build_select(query: &SelectQuery) -> Result<Statement, StoreError> {
    let table = &query.table;
    validate_identifier(table)?;

    let projection = match query.projection() {
        Some(cols) => {
            for c in &cols {
                validate_identifier(c)?;
            }
            cols.iter().map(|c| format!("x.{c}")).collect::<Vec<_>>().join(", ")
        }
        None => "x.*".to_string(),
    };

    let mut args = Vec::new();
    let mut inner = format!("SELECT {projection} FROM {table} AS x");
    inner.push_str(&where_clause(table, &query.filters, &mut args)?);

    if let Some(order) = &query.order {
        validate_identifier(&order.column)?;
        let dir = if order.ascending { "ASC" } else { "DESC" };
        inner.push_str(&format!(" ORDER BY x.{} {dir}", order.column));
    }
    let limit = match (query.limit, query.single) {
        (Some(n), true) => Some(n.min(1)),
        (None, true) => Some(1),
        (limit, false) => limit,
    };
    if let Some(n) = limit {
        inner.push_str(&format!(" LIMIT {n}"));
    }

    Ok(Statement {
        sql: format!("SELECT COALESCE(jsonb_agg(to_jsonb(t)), '[]'::jsonb) FROM ({inner}) AS t"),
        args,
    })
}

/// `INSERT`, optionally `ON CONFLICT ... DO UPDATE`, returning the row.
pub fn build_insert(table: &str, row: &Value, conflict: Option<&[&str]>) -> Result<Statement, StoreError> {
    validate_identifier(table)?;
    let cols = row_columns(row)?;
    let col_list = cols.join(", ");

    let mut sql = format!(
        "INSERT INTO {table} AS x ({col_list}) \
         SELECT {col_list} FROM jsonb_populate_record(NULL::{table}, $1)"
    );

    if let Some(conflict) = conflict {
        if conflict.is_empty() {
            return Err(StoreError::InvalidRow("upsert needs a conflict target".to_string()));
        }
        for c in conflict {
            validate_identifier(c)?;
            if !cols.iter().any(|col| col == c) {
                return Err(StoreError::InvalidRow(format!(
                    "upsert row is missing conflict column '{c}'"
                )));
            }
        }
        let mut assignments: Vec<String> = cols
            .iter()
            .filter(|c| !conflict.contains(&c.as_str()))
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        if assignments.is_empty() {
            // Nothing to merge; a self-assignment still returns the row.
            assignments.push(format!("{0} = EXCLUDED.{0}", conflict[0]));
        }
        sql.push_str(&format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            conflict.join(", "),
            assignments.join(", ")
        ));
    }

    sql.push_str(" RETURNING to_jsonb(x)");
    Ok(Statement {
        sql,
        args: vec![SqlArg::Json(row.clone())],
    })
}

/// `UPDATE ... FROM jsonb_populate_record(...)` returning updated rows.
pub fn build_update(
    table: &str,
    patch: &Value,
    filters: &[FilterExpression],
) -> Result<Statement, StoreError> {
    validate_identifier(table)?;
    let cols = row_columns(patch)?;
    let assignments = cols
        .iter()
        .map(|c| format!("{c} = r.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut args = vec![SqlArg::Json(patch.clone())];
    let mut sql = format!(
        "UPDATE {table} AS x SET {assignments} \
         FROM jsonb_populate_record(NULL::{table}, $1) AS r"
    );
    sql.push_str(&where_clause(table, filters, &mut args)?);
    sql.push_str(" RETURNING to_jsonb(x)");

    Ok(Statement { sql, args })
}

fn bind_all<'q>(
    mut query: sqlx::query::QueryScalar<'q, sqlx::Postgres, Value, sqlx::postgres::PgArguments>,
    args: &'q [SqlArg],
) -> sqlx::query::QueryScalar<'q, sqlx::Postgres, Value, sqlx::postgres::PgArguments> {
    for arg in args {
        query = match arg {
            SqlArg::Text(s) => query.bind(s),
            SqlArg::TextArray(v) => query.bind(v),
            SqlArg::Json(j) => query.bind(j),
        };
    }
    query
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

/// [`RemoteStore`] over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl RemoteStore for PgStore {
    async fn select(&self, query: &SelectQuery) -> Result<Value, StoreError> {
        let stmt = build_select(query)?;
        let rows = bind_all(sqlx::query_scalar::<_, Value>(&stmt.sql), &stmt.args)
            .fetch_one(&self.pool)
            .await?;

        if query.single {
            Ok(rows
                .as_array()
                .and_then(|a| a.first())
                .cloned()
                .unwrap_or(Value::Null))
        } else {
            Ok(rows)
        }
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        let stmt = build_insert(table, &row, None)?;
        let stored = bind_all(sqlx::query_scalar::<_, Value>(&stmt.sql), &stmt.args)
            .fetch_one(&self.pool)
            .await?;
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        patch: Value,
        filters: &[FilterExpression],
    ) -> Result<Vec<Value>, StoreError> {
        let stmt = build_update(table, &patch, filters)?;
        let rows = bind_all(sqlx::query_scalar::<_, Value>(&stmt.sql), &stmt.args)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn upsert(&self, table: &str, row: Value, conflict: &[&str]) -> Result<Value, StoreError> {
        let stmt = build_insert(table, &row, Some(conflict))?;
        let stored = bind_all(sqlx::query_scalar::<_, Value>(&stmt.sql), &stmt.args)
            .fetch_one(&self.pool)
            .await?;
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// PgChangeFeed
// ---------------------------------------------------------------------------

/// Change feed backed by `LISTEN vigil_changes`.
///
/// Created once via [`PgChangeFeed::start`]; the listener task reconnects
/// with exponential backoff until [`PgChangeFeed::shutdown`] is called.
/// While disconnected, [`ChangeFeed::subscribe`] fails so callers fall back
/// to polling and retry.
pub struct PgChangeFeed {
    bus: Arc<ChangeBus>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl PgChangeFeed {
    /// Spawn the listener task.
    pub fn start(pool: DbPool) -> Arc<Self> {
        let feed = Arc::new(Self {
            bus: Arc::new(ChangeBus::default()),
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        });

        let bus = Arc::clone(&feed.bus);
        let connected = Arc::clone(&feed.connected);
        let cancel = feed.cancel.clone();
        tokio::spawn(async move {
            run_listener(pool, bus, connected, cancel).await;
        });

        feed
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop the listener. Open subscriptions see the stream end.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self, table: &str, filter: Option<&str>) -> Result<Subscription, FeedError> {
        if !self.is_connected() {
            return Err(FeedError::Unavailable(
                "notification listener is not connected".to_string(),
            ));
        }
        self.bus.subscribe(table, filter).await
    }
}

async fn run_listener(
    pool: DbPool,
    bus: Arc<ChangeBus>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let config = ReconnectConfig::default();
    let mut delay = config.initial_delay;

    loop {
        match listen_once(&pool, &bus, &connected, &cancel).await {
            Ok(()) => {
                tracing::info!("Change listener stopped");
                return;
            }
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                tracing::error!(error = %e, "Change listener failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = next_delay(delay, &config);
    }
}

/// Listen until cancelled (`Ok`) or the connection fails (`Err`).
async fn listen_once(
    pool: &DbPool,
    bus: &ChangeBus,
    connected: &AtomicBool,
    cancel: &CancellationToken,
) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    connected.store(true, Ordering::SeqCst);
    tracing::info!(channel = CHANGE_CHANNEL, "Change listener connected");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                connected.store(false, Ordering::SeqCst);
                return Ok(());
            }
            notification = listener.recv() => {
                let notification = notification?;
                match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                    Ok(event) => bus.publish(event),
                    Err(e) => {
                        tracing::warn!(error = %e, payload = notification.payload(), "Malformed change notification");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
