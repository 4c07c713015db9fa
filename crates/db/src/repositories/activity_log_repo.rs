//! Repository for the append-only `activity_log` table.

use vigil_core::filter::FilterExpression;
use vigil_core::types::DbId;

use crate::error::StoreError;
use crate::models::presence::ActivityLogEntry;
use crate::query::{Order, SelectQuery};
use crate::store::RemoteStore;

pub const ACTIVITY_LOG_TABLE: &str = "activity_log";

/// Appends and lists activity log entries. Entries are never updated.
pub struct ActivityLogRepo;

impl ActivityLogRepo {
    /// Append one entry and return it as stored.
    pub async fn append(
        store: &dyn RemoteStore,
        entry: &ActivityLogEntry,
    ) -> Result<ActivityLogEntry, StoreError> {
        let stored = store.insert(ACTIVITY_LOG_TABLE, entry.to_row()?).await?;
        Ok(serde_json::from_value(stored)?)
    }

    /// Most recent entries for a user, newest first.
    pub async fn list_for_user(
        store: &dyn RemoteStore,
        user_id: DbId,
        limit: usize,
    ) -> Result<Vec<ActivityLogEntry>, StoreError> {
        let query = SelectQuery::new(ACTIVITY_LOG_TABLE)
            .filter(FilterExpression::eq("user_id", user_id.to_string()))
            .order(Order::desc("timestamp"))
            .limit(limit);
        let rows = store.select(&query).await?;
        Ok(serde_json::from_value(rows)?)
    }
}
