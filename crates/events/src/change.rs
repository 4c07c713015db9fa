//! Row-level change notifications.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_core::filter::FilterExpression;
use vigil_core::types::Timestamp;

/// What happened to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single insert/update/delete notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,

    #[serde(rename = "type")]
    pub kind: ChangeKind,

    /// The row after the change. `Null` for deletes.
    #[serde(default)]
    pub record: Value,

    /// The row before the change, when the source provides it.
    #[serde(default)]
    pub old_record: Option<Value>,

    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind, record: Value) -> Self {
        Self {
            table: table.into(),
            kind,
            record,
            old_record: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_old_record(mut self, old: Value) -> Self {
        self.old_record = Some(old);
        self
    }

    /// Whether a subscriber on `table` with `filter` should see this event.
    ///
    /// Either the new or the old row may satisfy the filter, so a row moving
    /// out of a filtered set (or being deleted) still notifies.
    pub fn concerns(&self, table: &str, filter: Option<&FilterExpression>) -> bool {
        if self.table != table {
            return false;
        }
        match filter {
            None => true,
            Some(f) => {
                f.matches(&self.record) || self.old_record.as_ref().is_some_and(|old| f.matches(old))
            }
        }
    }
}
