//! Presence record and activity log models.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vigil_core::presence::{activity_types, PresenceStatus, AUTO_LOGOUT_REASON};
use vigil_core::types::{DbId, Timestamp};

use crate::error::StoreError;

// ---------------------------------------------------------------------------
// PresenceRecord
// ---------------------------------------------------------------------------

/// A row from the `presence_records` table. One per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<DbId>,
    pub user_id: DbId,
    pub current_status: PresenceStatus,
    pub last_activity_at: Timestamp,
    pub session_start_at: Timestamp,
    /// Four digits while an away status is active, otherwise `None`.
    #[serde(default)]
    pub reactivation_code: Option<String>,
    pub updated_at: Timestamp,
}

impl PresenceRecord {
    /// A fresh `online` record for a session starting at `at`.
    pub fn new_session(user_id: DbId, at: Timestamp) -> Self {
        Self {
            id: None,
            user_id,
            current_status: PresenceStatus::Online,
            last_activity_at: at,
            session_start_at: at,
            reactivation_code: None,
            updated_at: at,
        }
    }

    /// Decode a row returned by the store. `null` means "no record".
    pub fn from_row(row: &Value) -> Result<Option<Self>, StoreError> {
        if row.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(row.clone())?))
    }

    pub fn to_row(&self) -> Result<Value, StoreError> {
        Ok(serde_json::to_value(self)?)
    }
}

// ---------------------------------------------------------------------------
// ActivityLogEntry
// ---------------------------------------------------------------------------

/// An append-only row of the `activity_log` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<DbId>,
    pub user_id: DbId,
    pub activity_type: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ActivityLogEntry {
    fn new(user_id: DbId, activity_type: &str, timestamp: Timestamp, metadata: Option<Value>) -> Self {
        Self {
            id: None,
            user_id,
            activity_type: activity_type.to_string(),
            timestamp,
            metadata,
        }
    }

    pub fn session_start(user_id: DbId, at: Timestamp) -> Self {
        Self::new(user_id, activity_types::SESSION_START, at, None)
    }

    pub fn status_change(
        user_id: DbId,
        from: PresenceStatus,
        to: PresenceStatus,
        at: Timestamp,
    ) -> Self {
        let metadata = json!({ "from": from, "to": to });
        Self::new(user_id, activity_types::STATUS_CHANGE, at, Some(metadata))
    }

    /// Forced logout after prolonged inactivity.
    pub fn auto_logout(user_id: DbId, at: Timestamp) -> Self {
        let metadata = json!({ "reason": AUTO_LOGOUT_REASON });
        Self::new(user_id, activity_types::LOGOUT, at, Some(metadata))
    }

    pub fn reactivated(user_id: DbId, from: PresenceStatus, at: Timestamp) -> Self {
        let metadata = json!({ "from": from });
        Self::new(user_id, activity_types::REACTIVATED, at, Some(metadata))
    }

    pub fn to_row(&self) -> Result<Value, StoreError> {
        Ok(serde_json::to_value(self)?)
    }
}
