//! Repository for the `presence_records` table.
//!
//! Every write goes through [`PresenceUpdate`]: the same value is merged
//! into a local copy (for optimistic cache updates) and turned into an
//! upsert or conditional update against the store, so the two sides apply
//! identical rules. Conditional updates filter on the status the writer
//! expects; a write that lost a race matches no row and returns `None`.

use serde_json::{json, Value};
use vigil_core::filter::FilterExpression;
use vigil_core::presence::PresenceStatus;
use vigil_core::types::{DbId, Timestamp};

use crate::error::StoreError;
use crate::models::presence::PresenceRecord;
use crate::query::SelectQuery;
use crate::store::RemoteStore;

pub const PRESENCE_TABLE: &str = "presence_records";

/// Conflict target for session-start upserts.
const CONFLICT_COLUMNS: &[&str] = &["user_id"];

// ---------------------------------------------------------------------------
// PresenceUpdate
// ---------------------------------------------------------------------------

/// A single permitted change to a presence record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// Overwrite the record with a fresh `online` session.
    StartSession { at: Timestamp },
    /// Advance the last-activity timestamp. Never changes the status, and
    /// does nothing when `at` is not newer or the user was logged out.
    Touch { at: Timestamp },
    /// Move from `from` to `to`, storing `code` (cleared when `None`).
    /// Refused when `from` is sticky.
    Transition {
        from: PresenceStatus,
        to: PresenceStatus,
        code: Option<String>,
        at: Timestamp,
    },
    /// Return to `online` after a correct code from `afk` or `resting`.
    Reactivate { code: String, at: Timestamp },
    /// Enter or leave `coffee_break`. Set by collaborators outside the
    /// state machine.
    CoffeeBreak { active: bool, at: Timestamp },
}

impl PresenceUpdate {
    /// Merge into a local copy. Returns `false` when the update does not
    /// apply to the record's current state.
    pub fn apply_to(&self, record: &mut PresenceRecord) -> bool {
        match self {
            Self::StartSession { at } => {
                let id = record.id;
                *record = PresenceRecord::new_session(record.user_id, *at);
                record.id = id;
                true
            }
            Self::Touch { at } => {
                if record.current_status.is_terminal() || *at <= record.last_activity_at {
                    return false;
                }
                record.last_activity_at = *at;
                record.updated_at = *at;
                true
            }
            Self::Transition { from, to, code, at } => {
                if from.is_sticky() || record.current_status != *from {
                    return false;
                }
                record.current_status = *to;
                record.reactivation_code = code.clone();
                record.updated_at = *at;
                true
            }
            Self::Reactivate { code, at } => {
                if !record.current_status.can_reactivate()
                    || record.reactivation_code.as_deref() != Some(code.as_str())
                {
                    return false;
                }
                record.current_status = PresenceStatus::Online;
                record.last_activity_at = *at;
                record.reactivation_code = None;
                record.updated_at = *at;
                true
            }
            Self::CoffeeBreak { active: true, at } => {
                if record.current_status.is_terminal() {
                    return false;
                }
                record.current_status = PresenceStatus::CoffeeBreak;
                record.reactivation_code = None;
                record.updated_at = *at;
                true
            }
            Self::CoffeeBreak { active: false, at } => {
                if record.current_status != PresenceStatus::CoffeeBreak {
                    return false;
                }
                record.current_status = PresenceStatus::Online;
                record.last_activity_at = *at;
                record.updated_at = *at;
                true
            }
        }
    }

    /// Patch and row filters for the conditional update. `None` for
    /// [`PresenceUpdate::StartSession`], which is an upsert.
    fn conditional_patch(&self, user_id: DbId) -> Option<(Value, Vec<FilterExpression>)> {
        let mut filters = vec![FilterExpression::eq("user_id", user_id.to_string())];
        let patch = match self {
            Self::StartSession { .. } => return None,
            Self::Touch { at } => {
                filters.push(FilterExpression::lt("last_activity_at", at.to_rfc3339()));
                filters.push(FilterExpression::neq(
                    "current_status",
                    PresenceStatus::Sleeping.as_str(),
                ));
                json!({
                    "last_activity_at": at,
                    "updated_at": at,
                })
            }
            Self::Transition { from, to, code, at } => {
                filters.push(FilterExpression::eq("current_status", from.as_str()));
                json!({
                    "current_status": to,
                    "reactivation_code": code,
                    "updated_at": at,
                })
            }
            Self::Reactivate { code, at } => {
                filters.push(FilterExpression::one_of(
                    "current_status",
                    [PresenceStatus::Afk.as_str(), PresenceStatus::Resting.as_str()],
                ));
                filters.push(FilterExpression::eq("reactivation_code", code.as_str()));
                json!({
                    "current_status": PresenceStatus::Online,
                    "last_activity_at": at,
                    "reactivation_code": Value::Null,
                    "updated_at": at,
                })
            }
            Self::CoffeeBreak { active: true, at } => {
                filters.push(FilterExpression::neq(
                    "current_status",
                    PresenceStatus::Sleeping.as_str(),
                ));
                json!({
                    "current_status": PresenceStatus::CoffeeBreak,
                    "reactivation_code": Value::Null,
                    "updated_at": at,
                })
            }
            Self::CoffeeBreak { active: false, at } => {
                filters.push(FilterExpression::eq(
                    "current_status",
                    PresenceStatus::CoffeeBreak.as_str(),
                ));
                json!({
                    "current_status": PresenceStatus::Online,
                    "last_activity_at": at,
                    "updated_at": at,
                })
            }
        };
        Some((patch, filters))
    }
}

// ---------------------------------------------------------------------------
// PresenceRepo
// ---------------------------------------------------------------------------

/// Owns all reads and writes of presence records.
pub struct PresenceRepo;

impl PresenceRepo {
    /// Single-row select for a user's record.
    pub fn query(user_id: DbId) -> SelectQuery {
        SelectQuery::new(PRESENCE_TABLE)
            .filter(FilterExpression::eq("user_id", user_id.to_string()))
            .single()
    }

    /// Filter string used for change subscriptions on a user's record.
    pub fn subscription_filter(user_id: DbId) -> String {
        format!("user_id=eq.{user_id}")
    }

    pub async fn find(
        store: &dyn RemoteStore,
        user_id: DbId,
    ) -> Result<Option<PresenceRecord>, StoreError> {
        let row = store.select(&Self::query(user_id)).await?;
        PresenceRecord::from_row(&row)
    }

    /// Persist `update`. Returns the stored record, or `None` when the
    /// conditional update matched nothing (missing record or lost race).
    pub async fn apply(
        store: &dyn RemoteStore,
        user_id: DbId,
        update: &PresenceUpdate,
    ) -> Result<Option<PresenceRecord>, StoreError> {
        if let PresenceUpdate::Transition { from, .. } = update {
            if from.is_sticky() {
                tracing::debug!(user_id, status = %from, "Refusing to transition sticky status");
                return Ok(None);
            }
        }

        match update.conditional_patch(user_id) {
            None => {
                let PresenceUpdate::StartSession { at } = update else {
                    return Ok(None);
                };
                let row = PresenceRecord::new_session(user_id, *at).to_row()?;
                let stored = store.upsert(PRESENCE_TABLE, row, CONFLICT_COLUMNS).await?;
                PresenceRecord::from_row(&stored)
            }
            Some((patch, filters)) => {
                let rows = store.update(PRESENCE_TABLE, patch, &filters).await?;
                match rows.first() {
                    Some(row) => PresenceRecord::from_row(row),
                    None => Ok(None),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn record(status: PresenceStatus, code: Option<&str>) -> PresenceRecord {
        let start = Utc::now() - Duration::hours(4);
        PresenceRecord {
            current_status: status,
            reactivation_code: code.map(str::to_string),
            ..PresenceRecord::new_session(7, start)
        }
    }

    #[test]
    fn transition_requires_expected_status() {
        let mut r = record(PresenceStatus::Online, None);
        let update = PresenceUpdate::Transition {
            from: PresenceStatus::Afk,
            to: PresenceStatus::Resting,
            code: Some("1234".to_string()),
            at: Utc::now(),
        };
        assert!(!update.apply_to(&mut r));
        assert_eq!(r.current_status, PresenceStatus::Online);
    }

    #[test]
    fn coffee_break_is_never_transitioned() {
        let mut r = record(PresenceStatus::CoffeeBreak, None);
        let update = PresenceUpdate::Transition {
            from: PresenceStatus::CoffeeBreak,
            to: PresenceStatus::Sleeping,
            code: Some("1234".to_string()),
            at: Utc::now(),
        };
        assert!(!update.apply_to(&mut r));
        assert_eq!(r.current_status, PresenceStatus::CoffeeBreak);
    }

    #[test]
    fn touch_keeps_status_and_latest_timestamp() {
        let mut r = record(PresenceStatus::Afk, Some("0001"));
        let now = Utc::now();
        assert!(PresenceUpdate::Touch { at: now }.apply_to(&mut r));
        assert!(!PresenceUpdate::Touch { at: now - Duration::minutes(1) }.apply_to(&mut r));

        assert_eq!(r.last_activity_at, now);
        assert_eq!(r.current_status, PresenceStatus::Afk);
        assert_eq!(r.reactivation_code.as_deref(), Some("0001"));
    }

    #[test]
    fn touch_never_lands_on_a_sleeping_record() {
        let mut r = record(PresenceStatus::Sleeping, None);
        let before = r.last_activity_at;
        assert!(!PresenceUpdate::Touch { at: Utc::now() }.apply_to(&mut r));
        assert_eq!(r.last_activity_at, before);
    }

    #[test]
    fn touch_patch_only_moves_activity_forward() {
        let at = Utc::now();
        let (patch, filters) = PresenceUpdate::Touch { at }.conditional_patch(7).unwrap();
        assert_eq!(patch["last_activity_at"], json!(at));
        let rendered: Vec<String> = filters.iter().map(ToString::to_string).collect();
        assert_eq!(rendered[0], "user_id=eq.7");
        assert_eq!(rendered[1], format!("last_activity_at=lt.{}", at.to_rfc3339()));
        assert_eq!(rendered[2], "current_status=neq.sleeping");
    }

    #[test]
    fn reactivate_needs_matching_code_and_away_status() {
        let now = Utc::now();
        let mut r = record(PresenceStatus::Resting, Some("4321"));
        let wrong = PresenceUpdate::Reactivate { code: "0000".to_string(), at: now };
        assert!(!wrong.apply_to(&mut r));

        let right = PresenceUpdate::Reactivate { code: "4321".to_string(), at: now };
        assert!(right.apply_to(&mut r));
        assert_eq!(r.current_status, PresenceStatus::Online);
        assert_eq!(r.last_activity_at, now);
        assert_eq!(r.reactivation_code, None);

        let mut sleeping = record(PresenceStatus::Sleeping, Some("4321"));
        assert!(!right.apply_to(&mut sleeping));
    }

    #[test]
    fn start_session_resets_everything_but_id() {
        let mut r = record(PresenceStatus::Resting, Some("4321"));
        r.id = Some(11);
        let now = Utc::now();
        assert!(PresenceUpdate::StartSession { at: now }.apply_to(&mut r));
        assert_eq!(r.id, Some(11));
        assert_eq!(r.current_status, PresenceStatus::Online);
        assert_eq!(r.session_start_at, now);
        assert_eq!(r.reactivation_code, None);
    }

    #[test]
    fn transition_patch_filters_on_expected_status() {
        let update = PresenceUpdate::Transition {
            from: PresenceStatus::Online,
            to: PresenceStatus::Afk,
            code: Some("0420".to_string()),
            at: Utc::now(),
        };
        let (patch, filters) = update.conditional_patch(7).unwrap();
        assert_eq!(patch["current_status"], "afk");
        assert_eq!(patch["reactivation_code"], "0420");
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[1].to_string(), "current_status=eq.online");
    }
}
