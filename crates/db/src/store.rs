//! The remote store contract.

use async_trait::async_trait;
use serde_json::Value;
use vigil_core::filter::FilterExpression;

use crate::error::StoreError;
use crate::query::SelectQuery;

/// Request/response access to the relational store.
///
/// Rows travel as JSON objects. Adapters are responsible for their own
/// change notifications; this trait only covers reads and writes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Run a select. Returns an array, or a single object / `null` when
    /// [`SelectQuery::single`] is set.
    async fn select(&self, query: &SelectQuery) -> Result<Value, StoreError>;

    /// Insert one row and return it as stored.
    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError>;

    /// Merge `patch` into every row matching all `filters`; returns the
    /// updated rows (possibly none).
    async fn update(
        &self,
        table: &str,
        patch: Value,
        filters: &[FilterExpression],
    ) -> Result<Vec<Value>, StoreError>;

    /// Insert `row`, or merge it into the existing row that agrees on every
    /// `conflict` column. Returns the stored row.
    async fn upsert(&self, table: &str, row: Value, conflict: &[&str]) -> Result<Value, StoreError>;
}

/// Returns `true` for a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reject anything that is not a plain identifier.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Borrow a row as a JSON object.
pub fn row_object(row: &Value) -> Result<&serde_json::Map<String, Value>, StoreError> {
    row.as_object()
        .ok_or_else(|| StoreError::InvalidRow(format!("expected a JSON object, got {row}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_identifier("presence_records"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("user_id; DROP TABLE x"));
        assert!(!is_identifier("a.b"));
    }

    #[test]
    fn row_must_be_object() {
        assert!(row_object(&serde_json::json!({"a": 1})).is_ok());
        assert!(row_object(&serde_json::json!([1])).is_err());
    }
}
