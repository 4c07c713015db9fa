//! Select query description shared by every store adapter.

use serde::{Deserialize, Serialize};
use vigil_core::filter::{parse_filter, FilterExpression};

/// Ordering clause: one column, ascending or descending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// A read against one table.
///
/// With `single` set, adapters return the first matching row as an object,
/// or `null` when nothing matches; otherwise they return an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectQuery {
    pub table: String,
    /// `*` or a comma-separated column list.
    pub columns: String,
    pub filters: Vec<FilterExpression>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
    pub single: bool,
}

impl SelectQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
            single: false,
        }
    }

    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn filter(mut self, filter: FilterExpression) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a filter in the mini-language. Unparseable text adds nothing.
    pub fn filter_str(mut self, filter: &str) -> Self {
        match parse_filter(filter) {
            Some(parsed) => self.filters.push(parsed),
            None => {
                tracing::warn!(table = %self.table, filter, "Ignoring unparseable query filter");
            }
        }
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

    /// Column names of an explicit projection, `None` for `*`.
    pub fn projection(&self) -> Option<Vec<&str>> {
        let cols = self.columns.trim();
        if cols == "*" || cols.is_empty() {
            return None;
        }
        Some(cols.split(',').map(str::trim).filter(|c| !c.is_empty()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_clauses() {
        let q = SelectQuery::new("presence_records")
            .columns("user_id, current_status")
            .filter_str("user_id=eq.7")
            .filter_str("nonsense")
            .order(Order::desc("updated_at"))
            .limit(5)
            .single();

        assert_eq!(q.filters.len(), 1);
        assert_eq!(q.order, Some(Order::desc("updated_at")));
        assert_eq!(q.limit, Some(5));
        assert!(q.single);
        assert_eq!(q.projection(), Some(vec!["user_id", "current_status"]));
    }

    #[test]
    fn star_means_no_projection() {
        assert_eq!(SelectQuery::new("t").projection(), None);
    }
}
