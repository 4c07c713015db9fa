use vigil_db::StoreError;

use crate::key::QueryKey;

/// Errors surfaced by the query layer.
///
/// `Clone` so one failed fetch can be handed to every awaiter of the shared
/// in-flight future and kept on the entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Mutation failed: {0}")]
    Mutation(String),

    #[error("No cache entry for {0}")]
    UnknownKey(QueryKey),
}

impl QueryError {
    pub fn mutation(err: impl std::fmt::Display) -> Self {
        Self::Mutation(err.to_string())
    }
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        Self::Fetch(err.to_string())
    }
}
