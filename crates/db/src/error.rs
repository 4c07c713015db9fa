/// Errors surfaced by [`RemoteStore`](crate::store::RemoteStore) adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid identifier: '{0}'")]
    InvalidIdentifier(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store could not be reached (network down, injected failure).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
