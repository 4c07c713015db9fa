//! Optimistic mutations.
//!
//! The local change is applied to the cache first so observers see it at
//! once; the remote write follows. If the write fails the entry is
//! invalidated and refetched from the store before the error is returned,
//! so the cache never keeps a value the store rejected.

use std::future::Future;

use serde_json::Value;

use crate::cache::QueryCache;
use crate::error::QueryError;
use crate::key::QueryKey;

/// Apply `local_update` to `key`, then run `remote_write`.
///
/// `local_update` follows [`QueryCache::set`]: it may return `None` to skip
/// the local change. On failure, the rollback refetch is awaited before
/// returning; its own failure is only logged.
pub async fn apply<T, U, W, Fut>(
    cache: &QueryCache,
    key: &QueryKey,
    local_update: U,
    remote_write: W,
) -> Result<T, QueryError>
where
    U: FnOnce(Option<&Value>) -> Option<Value>,
    W: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, QueryError>>,
{
    cache.set(key, local_update);

    match remote_write().await {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Optimistic write failed, rolling back");
            cache.invalidate(key);
            if cache.contains(key) {
                if let Err(refetch) = cache.fetch(key).await {
                    tracing::error!(key = %key, error = %refetch, "Rollback refetch failed");
                }
            }
            Err(e)
        }
    }
}
