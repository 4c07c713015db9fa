//! Vigil query layer: a keyed, reactively observed cache kept consistent
//! with a remote multi-writer store.
//!
//! - [`cache::QueryCache`] -- entries with staleness deadlines, one in-flight
//!   fetch per key, consumer counting and per-entry refresh drivers.
//! - [`bridge::ChangeFeedBridge`] -- turns change-feed events into cache
//!   invalidations.
//! - [`optimistic::apply`] -- local-first writes with rollback by refetch.
//! - [`client::use_query`] -- the consumer-facing handle tying them together.

pub mod bridge;
pub mod cache;
pub mod client;
pub mod error;
pub mod key;
pub mod optimistic;

pub use cache::{EntryOptions, Fetcher, QueryCache, QueryState};
pub use client::{use_query, QueryClient, QueryHandle, QueryOptions};
pub use error::QueryError;
pub use key::QueryKey;
