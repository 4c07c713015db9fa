//! Repository layer: typed access to Vigil's tables over any
//! [`RemoteStore`](crate::store::RemoteStore).
//!
//! Each repository is a zero-sized struct with async methods that accept
//! `&dyn RemoteStore` as the first argument.

pub mod activity_log_repo;
pub mod presence_repo;

pub use activity_log_repo::{ActivityLogRepo, ACTIVITY_LOG_TABLE};
pub use presence_repo::{PresenceRepo, PresenceUpdate, PRESENCE_TABLE};
