//! Vigil change-feed infrastructure.
//!
//! This crate provides the building blocks every store adapter and the
//! query cache share:
//!
//! - [`ChangeEvent`] -- an insert/update/delete notification for one row.
//! - [`ChangeBus`] -- in-process fan-out of change events backed by
//!   `tokio::sync::broadcast`, usable directly as a [`ChangeFeed`].
//! - [`ChangeFeed`] / [`Subscription`] -- the filtered subscription contract
//!   consumed by the change-feed bridge.
//! - [`reconnect`] -- exponential backoff for re-establishing subscriptions.

pub mod bus;
pub mod change;
pub mod feed;
pub mod reconnect;

pub use bus::ChangeBus;
pub use change::{ChangeEvent, ChangeKind};
pub use feed::{ChangeFeed, FeedError, FeedMessage, Subscription, SubscriptionStatus};
