//! Vigil presence tracking.
//!
//! Infers a user's liveness from coarse activity signals, escalates the
//! persisted presence status through `afk`, `resting` and `sleeping` as
//! inactivity grows, and forces a logout at the terminal level. `afk` and
//! `resting` are reversible through a one-time reactivation code.
//!
//! Entry point: [`tracker::track_activity`], which returns a
//! [`tracker::TrackingHandle`]. Three independent tasks run per tracked
//! user:
//!
//! - the activity writer, persisting throttled activity timestamps;
//! - the presence monitor, evaluating the status on a fixed poll period;
//! - the query entry's refresh driver (owned by `vigil-query`).

pub mod collector;
pub mod config;
mod logout;
pub mod monitor;
pub mod reactivation;
pub mod session;
pub mod tracker;

pub use collector::{ActivityCollector, ActivitySignal};
pub use config::PresenceConfig;
pub use monitor::Evaluation;
pub use session::{SessionError, SessionProvider};
pub use tracker::{track_activity, PresenceDeps, TrackingHandle};
