//! Presence statuses, inactivity thresholds, and the pure transition
//! function behind the presence state machine.
//!
//! The tracker (in `vigil-presence`) owns timers and persistence; this
//! module only answers "given this record and this instant, what should the
//! status be?" so the rules can be tested without a runtime.

use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Inactivity after which a user is considered away from keyboard (3 hours).
pub const DEFAULT_AFK_AFTER_MINS: i64 = 180;

/// Inactivity after which a user is considered resting (4 hours).
pub const DEFAULT_RESTING_AFTER_MINS: i64 = 240;

/// Inactivity after which the session is torn down (5 hours).
pub const DEFAULT_SLEEPING_AFTER_MINS: i64 = 300;

/// Minimum interval between persisted activity timestamps.
pub const DEFAULT_ACTIVITY_THROTTLE_SECS: u64 = 60;

/// How often the presence status is re-evaluated.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Metadata `reason` recorded when the tracker forces a logout.
pub const AUTO_LOGOUT_REASON: &str = "auto_logout_inactivity";

/// Known `activity_type` values of the activity log.
pub mod activity_types {
    pub const SESSION_START: &str = "session_start";
    pub const STATUS_CHANGE: &str = "status_change";
    pub const LOGOUT: &str = "logout";
    pub const REACTIVATED: &str = "reactivated";
}

// ---------------------------------------------------------------------------
// PresenceStatus
// ---------------------------------------------------------------------------

/// Discrete liveness classification of a user session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    /// Set by an external collaborator; never overridden automatically.
    CoffeeBreak,
    Afk,
    Resting,
    /// Terminal. Entering it forces a logout.
    Sleeping,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::CoffeeBreak => "coffee_break",
            Self::Afk => "afk",
            Self::Resting => "resting",
            Self::Sleeping => "sleeping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "coffee_break" => Some(Self::CoffeeBreak),
            "afk" => Some(Self::Afk),
            "resting" => Some(Self::Resting),
            "sleeping" => Some(Self::Sleeping),
            _ => None,
        }
    }

    /// The state machine must leave sticky statuses alone.
    pub fn is_sticky(&self) -> bool {
        matches!(self, Self::CoffeeBreak)
    }

    /// Entering one of these statuses issues a fresh reactivation code.
    pub fn requires_code(&self) -> bool {
        matches!(self, Self::Afk | Self::Resting | Self::Sleeping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sleeping)
    }

    /// Statuses from which the reactivation challenge may restore `online`.
    pub fn can_reactivate(&self) -> bool {
        matches!(self, Self::Afk | Self::Resting)
    }

    /// Position on the inactivity scale; `coffee_break` sits with `online`.
    pub fn away_level(&self) -> u8 {
        match self {
            Self::Online | Self::CoffeeBreak => 0,
            Self::Afk => 1,
            Self::Resting => 2,
            Self::Sleeping => 3,
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StatusThresholds
// ---------------------------------------------------------------------------

/// Maps elapsed inactivity to a target status.
///
/// `[0, afk) -> online`, `[afk, resting) -> afk`,
/// `[resting, sleeping) -> resting`, `[sleeping, inf) -> sleeping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusThresholds {
    pub afk_after: Duration,
    pub resting_after: Duration,
    pub sleeping_after: Duration,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            afk_after: Duration::minutes(DEFAULT_AFK_AFTER_MINS),
            resting_after: Duration::minutes(DEFAULT_RESTING_AFTER_MINS),
            sleeping_after: Duration::minutes(DEFAULT_SLEEPING_AFTER_MINS),
        }
    }
}

impl StatusThresholds {
    /// Build thresholds from minute values, validating their order.
    pub fn from_minutes(afk: i64, resting: i64, sleeping: i64) -> Result<Self, CoreError> {
        let thresholds = Self {
            afk_after: Duration::minutes(afk),
            resting_after: Duration::minutes(resting),
            sleeping_after: Duration::minutes(sleeping),
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// Thresholds must be positive and strictly ascending.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.afk_after <= Duration::zero() {
            return Err(CoreError::Validation(
                "AFK threshold must be positive".to_string(),
            ));
        }
        if self.resting_after <= self.afk_after {
            return Err(CoreError::Validation(format!(
                "Resting threshold ({} min) must exceed AFK threshold ({} min)",
                self.resting_after.num_minutes(),
                self.afk_after.num_minutes()
            )));
        }
        if self.sleeping_after <= self.resting_after {
            return Err(CoreError::Validation(format!(
                "Sleeping threshold ({} min) must exceed resting threshold ({} min)",
                self.sleeping_after.num_minutes(),
                self.resting_after.num_minutes()
            )));
        }
        Ok(())
    }

    /// The bucket containing `inactive`. Negative durations (clock skew)
    /// count as no inactivity.
    pub fn target_status(&self, inactive: Duration) -> PresenceStatus {
        if inactive >= self.sleeping_after {
            PresenceStatus::Sleeping
        } else if inactive >= self.resting_after {
            PresenceStatus::Resting
        } else if inactive >= self.afk_after {
            PresenceStatus::Afk
        } else {
            PresenceStatus::Online
        }
    }
}

// ---------------------------------------------------------------------------
// Transition function
// ---------------------------------------------------------------------------

/// Decide whether a record should change status.
///
/// Returns `None` when the current status is sticky or already matches the
/// target, so repeated evaluation without new activity is a no-op. Away
/// statuses only escalate: leaving `afk` or `resting` for `online` goes
/// through the reactivation challenge, never through fresh activity alone.
pub fn evaluate(
    current: PresenceStatus,
    last_activity_at: Timestamp,
    now: Timestamp,
    thresholds: &StatusThresholds,
) -> Option<PresenceStatus> {
    if current.is_sticky() || current.is_terminal() {
        return None;
    }
    let target = thresholds.target_status(now - last_activity_at);
    if current.requires_code() && target.away_level() < current.away_level() {
        return None;
    }
    (target != current).then_some(target)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
