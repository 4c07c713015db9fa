//! Reactivation from `afk` or `resting`.
//!
//! The monitor opens a [`ReactivationChallenge`] whenever it issues a code.
//! Submissions are checked against the stored code through that challenge,
//! which enforces the attempt budget locally.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use vigil_core::reactivation::{ChallengeOutcome, ReactivationChallenge};
use vigil_db::models::presence::ActivityLogEntry;
use vigil_db::repositories::PresenceUpdate;

use crate::tracker::PresenceContext;

/// The challenge currently shown to the user, if any.
#[derive(Clone, Default)]
pub(crate) struct ChallengeSlot(Arc<Mutex<Option<ReactivationChallenge>>>);

impl ChallengeSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ReactivationChallenge>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace any open challenge with a fresh one for `code`.
    pub fn open(&self, code: String, max_attempts: u32) {
        *self.lock() = Some(ReactivationChallenge::new(code, max_attempts));
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    pub fn snapshot(&self) -> Option<ReactivationChallenge> {
        self.lock().clone()
    }

    /// Submit `input` against `stored_code`. A challenge for a different
    /// code is replaced first, so a code issued elsewhere starts a fresh
    /// attempt budget.
    pub fn submit(&self, stored_code: &str, input: &str, max_attempts: u32) -> ChallengeOutcome {
        let mut slot = self.lock();
        let challenge = match slot.take() {
            Some(challenge) if challenge.code() == stored_code => challenge,
            _ => ReactivationChallenge::new(stored_code, max_attempts),
        };
        slot.insert(challenge).submit(input)
    }
}

/// Check `input` and, if correct, return the user to `online`.
pub(crate) async fn reactivate(ctx: &PresenceContext, input: &str) -> bool {
    let user_id = ctx.user_id;
    let record = match ctx.fresh_record().await {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::warn!(user_id, "Reactivation without a presence record");
            return false;
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "Failed to load presence record for reactivation");
            return false;
        }
    };

    let from = record.current_status;
    let Some(stored_code) = record.reactivation_code.filter(|_| from.can_reactivate()) else {
        tracing::debug!(user_id, status = %from, "Nothing to reactivate");
        return false;
    };

    match ctx.challenge.submit(&stored_code, input, ctx.config.max_attempts) {
        ChallengeOutcome::Accepted => {}
        ChallengeOutcome::Rejected { remaining } => {
            tracing::info!(user_id, remaining, "Incorrect reactivation code");
            return false;
        }
        ChallengeOutcome::Locked => {
            tracing::warn!(user_id, "Reactivation locked, re-authentication required");
            return false;
        }
    }

    let now = Utc::now();
    let update = PresenceUpdate::Reactivate {
        code: stored_code,
        at: now,
    };
    match ctx.write(update).await {
        Ok(Some(_)) => {
            ctx.collector.reset(now);
            ctx.challenge.clear();
            ctx.log_activity(ActivityLogEntry::reactivated(user_id, from, now))
                .await;
            tracing::info!(user_id, from = %from, "User reactivated");
            true
        }
        Ok(None) => {
            tracing::warn!(user_id, "Status changed before reactivation could be saved");
            false
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "Failed to persist reactivation");
            false
        }
    }
}
