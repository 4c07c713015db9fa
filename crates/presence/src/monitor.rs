//! Presence monitor.
//!
//! Re-evaluates the user's status every poll period. Each cycle reads the
//! record fresh from the store and applies the transition function to its
//! persisted `last_activity_at`. A status change is persisted with a
//! compare-and-set on the status it read; losing that race to another
//! writer is a no-op for the cycle.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use vigil_core::presence::{evaluate, PresenceStatus};
use vigil_core::reactivation::generate_code;
use vigil_db::models::presence::ActivityLogEntry;
use vigil_db::repositories::PresenceUpdate;
use vigil_query::QueryError;

use crate::logout;
use crate::tracker::PresenceContext;

/// Outcome of one evaluation cycle.
#[derive(Debug)]
pub enum Evaluation {
    /// Nothing to do; carries the current status.
    Unchanged(PresenceStatus),
    /// The user has no presence record.
    NoRecord,
    /// Another writer changed the status first.
    LostRace,
    Transitioned {
        from: PresenceStatus,
        to: PresenceStatus,
    },
    /// The terminal status was persisted; the handle completes once the
    /// forced logout has run.
    LoggedOut(JoinHandle<()>),
}

/// One evaluation cycle.
pub(crate) async fn evaluate_once(ctx: &PresenceContext) -> Result<Evaluation, QueryError> {
    let Some(record) = ctx.fresh_record().await? else {
        return Ok(Evaluation::NoRecord);
    };

    let from = record.current_status;
    let now = Utc::now();
    let Some(to) = evaluate(from, record.last_activity_at, now, &ctx.config.thresholds) else {
        return Ok(Evaluation::Unchanged(from));
    };

    let code = to
        .requires_code()
        .then(|| generate_code(record.reactivation_code.as_deref()));
    let update = PresenceUpdate::Transition {
        from,
        to,
        code: code.clone(),
        at: now,
    };

    if ctx.write(update).await?.is_none() {
        tracing::debug!(user_id = ctx.user_id, from = %from, to = %to, "Status changed concurrently, skipping");
        // The optimistic copy assumed the transition; bring back the real row.
        if let Err(e) = ctx.query.refetch().await {
            tracing::warn!(user_id = ctx.user_id, error = %e, "Refetch after lost race failed");
        }
        return Ok(Evaluation::LostRace);
    }

    tracing::info!(user_id = ctx.user_id, from = %from, to = %to, "Presence status changed");
    ctx.log_activity(ActivityLogEntry::status_change(ctx.user_id, from, to, now))
        .await;

    if let Some(code) = code {
        ctx.challenge.open(code, ctx.config.max_attempts);
    }

    if to.is_terminal() {
        ctx.logged_out.store(true, Ordering::SeqCst);
        ctx.challenge.clear();
        let handle = tokio::spawn(logout::forced_logout(
            Arc::clone(ctx.client.store()),
            Arc::clone(&ctx.session),
            ctx.user_id,
        ));
        return Ok(Evaluation::LoggedOut(handle));
    }

    Ok(Evaluation::Transitioned { from, to })
}

/// Evaluate every poll period until cancelled or logged out. The first
/// evaluation happens one full period after start.
pub(crate) async fn run(ctx: Arc<PresenceContext>, cancel: CancellationToken) {
    let period = ctx.config.poll_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !ctx.is_logged_out() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match evaluate_once(&ctx).await {
            Ok(Evaluation::LoggedOut(_)) => break,
            Ok(outcome) => tracing::trace!(user_id = ctx.user_id, outcome = ?outcome, "Presence evaluated"),
            Err(e) => tracing::warn!(user_id = ctx.user_id, error = %e, "Presence evaluation failed"),
        }
    }
    tracing::debug!(user_id = ctx.user_id, "Presence monitor stopped");
}
