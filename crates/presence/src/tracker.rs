//! Tracking entry point.
//!
//! [`track_activity`] starts a presence session for one user and spawns
//! the activity writer and presence monitor. The returned
//! [`TrackingHandle`] feeds activity signals in, answers reactivation
//! challenges and stops both tasks on [`TrackingHandle::shutdown`] or drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vigil_core::reactivation::ReactivationChallenge;
use vigil_core::types::{DbId, Timestamp};
use vigil_db::models::presence::{ActivityLogEntry, PresenceRecord};
use vigil_db::repositories::{ActivityLogRepo, PresenceRepo, PresenceUpdate, PRESENCE_TABLE};
use vigil_query::{use_query, QueryClient, QueryError, QueryHandle, QueryKey, QueryOptions};

use crate::collector::{run_activity_writer, ActivityCollector, ActivitySignal};
use crate::config::PresenceConfig;
use crate::monitor::{self, Evaluation};
use crate::reactivation::{self, ChallengeSlot};
use crate::session::SessionProvider;

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Collaborators the tracker needs from the embedding application.
#[derive(Clone)]
pub struct PresenceDeps {
    pub client: QueryClient,
    pub session: Arc<dyn SessionProvider>,
}

/// State shared by the handle and the background tasks of one user.
pub(crate) struct PresenceContext {
    pub client: QueryClient,
    pub session: Arc<dyn SessionProvider>,
    pub user_id: DbId,
    pub config: PresenceConfig,
    pub query: QueryHandle,
    pub challenge: ChallengeSlot,
    pub collector: ActivityCollector,
    /// Set once the forced logout has been started.
    pub logged_out: AtomicBool,
}

impl PresenceContext {
    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    /// Refetch the user's record, bypassing staleness.
    pub async fn fresh_record(&self) -> Result<Option<PresenceRecord>, QueryError> {
        let row = self.query.refetch().await?;
        PresenceRecord::from_row(&row).map_err(QueryError::from)
    }

    /// Cached record without touching the network.
    pub fn cached_record(&self) -> Option<PresenceRecord> {
        let row = self.query.state().data?;
        PresenceRecord::from_row(&row).ok().flatten()
    }

    /// Persist `update` optimistically through the presence query entry.
    pub async fn write(&self, update: PresenceUpdate) -> Result<Option<PresenceRecord>, QueryError> {
        let store = Arc::clone(self.client.store());
        let user_id = self.user_id;
        let remote = update.clone();

        self.client
            .mutate(
                self.query.key(),
                |current| merge_update(current, &update),
                || async move {
                    PresenceRepo::apply(store.as_ref(), user_id, &remote)
                        .await
                        .map_err(QueryError::mutation)
                },
            )
            .await
    }

    /// Append to the activity log. Failures are logged, never returned.
    pub async fn log_activity(&self, entry: ActivityLogEntry) {
        if let Err(e) = ActivityLogRepo::append(self.client.store().as_ref(), &entry).await {
            tracing::error!(
                user_id = self.user_id,
                activity_type = %entry.activity_type,
                error = %e,
                "Failed to write activity log",
            );
        }
    }
}

/// Local half of a presence write: apply `update` to the cached row.
/// Returns `None` (no local change) when there is no record or the update
/// does not apply.
fn merge_update(current: Option<&Value>, update: &PresenceUpdate) -> Option<Value> {
    let mut record = PresenceRecord::from_row(current?).ok().flatten()?;
    if !update.apply_to(&mut record) {
        return None;
    }
    record.to_row().ok()
}

/// Cache key of a user's presence record.
pub fn presence_key(user_id: DbId) -> QueryKey {
    QueryKey::new(["presence".to_string(), user_id.to_string()])
}

/// Query for a user's presence record, single row, refreshed per `config`.
pub fn presence_query(user_id: DbId, config: &PresenceConfig) -> QueryOptions {
    QueryOptions::new(PRESENCE_TABLE)
        .filter(PresenceRepo::subscription_filter(user_id))
        .single()
        .stale_time(config.stale_time)
        .refetch_interval(config.refetch_interval)
}

// ---------------------------------------------------------------------------
// track_activity
// ---------------------------------------------------------------------------

/// Start tracking `user_id`.
///
/// Upserts a fresh `online` record, logs `session_start`, then spawns the
/// activity writer and the presence monitor.
pub async fn track_activity(
    deps: PresenceDeps,
    user_id: DbId,
    config: PresenceConfig,
) -> Result<TrackingHandle, QueryError> {
    let started_at = Utc::now();
    PresenceRepo::apply(
        deps.client.store().as_ref(),
        user_id,
        &PresenceUpdate::StartSession { at: started_at },
    )
    .await
    .map_err(QueryError::mutation)?;

    let (collector, writes) = ActivityCollector::new(config.activity_throttle, started_at);
    let query = use_query(&deps.client, presence_key(user_id), presence_query(user_id, &config));

    let ctx = Arc::new(PresenceContext {
        client: deps.client,
        session: deps.session,
        user_id,
        config,
        query,
        challenge: ChallengeSlot::default(),
        collector: collector.clone(),
        logged_out: AtomicBool::new(false),
    });

    ctx.client.cache().fetch(ctx.query.key()).await?;
    ctx.log_activity(ActivityLogEntry::session_start(user_id, started_at)).await;
    tracing::info!(user_id, "Presence session started");

    let cancel = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(run_activity_writer(Arc::clone(&ctx), writes, cancel.clone())),
        tokio::spawn(monitor::run(Arc::clone(&ctx), cancel.clone())),
    ];

    Ok(TrackingHandle {
        ctx,
        collector,
        cancel,
        tasks,
    })
}

// ---------------------------------------------------------------------------
// TrackingHandle
// ---------------------------------------------------------------------------

/// Live presence tracking for one user.
pub struct TrackingHandle {
    ctx: Arc<PresenceContext>,
    collector: ActivityCollector,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TrackingHandle {
    pub fn user_id(&self) -> DbId {
        self.ctx.user_id
    }

    /// Feed one input signal. Never blocks.
    pub fn record(&self, signal: ActivitySignal) {
        self.collector.record(signal);
    }

    pub fn last_activity(&self) -> Timestamp {
        self.collector.last_activity()
    }

    /// Cached presence record.
    pub fn record_snapshot(&self) -> Option<PresenceRecord> {
        self.ctx.cached_record()
    }

    /// Submit a reactivation code. `true` when the user is back `online`.
    pub async fn reactivate(&self, code: &str) -> bool {
        reactivation::reactivate(&self.ctx, code).await
    }

    /// The open reactivation challenge, if any.
    pub fn challenge(&self) -> Option<ReactivationChallenge> {
        self.ctx.challenge.snapshot()
    }

    /// Failed submissions against the open challenge.
    pub fn failed_attempts(&self) -> u32 {
        self.challenge().map_or(0, |c| c.failed_attempts())
    }

    /// Enter or leave `coffee_break`. Returns `false` when the record's
    /// status does not allow it (logged out, or not on a break).
    pub async fn set_coffee_break(&self, active: bool) -> Result<bool, QueryError> {
        let at = Utc::now();
        let applied = self
            .ctx
            .write(PresenceUpdate::CoffeeBreak { active, at })
            .await?
            .is_some();
        if applied {
            if active {
                self.ctx.challenge.clear();
            } else {
                self.collector.reset(at);
            }
            tracing::info!(user_id = self.ctx.user_id, active, "Coffee break updated");
        }
        Ok(applied)
    }

    /// Run one evaluation cycle immediately.
    pub async fn evaluate_now(&self) -> Result<Evaluation, QueryError> {
        monitor::evaluate_once(&self.ctx).await
    }

    /// Whether the forced logout has been triggered.
    pub fn is_logged_out(&self) -> bool {
        self.ctx.is_logged_out()
    }

    /// Stop the background tasks and wait for them. A forced logout that
    /// is already running still completes.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::warn!(user_id = self.ctx.user_id, error = %e, "Presence task ended abnormally");
            }
        }
        tracing::info!(user_id = self.ctx.user_id, "Presence tracking stopped");
    }
}

impl Drop for TrackingHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
