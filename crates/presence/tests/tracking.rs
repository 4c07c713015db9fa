//! End-to-end presence tracking over the in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use vigil_core::filter::FilterExpression;
use vigil_core::presence::{PresenceStatus, AUTO_LOGOUT_REASON};
use vigil_core::reactivation::is_valid_code;
use vigil_db::models::presence::{ActivityLogEntry, PresenceRecord};
use vigil_db::repositories::{ActivityLogRepo, PresenceRepo, PRESENCE_TABLE};
use vigil_db::{MemoryStore, RemoteStore};
use vigil_presence::{
    track_activity, ActivitySignal, Evaluation, PresenceConfig, PresenceDeps, SessionError,
    SessionProvider, TrackingHandle,
};
use vigil_query::QueryClient;

const USER: i64 = 42;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSession {
    fail_sign_out: bool,
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingSession {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionProvider for RecordingSession {
    async fn sign_out(&self) -> Result<(), SessionError> {
        self.calls.lock().unwrap().push("sign_out");
        if self.fail_sign_out {
            return Err(SessionError::SignOut("token revoked twice".into()));
        }
        Ok(())
    }

    async fn redirect_to_login(&self) -> Result<(), SessionError> {
        self.calls.lock().unwrap().push("redirect");
        Ok(())
    }
}

/// The monitor's own timer never fires within a test; cycles are driven
/// through `evaluate_now`.
fn config() -> PresenceConfig {
    PresenceConfig {
        poll_interval: Duration::from_secs(24 * 3600),
        ..PresenceConfig::default()
    }
}

async fn start(store: &Arc<MemoryStore>, session: &Arc<RecordingSession>) -> TrackingHandle {
    let deps = PresenceDeps {
        client: QueryClient::new(store.clone(), store.clone()),
        session: session.clone(),
    };
    track_activity(deps, USER, config()).await.unwrap()
}

/// Backdate the stored activity and optionally force a status.
async fn seed(store: &MemoryStore, inactive_mins: i64, status: Option<PresenceStatus>) {
    let mut patch = json!({ "last_activity_at": Utc::now() - chrono::Duration::minutes(inactive_mins) });
    if let Some(status) = status {
        patch["current_status"] = json!(status);
    }
    let updated = store
        .update(
            PRESENCE_TABLE,
            patch,
            &[FilterExpression::eq("user_id", USER.to_string())],
        )
        .await
        .unwrap();
    assert_eq!(updated.len(), 1);
}

async fn stored(store: &MemoryStore) -> PresenceRecord {
    PresenceRepo::find(store, USER).await.unwrap().unwrap()
}

async fn log_of(store: &MemoryStore, activity_type: &str) -> Vec<ActivityLogEntry> {
    ActivityLogRepo::list_for_user(store, USER, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.activity_type == activity_type)
        .collect()
}

async fn go_afk(store: &MemoryStore, handle: &TrackingHandle) -> String {
    seed(store, 210, None).await;
    let outcome = handle.evaluate_now().await.unwrap();
    assert_matches!(
        outcome,
        Evaluation::Transitioned {
            from: PresenceStatus::Online,
            to: PresenceStatus::Afk
        }
    );
    stored(store).await.reactivation_code.unwrap()
}

// ---------------------------------------------------------------------------
// Session start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tracking_starts_an_online_session() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;

    let record = stored(&store).await;
    assert_eq!(record.current_status, PresenceStatus::Online);
    assert_eq!(record.reactivation_code, None);
    assert_eq!(handle.record_snapshot().map(|r| r.current_status), Some(PresenceStatus::Online));
    assert_eq!(log_of(&store, "session_start").await.len(), 1);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inactivity_moves_online_to_afk_once() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;

    let code = go_afk(&store, &handle).await;
    assert!(is_valid_code(&code), "bad code {code}");
    assert_eq!(handle.challenge().map(|c| c.code().to_string()), Some(code.clone()));

    let again = handle.evaluate_now().await.unwrap();
    assert_matches!(again, Evaluation::Unchanged(PresenceStatus::Afk));
    let record = stored(&store).await;
    assert_eq!(record.current_status, PresenceStatus::Afk);
    assert_eq!(record.reactivation_code, Some(code));

    let changes = log_of(&store, "status_change").await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].metadata, Some(json!({ "from": "online", "to": "afk" })));

    handle.shutdown().await;
}

#[tokio::test]
async fn afk_escalates_to_resting_with_a_new_code() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;

    let afk_code = go_afk(&store, &handle).await;
    seed(&store, 250, None).await;

    let outcome = handle.evaluate_now().await.unwrap();
    assert_matches!(
        outcome,
        Evaluation::Transitioned {
            from: PresenceStatus::Afk,
            to: PresenceStatus::Resting
        }
    );
    let record = stored(&store).await;
    let resting_code = record.reactivation_code.unwrap();
    assert_ne!(resting_code, afk_code);
    assert_eq!(handle.challenge().map(|c| c.code().to_string()), Some(resting_code));

    handle.shutdown().await;
}

#[tokio::test]
async fn fresh_activity_does_not_clear_afk() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;

    go_afk(&store, &handle).await;
    seed(&store, 0, None).await;

    let outcome = handle.evaluate_now().await.unwrap();
    assert_matches!(outcome, Evaluation::Unchanged(PresenceStatus::Afk));
    assert_eq!(stored(&store).await.current_status, PresenceStatus::Afk);

    handle.shutdown().await;
}

#[tokio::test]
async fn coffee_break_is_never_escalated() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;

    seed(&store, 360, Some(PresenceStatus::CoffeeBreak)).await;
    let outcome = handle.evaluate_now().await.unwrap();

    assert_matches!(outcome, Evaluation::Unchanged(PresenceStatus::CoffeeBreak));
    assert_eq!(stored(&store).await.current_status, PresenceStatus::CoffeeBreak);
    assert!(!handle.is_logged_out());
    assert!(session.calls().is_empty());
    assert!(log_of(&store, "logout").await.is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn leaving_coffee_break_resumes_online_tracking() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;

    assert!(handle.set_coffee_break(true).await.unwrap());
    seed(&store, 400, None).await;
    assert_matches!(
        handle.evaluate_now().await.unwrap(),
        Evaluation::Unchanged(PresenceStatus::CoffeeBreak)
    );

    let before = Utc::now();
    assert!(handle.set_coffee_break(false).await.unwrap());
    let record = stored(&store).await;
    assert_eq!(record.current_status, PresenceStatus::Online);
    assert!(record.last_activity_at >= before);
    assert!(!handle.set_coffee_break(false).await.unwrap());

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Forced logout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sleeping_forces_logout_even_when_sign_out_fails() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession {
        fail_sign_out: true,
        ..RecordingSession::default()
    });
    let handle = start(&store, &session).await;

    seed(&store, 310, None).await;
    let Evaluation::LoggedOut(logout) = handle.evaluate_now().await.unwrap() else {
        panic!("expected a forced logout");
    };
    logout.await.unwrap();

    assert!(handle.is_logged_out());
    assert_eq!(session.calls(), vec!["sign_out", "redirect"]);

    let record = stored(&store).await;
    assert_eq!(record.current_status, PresenceStatus::Sleeping);
    assert_eq!(record.reactivation_code, None);

    let logouts = log_of(&store, "logout").await;
    assert_eq!(logouts.len(), 1);
    assert_eq!(logouts[0].metadata, Some(json!({ "reason": AUTO_LOGOUT_REASON })));
    assert_eq!(log_of(&store, "status_change").await.len(), 1);

    let again = handle.evaluate_now().await.unwrap();
    assert_matches!(again, Evaluation::Unchanged(PresenceStatus::Sleeping));
    assert_eq!(session.calls().len(), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn activity_after_logout_is_not_persisted() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;

    seed(&store, 310, None).await;
    let Evaluation::LoggedOut(logout) = handle.evaluate_now().await.unwrap() else {
        panic!("expected a forced logout");
    };
    logout.await.unwrap();
    let writes = store.write_count(PRESENCE_TABLE).await;
    let before = stored(&store).await;

    handle.record(ActivitySignal::KeyPress);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.write_count(PRESENCE_TABLE).await, writes);
    let after = stored(&store).await;
    assert_eq!(after.current_status, PresenceStatus::Sleeping);
    assert_eq!(after.last_activity_at, before.last_activity_at);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Reactivation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn correct_code_returns_user_online() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;

    let code = go_afk(&store, &handle).await;
    let wrong = if code == "0000" { "1111" } else { "0000" };
    assert!(!handle.reactivate(wrong).await);
    assert_eq!(handle.failed_attempts(), 1);

    let before = Utc::now();
    assert!(handle.reactivate(&code).await);

    let record = stored(&store).await;
    assert_eq!(record.current_status, PresenceStatus::Online);
    assert_eq!(record.reactivation_code, None);
    assert!(record.last_activity_at >= before);
    assert!(handle.last_activity() >= before);
    assert_eq!(handle.failed_attempts(), 0);
    assert!(handle.challenge().is_none());

    let reactivated = log_of(&store, "reactivated").await;
    assert_eq!(reactivated.len(), 1);
    assert_eq!(reactivated[0].metadata, Some(json!({ "from": "afk" })));

    handle.shutdown().await;
}

#[tokio::test]
async fn three_wrong_codes_lock_the_challenge() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;

    let code = go_afk(&store, &handle).await;
    let wrong = if code == "0000" { "1111" } else { "0000" };
    for _ in 0..3 {
        assert!(!handle.reactivate(wrong).await);
    }
    assert_eq!(handle.failed_attempts(), 3);
    assert!(handle.challenge().is_some_and(|c| c.is_locked()));

    assert!(!handle.reactivate(&code).await);
    assert_eq!(stored(&store).await.current_status, PresenceStatus::Afk);
    assert!(log_of(&store, "reactivated").await.is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn reactivation_is_refused_while_online() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;

    assert!(!handle.reactivate("1234").await);
    assert_eq!(handle.failed_attempts(), 0);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Activity throttling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn burst_of_signals_persists_once() {
    let store = Arc::new(MemoryStore::new());
    let session = Arc::new(RecordingSession::default());
    let handle = start(&store, &session).await;
    let baseline = store.write_count(PRESENCE_TABLE).await;
    let started = handle.last_activity();

    for _ in 0..10 {
        handle.record(ActivitySignal::PointerMove);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let latest = handle.last_activity();
    assert!(latest >= started);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.write_count(PRESENCE_TABLE).await, baseline + 1);
    assert_eq!(handle.last_activity(), latest);

    handle.shutdown().await;
}
