//! Activity signal collection.
//!
//! [`ActivityCollector::record`] is called from input handlers. It never
//! awaits: it stamps the in-memory last-activity time and, at most once per
//! throttle window (leading edge), queues that timestamp for persistence.
//! The activity writer task drains the queue through the optimistic
//! mutation path.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vigil_core::types::Timestamp;
use vigil_db::repositories::PresenceUpdate;

use crate::tracker::PresenceContext;

/// Coarse input classes that count as user activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivitySignal {
    PointerMove,
    KeyPress,
    PointerDown,
    Touch,
}

impl ActivitySignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PointerMove => "pointer_move",
            Self::KeyPress => "key_press",
            Self::PointerDown => "pointer_down",
            Self::Touch => "touch",
        }
    }
}

struct Clock {
    last_activity: Timestamp,
    last_persisted: Option<Instant>,
}

struct Inner {
    clock: Mutex<Clock>,
    throttle: Duration,
    writes: mpsc::UnboundedSender<Timestamp>,
}

/// Cheap to clone; all clones share one clock and write queue.
#[derive(Clone)]
pub struct ActivityCollector {
    inner: Arc<Inner>,
}

impl ActivityCollector {
    /// Create a collector and the receiving end of its write queue.
    pub fn new(throttle: Duration, started_at: Timestamp) -> (Self, mpsc::UnboundedReceiver<Timestamp>) {
        let (writes, rx) = mpsc::unbounded_channel();
        let collector = Self {
            inner: Arc::new(Inner {
                clock: Mutex::new(Clock {
                    last_activity: started_at,
                    last_persisted: None,
                }),
                throttle,
                writes,
            }),
        };
        (collector, rx)
    }

    fn clock(&self) -> MutexGuard<'_, Clock> {
        self.inner.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Note activity now. Returns `true` when a persisted write was queued.
    pub fn record(&self, signal: ActivitySignal) -> bool {
        let now = Utc::now();
        let mut clock = self.clock();
        if now > clock.last_activity {
            clock.last_activity = now;
        }

        let tick = Instant::now();
        let due = clock
            .last_persisted
            .map_or(true, |at| tick.duration_since(at) >= self.inner.throttle);
        if !due {
            return false;
        }
        clock.last_persisted = Some(tick);
        drop(clock);

        tracing::trace!(signal = signal.as_str(), "Queueing activity write");
        // Closed only after the writer stopped; nothing left to persist to.
        self.inner.writes.send(now).is_ok()
    }

    /// Most recent activity seen by this collector.
    pub fn last_activity(&self) -> Timestamp {
        self.clock().last_activity
    }

    /// Set the in-memory activity time, e.g. after a reactivation persisted
    /// its own timestamp.
    pub fn reset(&self, at: Timestamp) {
        self.clock().last_activity = at;
    }
}

/// Persist queued activity timestamps until cancelled or logged out.
pub(crate) async fn run_activity_writer(
    ctx: Arc<PresenceContext>,
    mut rx: mpsc::UnboundedReceiver<Timestamp>,
    cancel: CancellationToken,
) {
    loop {
        let at = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(at) => at,
                None => break,
            },
        };
        if ctx.is_logged_out() {
            break;
        }
        persist_activity(&ctx, at).await;
    }
    tracing::debug!(user_id = ctx.user_id, "Activity writer stopped");
}

async fn persist_activity(ctx: &PresenceContext, at: Timestamp) {
    let user_id = ctx.user_id;
    match ctx.write(PresenceUpdate::Touch { at }).await {
        Ok(Some(_)) => tracing::debug!(user_id, at = %at, "Activity persisted"),
        Ok(None) => tracing::debug!(user_id, at = %at, "Activity write skipped, record is newer or logged out"),
        Err(e) => tracing::error!(user_id, error = %e, "Failed to persist activity"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bursts_coalesce_into_one_write() {
        let (collector, mut rx) = ActivityCollector::new(Duration::from_secs(60), Utc::now());

        for _ in 0..10 {
            collector.record(ActivitySignal::PointerMove);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(collector.record(ActivitySignal::KeyPress));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn every_signal_updates_memory() {
        let start = Utc::now() - chrono::Duration::hours(1);
        let (collector, _rx) = ActivityCollector::new(Duration::from_secs(60), start);

        collector.record(ActivitySignal::Touch);
        let first = collector.last_activity();
        assert!(first > start);

        collector.record(ActivitySignal::PointerDown);
        assert!(collector.last_activity() >= first);
    }
}
