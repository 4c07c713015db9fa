//! Terminal harness for the presence tracker.
//!
//! Every line on stdin counts as a key press; `code NNNN` submits a
//! reactivation code. Uses PostgreSQL when `DATABASE_URL` is set and an
//! in-memory store otherwise.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::types::DbId;
use vigil_db::postgres::{PgChangeFeed, PgStore};
use vigil_db::{MemoryStore, RemoteStore};
use vigil_events::ChangeFeed;
use vigil_presence::{
    track_activity, ActivitySignal, PresenceConfig, PresenceDeps, SessionError, SessionProvider,
};
use vigil_query::QueryClient;

/// Session stand-in that ends the harness on redirect.
struct TerminalSession {
    done: CancellationToken,
}

#[async_trait]
impl SessionProvider for TerminalSession {
    async fn sign_out(&self) -> Result<(), SessionError> {
        tracing::info!("Session signed out");
        Ok(())
    }

    async fn redirect_to_login(&self) -> Result<(), SessionError> {
        tracing::info!("Redirecting to login");
        self.done.cancel();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil_presence=info,vigil_query=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PresenceConfig::from_env().context("Invalid presence configuration")?;
    let user_id: DbId = std::env::var("USER_ID")
        .unwrap_or_else(|_| "1".into())
        .parse()
        .context("USER_ID must be a number")?;

    let (store, feed): (Arc<dyn RemoteStore>, Arc<dyn ChangeFeed>) =
        match std::env::var("DATABASE_URL") {
            Ok(database_url) => {
                let pool = vigil_db::create_pool(&database_url)
                    .await
                    .context("Failed to connect to database")?;
                tracing::info!("Database connection pool created");

                vigil_db::health_check(&pool)
                    .await
                    .context("Database health check failed")?;
                tracing::info!("Database health check passed");

                vigil_db::run_migrations(&pool)
                    .await
                    .context("Failed to run database migrations")?;
                tracing::info!("Database migrations applied");

                let feed = PgChangeFeed::start(pool.clone());
                (Arc::new(PgStore::new(pool)) as Arc<dyn RemoteStore>, feed as Arc<dyn ChangeFeed>)
            }
            Err(_) => {
                tracing::info!("DATABASE_URL not set, using in-memory store");
                let store = Arc::new(MemoryStore::new());
                (store.clone() as Arc<dyn RemoteStore>, store as Arc<dyn ChangeFeed>)
            }
        };

    let done = CancellationToken::new();
    let deps = PresenceDeps {
        client: QueryClient::new(store, feed),
        session: Arc::new(TerminalSession { done: done.clone() }),
    };
    let tracking = track_activity(deps, user_id, config)
        .await
        .context("Failed to start presence tracking")?;
    tracing::info!(user_id, "Tracking activity; type to stay active, `code NNNN` to reactivate");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = &mut shutdown => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                tracking.record(ActivitySignal::KeyPress);
                if let Some(code) = line.trim().strip_prefix("code ") {
                    let accepted = tracking.reactivate(code).await;
                    tracing::info!(accepted, "Reactivation submitted");
                } else if let Some(challenge) = tracking.challenge() {
                    tracing::info!(code = challenge.code(), "Reactivation required");
                }
            }
        }
    }

    tracking.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
