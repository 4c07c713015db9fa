//! Forced logout after the terminal inactivity level.

use std::sync::Arc;

use chrono::Utc;
use vigil_core::types::DbId;
use vigil_db::models::presence::ActivityLogEntry;
use vigil_db::repositories::ActivityLogRepo;
use vigil_db::RemoteStore;

use crate::session::SessionProvider;

/// Log the logout, end the session and redirect to login.
///
/// Each step runs even if the one before it failed; the redirect always
/// happens.
pub(crate) async fn forced_logout(
    store: Arc<dyn RemoteStore>,
    session: Arc<dyn SessionProvider>,
    user_id: DbId,
) {
    let entry = ActivityLogEntry::auto_logout(user_id, Utc::now());
    if let Err(e) = ActivityLogRepo::append(store.as_ref(), &entry).await {
        tracing::error!(user_id, error = %e, "Failed to log forced logout");
    }

    if let Err(e) = session.sign_out().await {
        tracing::error!(user_id, error = %e, "Sign-out failed during forced logout");
    }

    match session.redirect_to_login().await {
        Ok(()) => tracing::info!(user_id, "User logged out after inactivity"),
        Err(e) => tracing::error!(user_id, error = %e, "Redirect to login failed"),
    }
}
