//! Authentication/session collaborator.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Sign-out failed: {0}")]
    SignOut(String),

    #[error("Redirect failed: {0}")]
    Redirect(String),
}

/// Ends the user's session. Provided by the embedding application.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Revoke the current session.
    async fn sign_out(&self) -> Result<(), SessionError>;

    /// Send the user to the login surface.
    async fn redirect_to_login(&self) -> Result<(), SessionError>;
}
