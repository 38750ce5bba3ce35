//! Login, logout and session resumption.
//!
//! | Routine | Server method | Options |
//! |---------|---------------|---------|
//! | [`Client::login`] / [`Client::login_with`] | `login` | `wait` (+ caller options) |
//! | [`Client::login_via`] | any | `wait` (+ caller options) |
//! | [`Client::logout`] | `logout` | none |
//! | resume (after every `connected`) | `login` with `{resume: token}` | `wait`, `skip_queue` |
//!
//! A successful login stores the returned token under
//! [`SessionConfig::token_key`](crate::SessionConfig::token_key).
//!
//! Resumption can be replaced with
//! [`ClientBuilder::resume_with`](crate::ClientBuilder::resume_with).

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::LogoutFailure;
use crate::error::{Error, Result};
use crate::session::{CallOptions, SessionEvent, validate_name};

use super::core::Client;

// ============================================================================
// ResumeHandler
// ============================================================================

/// Routine run after every `connected` in place of token resumption.
///
/// The method queue is held until the returned future resolves, so calls
/// made from it need [`CallOptions::skip_queue`].
pub(crate) type ResumeHandler = Arc<dyn Fn(Client) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Boxes a resume closure.
pub(crate) fn resume_handler<F, Fut>(handler: F) -> ResumeHandler
where
    F: Fn(Client) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |client| Box::pin(handler(client)))
}

// ============================================================================
// LoginResult
// ============================================================================

/// Payload of a successful `login` call.
#[derive(Debug, Deserialize)]
struct LoginResult {
    id: String,
    #[serde(default)]
    token: Option<String>,
}

impl LoginResult {
    fn parse(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::validation(format!("Malformed login result: {e}")))
    }
}

// ============================================================================
// Client - Authentication
// ============================================================================

impl Client {
    /// Logs in with `params` (for example `{"user": {...}, "password": ...}`).
    ///
    /// Returns the user id. On failure the local session is cleared.
    ///
    /// # Errors
    ///
    /// - [`Error::Server`] if the server rejected the credentials
    /// - [`Error::Validation`] if the result has no user id
    /// - [`Error::Canceled`] if the call was dropped locally
    pub async fn login(&self, params: Value) -> Result<String> {
        self.login_with(params, CallOptions::new()).await
    }

    /// Logs in with extra call options, typically
    /// [`CallOptions::skip_queue`] to jump ahead of queued calls.
    ///
    /// `wait` is always set so calls issued afterwards run once the login
    /// settled.
    ///
    /// # Errors
    ///
    /// Same as [`Client::login`].
    pub async fn login_with(&self, params: Value, options: CallOptions) -> Result<String> {
        self.login_via("login", vec![params], options).await
    }

    /// Logs in through a custom server method returning `{id, token?}`.
    ///
    /// Goes through the same bookkeeping as [`Client::login`]: the token is
    /// stored on success and the local session is cleared on failure.
    ///
    /// # Errors
    ///
    /// Same as [`Client::login`], plus [`Error::Validation`] if `method` is
    /// empty.
    pub async fn login_via(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
        options: CallOptions,
    ) -> Result<String> {
        let method = method.into();
        validate_name("method", &method)?;
        self.emit(SessionEvent::LoggingIn);
        self.run_login(method, params, options.wait()).await
    }

    /// Calls `logout` and clears the local session.
    ///
    /// # Errors
    ///
    /// Returns the call error. Whether the local session is cleared anyway
    /// depends on [`LogoutFailure`].
    pub async fn logout(&self) -> Result<()> {
        match self.call("logout", Vec::new()).await {
            Ok(_) => {
                self.clear_session().await;
                info!("Logged out");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Logout failed");
                if self.inner.config.logout_failure == LogoutFailure::ForceLogout {
                    self.clear_session().await;
                }
                self.emit(SessionEvent::LogoutError(Arc::new(e.clone())));
                Err(e)
            }
        }
    }

    /// Runs the configured resume routine. Never fails.
    pub(crate) async fn resume(&self) {
        let Some(handler) = self.inner.resume.clone() else {
            self.resume_from_token().await;
            return;
        };
        if let Err(e) = handler(self.clone()).await {
            debug!(error = %e, "Custom session resumption failed");
            self.emit(SessionEvent::ResumeLoginError(Arc::new(e)));
        }
    }

    /// Resumes the session from the stored token.
    async fn resume_from_token(&self) {
        self.emit(SessionEvent::LoggingIn);

        let token = match self.inner.storage.get(&self.inner.config.token_key()).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read login token");
                None
            }
        };

        let Some(token) = token else {
            debug!("No stored login token");
            self.emit(SessionEvent::LoginError(Arc::new(Error::validation(
                "No login token",
            ))));
            return;
        };

        let options = CallOptions::new().wait().skip_queue();
        let params = vec![json!({ "resume": token })];
        if let Err(e) = self.run_login("login".to_string(), params, options).await {
            // The session was already cleared by the failed login
            debug!(error = %e, "Session resumption failed");
            self.emit(SessionEvent::ResumeLoginError(Arc::new(e)));
        }
    }

    /// Runs a login call and records its outcome.
    async fn run_login(
        &self,
        method: String,
        params: Vec<Value>,
        options: CallOptions,
    ) -> Result<String> {
        let outcome = self
            .call_with(method, params, options)
            .await
            .and_then(LoginResult::parse);

        let login = match outcome {
            Ok(login) => login,
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.emit(SessionEvent::LoginError(Arc::new(e.clone())));
                self.clear_session().await;
                return Err(e);
            }
        };

        self.set_user(Some(login.id.clone())).await?;
        if let Some(token) = &login.token
            && let Err(e) = self
                .inner
                .storage
                .set(&self.inner.config.token_key(), token)
                .await
        {
            warn!(error = %e, "Failed to store login token");
        }

        info!(user_id = %login.id, "Logged in");
        self.emit(SessionEvent::LoggedIn {
            user_id: login.id.clone(),
        });
        Ok(login.id)
    }

    /// Forgets the user and the stored token, then emits `LoggedOut`.
    async fn clear_session(&self) {
        let _ = self.set_user(None).await;
        if let Err(e) = self.inner.storage.del(&self.inner.config.token_key()).await {
            warn!(error = %e, "Failed to delete login token");
        }
        self.emit(SessionEvent::LoggedOut);
    }
}
