//! # Authentication Manager
//!
//! Facade wiring the provider, storage, state, route gate and callback
//! controller together.
//!
//! ## Overview
//!
//! `AuthManager` owns one of each component and exposes the account
//! operations a host needs beyond redirects: password sign-in, sign-up,
//! sign-out, password reset, profile updates and silent session refresh.
//! Every state change is published on the [`EventBus`].
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::AuthManager;
//! use core_runtime::config::AuthConfig;
//! use core_runtime::events::EventBus;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(config: AuthConfig) -> core_auth::Result<()> {
//! let manager = Arc::new(AuthManager::with_gotrue(&config, EventBus::default()));
//! manager.mirror_provider_events();
//! let _refresh = manager.spawn_auto_refresh(Duration::from_secs(30));
//!
//! let signed_in = manager
//!     .sign_in_with_password("ada@example.com", "correct horse")
//!     .await?;
//! println!("continue at {}", signed_in.redirect_to);
//! # Ok(())
//! # }
//! ```

use crate::callback::CallbackController;
use crate::error::{AuthError, Result};
use crate::exchanger::SessionExchanger;
use crate::gate::AuthGate;
use crate::gotrue::GoTrueClient;
use crate::listeners::Subscription;
use crate::provider::{IdentityProvider, ProviderEvent};
use crate::state::AuthState;
use crate::store::SessionStore;
use crate::types::{
    AuthStatus, Session, SignOutScope, SignUpOutcome, User, UserAttributes, UserMetadata,
};
use bridge_traits::Clock;
use core_runtime::config::AuthConfig;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use core_runtime::logging::redact_if_sensitive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

/// Result of a successful interactive sign-in.
#[derive(Debug, Clone, PartialEq)]
pub struct SignInOutcome {
    pub user: User,
    /// Saved return path, or the default destination
    pub redirect_to: String,
}

pub struct AuthManager {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<SessionStore>,
    state: AuthState,
    gate: AuthGate,
    callback: CallbackController,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    default_destination: String,
    refresh_buffer: Duration,
    remote_timeout: Duration,
    /// Serializes refreshes so a refresh token is only spent once
    refresh_lock: tokio::sync::Mutex<()>,
    provider_subscription: Mutex<Option<Subscription>>,
}

impl AuthManager {
    /// Creates a manager over an arbitrary provider.
    pub fn new(config: &AuthConfig, provider: Arc<dyn IdentityProvider>, event_bus: EventBus) -> Self {
        let store = Arc::new(SessionStore::from_config(config));
        let state = AuthState::new();

        let gate = AuthGate::new(
            config.routes.clone(),
            state.clone(),
            store.clone(),
            provider.clone(),
            config.clock.clone(),
            config.timeouts.remote_check_timeout,
            event_bus.clone(),
        );

        let callback = CallbackController::new(
            SessionExchanger::new(
                provider.clone(),
                config.clock.clone(),
                config.timeouts.exchange_timeout,
            ),
            store.clone(),
            state.clone(),
            config.routes.clone(),
            event_bus.clone(),
        );

        Self {
            provider,
            store,
            state,
            gate,
            callback,
            event_bus,
            clock: config.clock.clone(),
            default_destination: config.routes.default_destination.clone(),
            refresh_buffer: config.timeouts.refresh_buffer,
            remote_timeout: config.timeouts.remote_check_timeout,
            refresh_lock: tokio::sync::Mutex::new(()),
            provider_subscription: Mutex::new(None),
        }
    }

    /// Creates a manager backed by [`GoTrueClient`].
    pub fn with_gotrue(config: &AuthConfig, event_bus: EventBus) -> Self {
        Self::new(config, Arc::new(GoTrueClient::new(config)), event_bus)
    }

    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    pub fn callback(&self) -> &CallbackController {
        &self.callback
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn IdentityProvider> {
        &self.provider
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn status(&self) -> AuthStatus {
        self.state.current()
    }

    /// Sign in with email and password.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] if the provider rejects the pair
    /// - [`AuthError::AuthenticationFailed`] if the session cannot be persisted
    #[instrument(skip(self, email, password), fields(email = %redact_if_sensitive("email", email)))]
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<SignInOutcome> {
        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::SigningIn {
            method: "password".to_string(),
        }));

        let authenticated = self
            .provider
            .sign_in_with_password(email, password)
            .await
            .map_err(|e| self.report(e))?;

        self.complete_sign_in(authenticated.user.clone(), authenticated.session, "password")
            .await?;

        Ok(SignInOutcome {
            user: authenticated.user,
            redirect_to: self.resume_destination().await,
        })
    }

    /// Register a new account. When the provider returns a session right
    /// away (no email confirmation), the user is signed in.
    #[instrument(skip(self, email, password, profile), fields(email = %redact_if_sensitive("email", email)))]
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        profile: UserMetadata,
    ) -> Result<SignUpOutcome> {
        let outcome = self
            .provider
            .sign_up(email, password, profile)
            .await
            .map_err(|e| self.report(e))?;

        if let Some(session) = &outcome.session {
            self.complete_sign_in(outcome.user.clone(), session.clone(), "signup")
                .await?;
        } else {
            info!("Account created, awaiting email confirmation");
        }
        Ok(outcome)
    }

    /// Sign out on every device.
    ///
    /// Best effort: local storage and state are cleared even if the provider
    /// call fails or times out. Only a local storage failure is returned.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<()> {
        let user_id = match self.state.current().user() {
            Some(user) => Some(user.id.clone()),
            None => self.store.user_id().await.unwrap_or_default(),
        };

        let remote = tokio::time::timeout(
            self.remote_timeout,
            self.provider.sign_out(SignOutScope::Global),
        )
        .await;
        let remote_confirmed = match remote {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Provider sign-out failed, clearing local session anyway");
                false
            }
            Err(_) => {
                warn!("Provider sign-out timed out, clearing local session anyway");
                false
            }
        };

        let cleared = self.store.clear().await;
        self.state.sign_out();

        info!(remote_confirmed, "Signed out");
        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::SignedOut {
            user_id,
            remote_confirmed,
        }));

        cleared
    }

    /// Send a password reset email. `redirect_to` overrides the configured
    /// redirect URL.
    #[instrument(skip(self, email), fields(email = %redact_if_sensitive("email", email)))]
    pub async fn reset_password(&self, email: &str, redirect_to: Option<String>) -> Result<()> {
        self.provider
            .reset_password_for_email(email, redirect_to)
            .await
            .map_err(|e| self.report(e))
    }

    /// Update email, password or profile data of the signed-in user.
    #[instrument(skip(self, attributes))]
    pub async fn update_user(&self, attributes: UserAttributes) -> Result<User> {
        let session = self.ensure_fresh_session().await?;
        let user = self
            .provider
            .update_user(&session.access_token, attributes)
            .await
            .map_err(|e| self.report(e))?;

        self.state.replace_user(user.clone());
        Ok(user)
    }

    /// The persisted session, refreshed first if it expires within the
    /// refresh buffer.
    ///
    /// # Errors
    ///
    /// - [`AuthError::NotAuthenticated`] if there is no unexpired session
    /// - [`AuthError::SessionExpired`] if the provider rejected the refresh
    ///   token; local state is cleared in that case
    #[instrument(skip(self))]
    pub async fn ensure_fresh_session(&self) -> Result<Session> {
        let _guard = self.refresh_lock.lock().await;

        let session = self
            .store
            .get_active()
            .await?
            .ok_or(AuthError::NotAuthenticated)?;

        if !session.expires_within(self.clock.as_ref(), self.refresh_buffer) {
            trace!("Session still fresh");
            return Ok(session);
        }

        debug!(expires_at = session.expires_at, "Refreshing session");
        match self.provider.refresh_session(&session.refresh_token).await {
            Ok(refreshed) => {
                self.store
                    .put(&refreshed.session, &refreshed.user.id)
                    .await?;
                if !self.state.replace_session(refreshed.session.clone()) {
                    self.state
                        .sign_in_completed(refreshed.user.clone(), refreshed.session.clone());
                }
                let _ = self
                    .event_bus
                    .emit(CoreEvent::Auth(AuthEvent::SessionRefreshed {
                        user_id: refreshed.user.id,
                        expires_at: refreshed.session.expires_at,
                    }));
                Ok(refreshed.session)
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Refresh failed, keeping current session");
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, "Refresh rejected, signing out locally");
                if let Err(e) = self.store.clear().await {
                    warn!(error = %e, "Failed to clear storage after rejected refresh");
                }
                self.state.sign_out();
                let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::AuthError {
                    message: "Session expired".to_string(),
                    recoverable: false,
                }));
                Err(AuthError::SessionExpired)
            }
        }
    }

    /// Refresh the session in the background every `interval` while signed in.
    ///
    /// The task stops once the manager is dropped.
    pub fn spawn_auto_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    debug!("Auth manager dropped, stopping auto refresh");
                    break;
                };
                if !manager.state.current().is_authenticated() {
                    continue;
                }
                if let Err(e) = manager.ensure_fresh_session().await {
                    debug!(error = %e, "Auto refresh skipped");
                }
            }
        })
    }

    /// Keep storage and state in step with auth changes the provider makes
    /// on its own (token refresh, profile update, remote sign-out).
    ///
    /// Each event is stamped when the provider fires it, so one that a later
    /// sign-in or sign-out has overtaken is dropped when its task runs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn mirror_provider_events(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, provider events will not be mirrored");
            return;
        };
        let manager = Arc::downgrade(self);

        let subscription = self.provider.subscribe(Box::new(move |event: &ProviderEvent| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let stamp = manager.state.stamp();
            let event = event.clone();
            handle.spawn(async move { manager.apply_provider_event(event, stamp).await });
        }));

        *self
            .provider_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
    }

    async fn apply_provider_event(&self, event: ProviderEvent, stamp: u64) {
        trace!(event = event.name(), stamp, "Mirroring provider event");
        match event {
            ProviderEvent::TokenRefreshed { .. } | ProviderEvent::UserUpdated { .. }
                if !self.state.is_current(stamp) =>
            {
                debug!(event = event.name(), "Dropping provider event overtaken by a sign-in or sign-out");
            }
            ProviderEvent::TokenRefreshed { session } => {
                let Some(user_id) = self.state.current().user().map(|u| u.id.clone()) else {
                    return;
                };
                if let Err(e) = self.store.put(&session, &user_id).await {
                    warn!(error = %e, "Failed to persist refreshed session");
                    return;
                }
                self.state.replace_session(session);
            }
            ProviderEvent::UserUpdated { user } => {
                self.state.replace_user(user);
            }
            ProviderEvent::SignedOut => {
                let user_id = self.state.current().user().map(|u| u.id.clone());
                if !self.state.sign_out_observed(stamp) {
                    debug!("Ignoring provider sign-out that predates the current session");
                    return;
                }
                if let Err(e) = self.store.clear().await {
                    warn!(error = %e, "Failed to clear storage after provider sign-out");
                }
                let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::SignedOut {
                    user_id,
                    remote_confirmed: true,
                }));
            }
            ProviderEvent::SignedIn { .. } | ProviderEvent::PasswordRecovery => {}
        }
    }

    async fn complete_sign_in(&self, user: User, session: Session, method: &str) -> Result<()> {
        if let Err(e) = self.store.put(&session, &user.id).await {
            self.provider.discard_session().await;
            return Err(self.report(AuthError::persist_failed(e)));
        }

        let user_id = user.id.clone();
        self.state.sign_in_completed(user, session);

        info!(method, "Signed in");
        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::SignedIn {
            user_id,
            method: method.to_string(),
        }));
        Ok(())
    }

    async fn resume_destination(&self) -> String {
        match self.store.take_return_path().await {
            Ok(Some(path)) => path,
            Ok(None) => self.default_destination.clone(),
            Err(e) => {
                warn!(error = %e, "Could not read return path");
                self.default_destination.clone()
            }
        }
    }

    fn report(&self, error: AuthError) -> AuthError {
        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::AuthError {
            message: error.to_string(),
            recoverable: error.is_transient(),
        }));
        error
    }
}
