//! Route guard.
//!
//! Each navigation is resolved by walking a fixed sequence of steps, stopping
//! at the first one that can decide:
//!
//! ```text
//! Start ──public──────────────────────────────────► RenderUnprotected
//!   │
//! CheckContext ──authenticated────────────────────► RenderProtected
//!   │
//! CheckPersistedSession ──unexpired session───────► RenderProtected
//!   │                        (+ background get_user refresh)
//! CheckRemoteSession ──provider session───────────► RenderProtected
//!   │
//! RedirectToLogin ──save return path──────────────► Redirect(login)
//! ```
//!
//! Storage is re-read on every resolve. The remote step is bounded by the
//! remote check timeout and fails closed.

use crate::error::AuthError;
use crate::provider::IdentityProvider;
use crate::state::{AuthState, CheckTicket};
use crate::store::SessionStore;
use crate::types::{Session, User};
use bridge_traits::Clock;
use core_runtime::config::RouteConfig;
use core_runtime::events::{CoreEvent, EventBus, RouteEvent};
use core_runtime::logging::strip_credentials;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

/// What the host should do for a navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    RenderUnprotected,
    RenderProtected,
    Redirect { to: String },
    /// A check is still outstanding (only returned by [`AuthGate::peek`]).
    Loading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStep {
    Start,
    CheckContext,
    CheckPersistedSession,
    CheckRemoteSession,
    RedirectToLogin,
}

enum Transition {
    Next(GateStep),
    Done(GateDecision),
}

pub struct AuthGate {
    routes: RouteConfig,
    state: AuthState,
    store: Arc<SessionStore>,
    provider: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    remote_timeout: Duration,
    events: EventBus,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl AuthGate {
    pub fn new(
        routes: RouteConfig,
        state: AuthState,
        store: Arc<SessionStore>,
        provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        remote_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            routes,
            state,
            store,
            provider,
            clock,
            remote_timeout,
            events,
            background: Mutex::new(None),
        }
    }

    /// Decide how to handle a navigation to `path`.
    #[instrument(skip(self, path), fields(path = %strip_credentials(path)))]
    pub async fn resolve(&self, path: &str) -> GateDecision {
        let mut step = GateStep::Start;
        let mut ticket: Option<CheckTicket> = None;

        loop {
            trace!(step = ?step, "Gate step");
            let transition = match step {
                GateStep::Start => {
                    if self.routes.is_public(path) {
                        Transition::Done(GateDecision::RenderUnprotected)
                    } else {
                        Transition::Next(GateStep::CheckContext)
                    }
                }
                GateStep::CheckContext => {
                    if self.context_authenticated() {
                        Transition::Done(GateDecision::RenderProtected)
                    } else {
                        ticket = Some(self.state.begin_check());
                        Transition::Next(GateStep::CheckPersistedSession)
                    }
                }
                GateStep::CheckPersistedSession => match self.persisted_session().await {
                    Some(session) => {
                        if let Some(ticket) = ticket.take() {
                            self.spawn_refresh(ticket, session, path);
                        }
                        Transition::Done(GateDecision::RenderProtected)
                    }
                    None => Transition::Next(GateStep::CheckRemoteSession),
                },
                GateStep::CheckRemoteSession => {
                    let found = self.remote_session().await;
                    if let Some(ticket) = ticket.take() {
                        self.settle_remote(ticket, found).await;
                    }

                    // Also covers a sign-in that completed while the check was in flight
                    if self.context_authenticated() {
                        Transition::Done(GateDecision::RenderProtected)
                    } else {
                        Transition::Next(GateStep::RedirectToLogin)
                    }
                }
                GateStep::RedirectToLogin => {
                    if let Err(e) = self.store.save_return_path(path).await {
                        warn!(error = %e, "Could not save return path");
                    }
                    let to = self.routes.login_route.clone();
                    let _ = self.events.emit(CoreEvent::Route(RouteEvent::AccessDenied {
                        path: strip_credentials(path).to_string(),
                        redirect_to: to.clone(),
                    }));
                    Transition::Done(GateDecision::Redirect { to })
                }
            };

            match transition {
                Transition::Next(next) => step = next,
                Transition::Done(decision) => {
                    debug!(decision = ?decision, "Gate resolved");
                    return decision;
                }
            }
        }
    }

    /// Synchronous answer from in-memory state only.
    ///
    /// `Loading` while the status is still unknown or being checked.
    pub fn peek(&self, path: &str) -> GateDecision {
        if self.routes.is_public(path) {
            GateDecision::RenderUnprotected
        } else if self.context_authenticated() {
            GateDecision::RenderProtected
        } else if self.state.current().is_settled() {
            GateDecision::Redirect {
                to: self.routes.login_route.clone(),
            }
        } else {
            GateDecision::Loading
        }
    }

    /// Wait for the in-flight background refresh, if any.
    pub async fn settle(&self) {
        let handle = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background session refresh aborted");
            }
        }
    }

    fn context_authenticated(&self) -> bool {
        self.state
            .current()
            .session()
            .is_some_and(|session| !session.is_expired(self.clock.as_ref()))
    }

    async fn persisted_session(&self) -> Option<Session> {
        match self.store.get_active().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Could not read persisted session");
                None
            }
        }
    }

    /// Persist and apply a remote check result.
    ///
    /// A session found by a check that a sign-out has since overtaken is
    /// dropped unwritten, and a session that cannot be persisted is treated
    /// as no session.
    async fn settle_remote(&self, ticket: CheckTicket, found: Option<(User, Session)>) {
        let found = match found {
            Some(_) if !self.state.admits(&ticket) => {
                debug!("Discarding remote session found before a sign-out");
                None
            }
            Some((user, session)) => match self.store.put(&session, &user.id).await {
                Ok(()) => Some((user, session)),
                Err(e) => {
                    warn!(error = %e, "Could not persist provider session, failing closed");
                    self.provider.discard_session().await;
                    None
                }
            },
            None => None,
        };

        let persisted = found.is_some();
        let applied = self.state.update(ticket, found);

        // A sign-out landed while the session was being written
        if persisted && !applied && !self.context_authenticated() {
            if let Err(e) = self.store.clear().await {
                warn!(error = %e, "Could not remove session written by a stale check");
            }
        }
    }

    async fn remote_session(&self) -> Option<(User, Session)> {
        let lookup = async {
            let Some(session) = self.provider.get_session().await? else {
                return Ok(None);
            };
            if session.is_expired(self.clock.as_ref()) {
                return Ok(None);
            }
            let user = self.provider.get_user(&session.access_token).await?;
            Ok::<_, AuthError>(Some((user, session)))
        };

        match tokio::time::timeout(self.remote_timeout, lookup).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(error = %e, "Remote session check failed");
                None
            }
            Err(_) => {
                warn!(timeout_ms = self.remote_timeout.as_millis() as u64, "Remote session check timed out");
                None
            }
        }
    }

    fn spawn_refresh(&self, ticket: CheckTicket, session: Session, path: &str) {
        let mut slot = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            trace!("Background refresh already running");
            return;
        }

        let provider = self.provider.clone();
        let state = self.state.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let timeout = self.remote_timeout;
        let path = strip_credentials(path).to_string();

        *slot = Some(tokio::spawn(async move {
            let outcome =
                tokio::time::timeout(timeout, provider.get_user(&session.access_token)).await;
            match outcome {
                Ok(Ok(user)) => {
                    state.update(ticket, Some((user, session)));
                }
                Ok(Err(e)) if e.is_rejection() => {
                    warn!(error = %e, "Persisted session rejected by provider");
                    if state.update(ticket, None) {
                        if let Err(e) = store.clear().await {
                            warn!(error = %e, "Failed to clear rejected session");
                        }
                        let _ = events.emit(CoreEvent::Route(RouteEvent::SessionRevoked { path }));
                    }
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Background session refresh failed");
                }
                Err(_) => {
                    debug!("Background session refresh timed out");
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use crate::types::AuthStatus;
    use bridge_traits::{FixedClock, MemoryStore};

    const NOW: i64 = 1_000_000;

    struct Fixture {
        gate: AuthGate,
        state: AuthState,
        store: Arc<SessionStore>,
        memory: Arc<MemoryStore>,
        events: EventBus,
    }

    fn fixture(provider: MockProvider) -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::at_unix(NOW));
        let store = Arc::new(SessionStore::new(
            memory.clone(),
            clock.clone(),
            "auth",
            Vec::new(),
        ));
        let state = AuthState::new();
        let events = EventBus::new(16);
        let gate = AuthGate::new(
            RouteConfig::default(),
            state.clone(),
            store.clone(),
            Arc::new(provider),
            clock,
            Duration::from_secs(5),
            events.clone(),
        );
        Fixture {
            gate,
            state,
            store,
            memory,
            events,
        }
    }

    fn live() -> Session {
        Session::new("acc", "ref", NOW + 600)
    }

    #[tokio::test]
    async fn test_public_route_renders_without_checks() {
        let f = fixture(MockProvider::new());
        assert_eq!(f.gate.resolve("/login").await, GateDecision::RenderUnprotected);
        assert_eq!(f.gate.peek("/signup?ref=x"), GateDecision::RenderUnprotected);
        assert_eq!(f.state.current(), AuthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_authenticated_context_short_circuits() {
        let mut provider = MockProvider::new();
        provider.expect_get_session().never();
        provider.expect_get_user().never();

        let f = fixture(provider);
        f.state.sign_in_completed(User::new("u1"), live());

        assert_eq!(f.gate.peek("/dashboard"), GateDecision::RenderProtected);
        assert_eq!(f.gate.resolve("/dashboard").await, GateDecision::RenderProtected);
    }

    #[tokio::test]
    async fn test_persisted_session_renders_and_refreshes_in_background() {
        let mut provider = MockProvider::new();
        provider
            .expect_get_user()
            .withf(|token| token == "acc")
            .times(1)
            .returning(|_| Ok(User::new("u1")));
        provider.expect_get_session().never();

        let f = fixture(provider);
        f.store.put(&live(), "u1").await.unwrap();

        assert_eq!(f.gate.peek("/dashboard"), GateDecision::Loading);
        assert_eq!(f.gate.resolve("/dashboard").await, GateDecision::RenderProtected);

        f.gate.settle().await;
        assert_eq!(f.state.current().user().map(|u| u.id.as_str()), Some("u1"));
    }

    #[tokio::test]
    async fn test_rejected_persisted_session_is_cleared() {
        let mut provider = MockProvider::new();
        provider.expect_get_user().returning(|_| {
            Err(AuthError::Provider {
                status: 401,
                message: "invalid JWT".into(),
            })
        });

        let f = fixture(provider);
        let mut rx = f.events.subscribe();
        f.store.put(&live(), "u1").await.unwrap();

        assert_eq!(f.gate.resolve("/dashboard").await, GateDecision::RenderProtected);
        f.gate.settle().await;

        assert_eq!(f.state.current(), AuthStatus::Unauthenticated);
        assert!(f.memory.snapshot().is_empty());
        assert!(matches!(
            rx.recv().await.unwrap(),
            CoreEvent::Route(RouteEvent::SessionRevoked { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_session_is_adopted_and_persisted() {
        let mut provider = MockProvider::new();
        provider.expect_get_session().returning(|| Ok(Some(live())));
        provider.expect_get_user().returning(|_| Ok(User::new("u7")));

        let f = fixture(provider);

        assert_eq!(f.gate.resolve("/dashboard").await, GateDecision::RenderProtected);
        assert!(f.state.current().is_authenticated());
        assert_eq!(f.store.user_id().await.unwrap().as_deref(), Some("u7"));
    }

    #[tokio::test]
    async fn test_no_session_redirects_and_saves_return_path() {
        let mut provider = MockProvider::new();
        provider.expect_get_session().returning(|| Ok(None));

        let f = fixture(provider);
        let mut rx = f.events.subscribe();

        assert_eq!(
            f.gate.resolve("/dashboard?tab=2").await,
            GateDecision::Redirect { to: "/login".into() }
        );
        assert_eq!(f.state.current(), AuthStatus::Unauthenticated);
        assert_eq!(
            f.store.take_return_path().await.unwrap().as_deref(),
            Some("/dashboard?tab=2")
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::Route(RouteEvent::AccessDenied {
                path: "/dashboard".into(),
                redirect_to: "/login".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_remote_failure_fails_closed() {
        let mut provider = MockProvider::new();
        provider
            .expect_get_session()
            .returning(|| Err(AuthError::Network("offline".into())));

        let f = fixture(provider);
        assert!(matches!(
            f.gate.resolve("/settings").await,
            GateDecision::Redirect { .. }
        ));
        assert_eq!(f.state.current(), AuthStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn test_expired_persisted_session_counts_as_none() {
        let mut provider = MockProvider::new();
        provider.expect_get_user().never();
        provider.expect_get_session().returning(|| Ok(None));

        let f = fixture(provider);
        f.store
            .put(&Session::new("old", "ref", NOW - 1), "u1")
            .await
            .unwrap();

        assert!(matches!(
            f.gate.resolve("/dashboard").await,
            GateDecision::Redirect { .. }
        ));
    }

    #[tokio::test]
    async fn test_unpersistable_remote_session_fails_closed() {
        let mut provider = MockProvider::new();
        provider.expect_get_session().returning(|| Ok(Some(live())));
        provider.expect_get_user().returning(|_| Ok(User::new("u7")));
        provider.expect_discard_session().times(1).returning(|| ());

        let f = fixture(provider);
        f.memory.fail_writes(true);

        assert_eq!(
            f.gate.resolve("/dashboard").await,
            GateDecision::Redirect { to: "/login".into() }
        );
        assert_eq!(f.state.current(), AuthStatus::Unauthenticated);
        assert!(f.memory.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_peek_redirects_once_unauthenticated() {
        let f = fixture(MockProvider::new());
        assert_eq!(f.gate.peek("/dashboard"), GateDecision::Loading);

        let ticket = f.state.begin_check();
        assert_eq!(f.gate.peek("/dashboard"), GateDecision::Loading);
        f.state.update(ticket, None);

        assert_eq!(
            f.gate.peek("/dashboard"),
            GateDecision::Redirect { to: "/login".into() }
        );
        assert_eq!(f.gate.peek("/login"), GateDecision::RenderUnprotected);
    }
}
