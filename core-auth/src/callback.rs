//! Redirect callback handling.
//!
//! ```text
//! Start -> ExtractCandidates -> TryExchange(0..n) -> Persist -> UpdateAuthState -> Redirect
//!                                    |                 |
//!                                    +------> Failed <-+
//! ```
//!
//! The controller never returns an error; every failure becomes a
//! [`CallbackOutcome::Failed`] with a retry target and a diagnostic detail.
//! Dropping the future before `Persist` writes nothing, and `Persist` is a
//! single atomic commit.

use crate::error::AuthError;
use crate::exchanger::SessionExchanger;
use crate::extractor::{extract_candidates, provider_error};
use crate::state::AuthState;
use crate::store::SessionStore;
use crate::types::CredentialCandidate;
use core_runtime::config::RouteConfig;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Signed in; navigate to `to`.
    Redirect { to: String },
    Failed {
        /// User-facing summary
        message: String,
        /// Diagnostic detail (provider description or error chain)
        detail: Option<String>,
        /// Where a "try again" action should lead
        retry_to: String,
    },
}

impl CallbackOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallbackOutcome::Redirect { .. })
    }
}

pub struct CallbackController {
    exchanger: SessionExchanger,
    store: Arc<SessionStore>,
    state: AuthState,
    routes: RouteConfig,
    events: EventBus,
}

impl CallbackController {
    pub fn new(
        exchanger: SessionExchanger,
        store: Arc<SessionStore>,
        state: AuthState,
        routes: RouteConfig,
        events: EventBus,
    ) -> Self {
        Self {
            exchanger,
            store,
            state,
            routes,
            events,
        }
    }

    /// Handle the locator the provider redirected to.
    #[instrument(skip(self, locator), fields(callback_id = tracing::field::Empty))]
    pub async fn handle(&self, locator: &str) -> CallbackOutcome {
        let callback_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("callback_id", callback_id.as_str());

        if let Some(error) = provider_error(locator) {
            warn!(code = %error.code, "Provider returned an error to the callback");
            return self.fail(
                &callback_id,
                "Sign-in was cancelled or rejected by the identity provider",
                Some(error.description.unwrap_or(error.code)),
            );
        }

        let mut candidates = extract_candidates(locator);
        let extracted = candidates.len();
        candidates.push(CredentialCandidate::ExistingSession);

        let method = candidates
            .first()
            .map(|c| c.kind().to_string())
            .unwrap_or_default();
        let _ = self
            .events
            .emit(CoreEvent::Auth(AuthEvent::SigningIn { method }));

        let ticket = self.state.begin_check();

        let (kind, authenticated) = match self.exchanger.exchange_first(&candidates).await {
            Ok(found) => found,
            Err(e) => {
                self.state.update(ticket, None);
                let message = if extracted == 0 {
                    "No sign-in credential was found in the redirect"
                } else {
                    "We couldn't complete sign-in"
                };
                return self.fail(&callback_id, message, Some(attempt_detail(&e)));
            }
        };

        if let Err(e) = self
            .store
            .put(&authenticated.session, &authenticated.user.id)
            .await
        {
            let e = AuthError::persist_failed(e);
            self.exchanger.discard_session().await;
            self.state.update(ticket, None);
            return self.fail(
                &callback_id,
                "Signed in, but the session could not be saved",
                Some(e.to_string()),
            );
        }

        let user_id = authenticated.user.id.clone();
        self.state
            .sign_in_completed(authenticated.user, authenticated.session);
        drop(ticket);

        let to = match self.store.take_return_path().await {
            Ok(Some(path)) => path,
            Ok(None) => self.routes.default_destination.clone(),
            Err(e) => {
                warn!(error = %e, "Could not read return path");
                self.routes.default_destination.clone()
            }
        };

        info!(method = %kind, "Callback signed in");
        let _ = self.events.emit(CoreEvent::Auth(AuthEvent::SignedIn {
            user_id,
            method: kind.to_string(),
        }));

        CallbackOutcome::Redirect { to }
    }

    fn fail(&self, callback_id: &str, message: &str, detail: Option<String>) -> CallbackOutcome {
        warn!(detail = detail.as_deref().unwrap_or(""), "{}", message);
        let _ = self.events.emit(CoreEvent::Auth(AuthEvent::CallbackFailed {
            callback_id: callback_id.to_string(),
            message: message.to_string(),
        }));

        CallbackOutcome::Failed {
            message: message.to_string(),
            detail,
            retry_to: self.routes.login_route.clone(),
        }
    }
}

/// One line per failed candidate, in the order they were tried.
fn attempt_detail(error: &AuthError) -> String {
    error
        .attempts()
        .iter()
        .map(|attempt| attempt.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use crate::types::{AuthStatus, AuthenticatedSession, Session, User};
    use bridge_traits::{Clock, FixedClock, MemoryStore};
    use std::time::Duration;

    const NOW: i64 = 2_000_000;

    struct Fixture {
        controller: CallbackController,
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
        let controller = CallbackController::new(
            SessionExchanger::new(Arc::new(provider), clock, Duration::from_secs(10)),
            store.clone(),
            state.clone(),
            RouteConfig::default(),
            events.clone(),
        );
        Fixture {
            controller,
            state,
            store,
            memory,
            events,
        }
    }

    fn signed_in(user: &str) -> AuthenticatedSession {
        AuthenticatedSession {
            session: Session::new("acc", "ref", NOW + 3600),
            user: User::new(user),
        }
    }

    #[tokio::test]
    async fn test_code_flow_persists_and_redirects_home() {
        let mut provider = MockProvider::new();
        provider
            .expect_exchange_code()
            .withf(|code| code == "abc")
            .times(1)
            .returning(|_| Ok(signed_in("u1")));

        let f = fixture(provider);
        let mut rx = f.events.subscribe();

        let outcome = f.controller.handle("/auth/callback?code=abc").await;

        assert_eq!(outcome, CallbackOutcome::Redirect { to: "/".into() });
        assert!(f.state.current().is_authenticated());
        assert_eq!(f.store.user_id().await.unwrap().as_deref(), Some("u1"));

        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::SigningIn { method: "code".into() })
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::SignedIn {
                user_id: "u1".into(),
                method: "code".into()
            })
        );
    }

    #[tokio::test]
    async fn test_saved_return_path_wins_once() {
        let mut provider = MockProvider::new();
        provider
            .expect_exchange_code()
            .returning(|_| Ok(signed_in("u1")));

        let f = fixture(provider);
        f.store.save_return_path("/settings/profile").await.unwrap();

        assert_eq!(
            f.controller.handle("/auth/callback?code=abc").await,
            CallbackOutcome::Redirect {
                to: "/settings/profile".into()
            }
        );
        assert_eq!(f.store.take_return_path().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bare_callback_falls_back_to_existing_session() {
        let mut provider = MockProvider::new();
        provider
            .expect_get_session()
            .times(1)
            .returning(|| Ok(Some(Session::new("acc", "ref", NOW + 60))));
        provider.expect_get_user().returning(|_| Ok(User::new("u5")));

        let f = fixture(provider);
        assert!(f.controller.handle("/auth/callback").await.is_success());
        assert_eq!(f.state.current().user().map(|u| u.id.clone()), Some("u5".into()));
    }

    #[tokio::test]
    async fn test_all_candidates_failing_leaves_storage_untouched() {
        let mut provider = MockProvider::new();
        provider.expect_exchange_code().returning(|_| {
            Err(AuthError::Provider {
                status: 400,
                message: "invalid flow state".into(),
            })
        });
        provider.expect_get_session().returning(|| Ok(None));

        let f = fixture(provider);
        let outcome = f.controller.handle("/auth/callback?code=bad").await;

        match outcome {
            CallbackOutcome::Failed {
                message,
                detail,
                retry_to,
            } => {
                assert_eq!(message, "We couldn't complete sign-in");
                let detail = detail.unwrap();
                assert!(detail.contains("invalid flow state"));
                assert!(detail.contains("existing"));
                assert_eq!(retry_to, "/login");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.state.current(), AuthStatus::Unauthenticated);
        assert!(f.memory.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_becomes_authentication_failed() {
        let mut provider = MockProvider::new();
        provider
            .expect_exchange_code()
            .returning(|_| Ok(signed_in("u1")));
        provider.expect_discard_session().times(1).returning(|| ());

        let f = fixture(provider);
        f.memory.fail_writes(true);

        match f.controller.handle("/auth/callback?code=abc").await {
            CallbackOutcome::Failed { detail, .. } => {
                let detail = detail.unwrap();
                assert!(detail.starts_with("Authentication failed"));
                assert!(detail.contains("persist"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.state.current(), AuthStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn test_provider_error_is_surfaced_without_exchange() {
        let mut provider = MockProvider::new();
        provider.expect_exchange_code().never();
        provider.expect_get_session().never();

        let f = fixture(provider);
        let mut rx = f.events.subscribe();
        let outcome = f
            .controller
            .handle("/auth/callback?error=access_denied&error_description=Email+link+is+invalid+or+has+expired")
            .await;

        match outcome {
            CallbackOutcome::Failed { detail, .. } => {
                assert_eq!(detail.as_deref(), Some("Email link is invalid or has expired"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            CoreEvent::Auth(AuthEvent::CallbackFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_detail_lists_every_candidate_in_order() {
        let mut provider = MockProvider::new();
        provider.expect_exchange_code().returning(|_| {
            Err(AuthError::Provider {
                status: 400,
                message: "code expired".into(),
            })
        });
        provider
            .expect_set_session()
            .returning(|_, _| Err(AuthError::InvalidCredentials));
        provider.expect_get_session().returning(|| Ok(None));

        let f = fixture(provider);
        let outcome = f
            .controller
            .handle("/auth/callback?code=c1#access_token=t&refresh_token=r")
            .await;

        let CallbackOutcome::Failed { detail, .. } = outcome else {
            panic!("unexpected {outcome:?}");
        };
        let detail = detail.unwrap();
        let parts: Vec<&str> = detail.split("; ").collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].contains("code expired"));
        assert!(parts[2].contains("existing"));
    }
}
