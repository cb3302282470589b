//! Turns credential candidates into a verified session and user.

use crate::error::{AuthError, Result};
use crate::provider::IdentityProvider;
use crate::types::{AuthenticatedSession, CredentialCandidate, CredentialKind};
use bridge_traits::Clock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Exchanges one candidate at a time against the identity provider.
///
/// | candidate               | provider calls                 |
/// |-------------------------|--------------------------------|
/// | `AuthorizationCode`     | `exchange_code`                |
/// | `AccessToken{Fragment,Query}` | `set_session`, `get_user` |
/// | `ExistingSession`       | `get_session`, `get_user`      |
///
/// Every provider call is bounded by the exchange timeout.
pub struct SessionExchanger {
    provider: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl SessionExchanger {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            clock,
            timeout,
        }
    }

    /// # Errors
    ///
    /// Any failure, including a timeout, is wrapped in
    /// [`AuthError::ExchangeFailed`] tagged with the candidate's kind.
    #[instrument(skip(self, candidate), fields(kind = %candidate.kind()))]
    pub async fn exchange(&self, candidate: &CredentialCandidate) -> Result<AuthenticatedSession> {
        let kind = candidate.kind();
        let authenticated = self
            .exchange_inner(candidate)
            .await
            .map_err(|source| AuthError::exchange(kind, source))?;

        if authenticated.session.is_expired(self.clock.as_ref()) {
            return Err(AuthError::exchange(kind, AuthError::SessionExpired));
        }

        debug!("Candidate exchanged");
        Ok(authenticated)
    }

    /// Try `candidates` in order and return the first success.
    ///
    /// # Errors
    ///
    /// - [`AuthError::ExtractionEmpty`] if `candidates` is empty
    /// - [`AuthError::AuthenticationFailed`] carrying the last failure, and
    ///   the earlier ones in `earlier`, otherwise
    pub async fn exchange_first(
        &self,
        candidates: &[CredentialCandidate],
    ) -> Result<(CredentialKind, AuthenticatedSession)> {
        let mut failures = Vec::new();

        for candidate in candidates {
            match self.exchange(candidate).await {
                Ok(authenticated) => return Ok((candidate.kind(), authenticated)),
                Err(e) => {
                    warn!(kind = %candidate.kind(), error = %e, "Candidate rejected, trying next");
                    failures.push(e);
                }
            }
        }

        Err(match failures.pop() {
            Some(cause) => AuthError::AuthenticationFailed {
                last_cause: Box::new(cause),
                earlier: failures,
            },
            None => AuthError::ExtractionEmpty,
        })
    }

    /// Drop whatever session the provider is holding in memory.
    pub async fn discard_session(&self) {
        self.provider.discard_session().await;
    }

    async fn exchange_inner(
        &self,
        candidate: &CredentialCandidate,
    ) -> Result<AuthenticatedSession> {
        match candidate {
            CredentialCandidate::AuthorizationCode { code } => {
                self.bounded("exchange_code", self.provider.exchange_code(code))
                    .await
            }
            CredentialCandidate::AccessTokenFragment {
                access_token,
                refresh_token,
            }
            | CredentialCandidate::AccessTokenQuery {
                access_token,
                refresh_token,
            } => {
                let session = self
                    .bounded(
                        "set_session",
                        self.provider.set_session(access_token, refresh_token),
                    )
                    .await?;
                let user = self
                    .bounded("get_user", self.provider.get_user(&session.access_token))
                    .await?;
                Ok(AuthenticatedSession { session, user })
            }
            CredentialCandidate::ExistingSession => {
                let session = self
                    .bounded("get_session", self.provider.get_session())
                    .await?
                    .ok_or(AuthError::NotAuthenticated)?;
                let user = self
                    .bounded("get_user", self.provider.get_user(&session.access_token))
                    .await?;
                Ok(AuthenticatedSession { session, user })
            }
        }
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| AuthError::NetworkTimeout {
                operation: operation.to_string(),
                timeout: self.timeout,
            })?
    }
}
