//! Identity provider boundary.
//!
//! Everything this crate knows about the remote identity service goes through
//! [`IdentityProvider`]. [`GoTrueClient`](crate::gotrue::GoTrueClient) is the
//! HTTP implementation; tests substitute a `mockall` double.

use crate::error::Result;
use crate::listeners::Subscription;
use crate::types::{
    AuthenticatedSession, Session, SignOutScope, SignUpOutcome, User, UserAttributes,
    UserMetadata,
};
use async_trait::async_trait;

/// Auth-change notifications emitted by a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    SignedIn { user: User, session: Session },
    TokenRefreshed { session: Session },
    UserUpdated { user: User },
    SignedOut,
    PasswordRecovery,
}

impl ProviderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderEvent::SignedIn { .. } => "SIGNED_IN",
            ProviderEvent::TokenRefreshed { .. } => "TOKEN_REFRESHED",
            ProviderEvent::UserUpdated { .. } => "USER_UPDATED",
            ProviderEvent::SignedOut => "SIGNED_OUT",
            ProviderEvent::PasswordRecovery => "PASSWORD_RECOVERY",
        }
    }
}

pub type ProviderListener = Box<dyn Fn(&ProviderEvent) + Send + Sync>;

/// Operations the authentication layer needs from the identity service.
///
/// Implementations must not log token material and should map HTTP-level
/// rejections to [`AuthError::Provider`](crate::AuthError::Provider) or one
/// of the more specific variants.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The provider's current, unexpired session, if it holds one.
    async fn get_session(&self) -> Result<Option<Session>>;

    /// Resolve the user an access token belongs to.
    async fn get_user(&self, access_token: &str) -> Result<User>;

    /// Exchange a PKCE authorization code.
    async fn exchange_code(&self, code: &str) -> Result<AuthenticatedSession>;

    /// Adopt an externally obtained token pair as the current session.
    async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthenticatedSession>;

    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<AuthenticatedSession>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        profile: UserMetadata,
    ) -> Result<SignUpOutcome>;

    async fn sign_out(&self, scope: SignOutScope) -> Result<()>;

    /// Send a password reset email. `redirect_to` is where the link lands.
    async fn reset_password_for_email(&self, email: &str, redirect_to: Option<String>)
        -> Result<()>;

    async fn update_user(&self, access_token: &str, attributes: UserAttributes) -> Result<User>;

    /// Forget the in-memory session without contacting the service.
    ///
    /// Called when a session the provider handed out could not be persisted,
    /// so the next `get_session` does not resurrect it.
    async fn discard_session(&self) {}

    /// Register for auth-change events. Dropping the subscription unregisters.
    fn subscribe(&self, listener: ProviderListener) -> Subscription;
}
