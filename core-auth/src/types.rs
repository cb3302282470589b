use bridge_traits::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Free-form profile attributes attached to a user (display name, avatar...).
pub type UserMetadata = HashMap<String, Value>;

/// Canonical session material.
///
/// `expires_at` is Unix epoch seconds and must be checked against an injected
/// [`Clock`] before the session is used: an expired session is treated the
/// same as no session.
///
/// # Security
///
/// Tokens should never be logged. The `Debug` implementation redacts them.
///
/// # Examples
///
/// ```
/// use bridge_traits::FixedClock;
/// use core_auth::Session;
///
/// let clock = FixedClock::at_unix(1_000);
/// let session = Session::new("access", "refresh", 4_600);
///
/// assert!(!session.is_expired(&clock));
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl Session {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            token_type: None,
        }
    }

    /// Build a session from a relative lifetime as returned by token endpoints.
    pub fn from_expires_in(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: i64,
        clock: &dyn Clock,
    ) -> Self {
        Self::new(
            access_token,
            refresh_token,
            clock.unix_timestamp() + expires_in,
        )
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = Some(token_type.into());
        self
    }

    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        clock.unix_timestamp() >= self.expires_at
    }

    /// True if the session is expired or will expire within `window`.
    pub fn expires_within(&self, clock: &dyn Clock, window: Duration) -> bool {
        clock.unix_timestamp() + window.as_secs() as i64 >= self.expires_at
    }

    /// Seconds until expiry, or `None` if already expired.
    pub fn seconds_remaining(&self, clock: &dyn Clock) -> Option<i64> {
        let remaining = self.expires_at - clock.unix_timestamp();
        (remaining > 0).then_some(remaining)
    }
}

// Custom Debug implementation to avoid logging tokens
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Identity of the signed-in user as reported by the provider.
///
/// Only `id` is ever persisted, next to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            user_metadata: UserMetadata::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// `full_name`, then `name`, then the email local part.
    pub fn display_name(&self) -> Option<String> {
        ["full_name", "name"]
            .iter()
            .find_map(|key| self.user_metadata.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .or_else(|| {
                self.email
                    .as_deref()
                    .and_then(|email| email.split('@').next())
                    .map(str::to_string)
            })
    }
}

/// Result of a successful credential exchange or sign-in.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedSession {
    pub session: Session,
    pub user: User,
}

/// Where a credential candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialKind {
    /// `?code=` from a PKCE redirect
    AuthorizationCode,
    /// Token pair in the URL fragment (implicit flow)
    AccessTokenFragment,
    /// Token pair in the query string
    AccessTokenQuery,
    /// No credential in the redirect; ask the provider for its current session
    ExistingSession,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::AuthorizationCode => "code",
            CredentialKind::AccessTokenFragment => "fragment",
            CredentialKind::AccessTokenQuery => "query",
            CredentialKind::ExistingSession => "existing",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential found in a redirect, not yet exchanged.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialCandidate {
    AuthorizationCode {
        code: String,
    },
    AccessTokenFragment {
        access_token: String,
        refresh_token: String,
    },
    AccessTokenQuery {
        access_token: String,
        refresh_token: String,
    },
    ExistingSession,
}

impl CredentialCandidate {
    pub fn kind(&self) -> CredentialKind {
        match self {
            CredentialCandidate::AuthorizationCode { .. } => CredentialKind::AuthorizationCode,
            CredentialCandidate::AccessTokenFragment { .. } => CredentialKind::AccessTokenFragment,
            CredentialCandidate::AccessTokenQuery { .. } => CredentialKind::AccessTokenQuery,
            CredentialCandidate::ExistingSession => CredentialKind::ExistingSession,
        }
    }
}

impl fmt::Debug for CredentialCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCandidate")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Process-wide authentication status.
///
/// ```text
/// Unknown -> Checking -> Authenticated
///               |             |
///               v             v
///         Unauthenticated <---+
/// ```
///
/// `Checking` always resolves: remote checks are bounded and an abandoned
/// check resolves to `Unauthenticated`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AuthStatus {
    #[default]
    Unknown,
    Checking,
    Authenticated {
        user: User,
        session: Session,
    },
    Unauthenticated,
}

impl AuthStatus {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthStatus::Authenticated { .. })
    }

    /// `Unknown` and `Checking` are unsettled.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            AuthStatus::Authenticated { .. } | AuthStatus::Unauthenticated
        )
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            AuthStatus::Authenticated { user, .. } => Some(user),
            _ => None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthStatus::Authenticated { session, .. } => Some(session),
            _ => None,
        }
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStatus::Unknown => write!(f, "Unknown"),
            AuthStatus::Checking => write!(f, "Checking..."),
            AuthStatus::Authenticated { user, .. } => write!(f, "Authenticated ({})", user.id),
            AuthStatus::Unauthenticated => write!(f, "Unauthenticated"),
        }
    }
}

/// Which sessions a sign-out revokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignOutScope {
    /// Every session of the user, on all devices
    #[default]
    Global,
    /// Only this session
    Local,
    /// Every session except this one
    Others,
}

impl SignOutScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignOutScope::Global => "global",
            SignOutScope::Local => "local",
            SignOutScope::Others => "others",
        }
    }
}

/// Fields accepted by a profile update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<UserMetadata>,
}

/// Outcome of a sign-up. `session` is `None` while email confirmation is pending.
#[derive(Debug, Clone, PartialEq)]
pub struct SignUpOutcome {
    pub user: User,
    pub session: Option<Session>,
}
