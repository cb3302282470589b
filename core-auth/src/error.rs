use crate::types::CredentialKind;
use bridge_traits::BridgeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No credential found in redirect")]
    ExtractionEmpty,

    #[error("Exchange of {kind} credential failed: {source}")]
    ExchangeFailed {
        kind: CredentialKind,
        #[source]
        source: Box<AuthError>,
    },

    #[error("Authentication failed: {last_cause}")]
    AuthenticationFailed {
        #[source]
        last_cause: Box<AuthError>,
        /// Failures of candidates tried before the last one, in order
        earlier: Vec<AuthError>,
    },

    #[error("Failed to persist session: {0}")]
    StorageWriteFailed(String),

    #[error("{operation} timed out after {timeout:?}")]
    NetworkTimeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Identity provider returned {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Session expired")]
    SessionExpired,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid redirect: {0}")]
    InvalidRedirect(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Network(_) | AuthError::NetworkTimeout { .. } => true,
            AuthError::Provider { status, .. } => *status >= 500 || *status == 429,
            AuthError::ExchangeFailed { source, .. } => source.is_transient(),
            AuthError::AuthenticationFailed { last_cause, .. } => last_cause.is_transient(),
            _ => false,
        }
    }

    /// Whether the provider definitively rejected the presented credential.
    pub fn is_rejection(&self) -> bool {
        match self {
            AuthError::NotAuthenticated
            | AuthError::SessionExpired
            | AuthError::InvalidCredentials => true,
            AuthError::Provider { status, .. } => matches!(status, 401 | 403),
            AuthError::ExchangeFailed { source, .. } => source.is_rejection(),
            _ => false,
        }
    }

    /// Every failure behind this error, oldest first.
    ///
    /// For [`AuthError::AuthenticationFailed`] that is each candidate's
    /// failure; any other error yields itself.
    pub fn attempts(&self) -> Vec<&AuthError> {
        match self {
            AuthError::AuthenticationFailed {
                last_cause,
                earlier,
            } => earlier.iter().chain(std::iter::once(last_cause.as_ref())).collect(),
            other => vec![other],
        }
    }

    pub(crate) fn persist_failed(cause: AuthError) -> Self {
        AuthError::AuthenticationFailed {
            last_cause: Box::new(cause),
            earlier: Vec::new(),
        }
    }

    pub(crate) fn exchange(kind: CredentialKind, source: AuthError) -> Self {
        AuthError::ExchangeFailed {
            kind,
            source: Box::new(source),
        }
    }
}

impl From<BridgeError> for AuthError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::Timeout(timeout) => AuthError::NetworkTimeout {
                operation: "HTTP request".to_string(),
                timeout,
            },
            BridgeError::Storage(msg) => AuthError::Storage(msg),
            other => AuthError::Network(other.to_string()),
        }
    }
}

impl From<core_runtime::Error> for AuthError {
    fn from(error: core_runtime::Error) -> Self {
        AuthError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(error: serde_json::Error) -> Self {
        AuthError::Serialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
