//! # Authentication Module
//!
//! Client-side auth convergence for a hosted identity provider.
//!
//! ## Overview
//!
//! A user can arrive signed in through several doors: an OAuth
//! authorization code, tokens in the URL fragment (magic links, older
//! flows), tokens in the query string, or a session the provider already
//! holds. This crate funnels all of them into one persisted session and one
//! shared authentication status, and guards routes against that status.
//!
//! ## Components
//!
//! - [`extractor`]: pull credential candidates out of a redirect locator
//! - [`SessionExchanger`]: trade a candidate for a verified session
//! - [`SessionStore`]: durable session record, sign-out cleanup, return path
//! - [`AuthState`]: shared status with stale-check protection
//! - [`AuthGate`]: per-route access decisions
//! - [`CallbackController`]: the redirect callback pipeline
//! - [`GoTrueClient`]: the [`IdentityProvider`] implementation
//! - [`AuthManager`]: facade tying them together
//!
//! ## Usage
//!
//! ```
//! use core_auth::extractor::extract_candidates;
//! use core_auth::CredentialKind;
//!
//! let candidates = extract_candidates("/auth/callback?code=abc#access_token=t&refresh_token=r");
//! let kinds: Vec<_> = candidates.iter().map(|c| c.kind()).collect();
//! assert_eq!(
//!     kinds,
//!     vec![CredentialKind::AuthorizationCode, CredentialKind::AccessTokenFragment]
//! );
//! ```

pub mod callback;
pub mod error;
pub mod exchanger;
pub mod extractor;
pub mod gate;
pub mod gotrue;
pub mod listeners;
pub mod manager;
pub mod provider;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use callback::{CallbackController, CallbackOutcome};
pub use error::{AuthError, Result};
pub use exchanger::SessionExchanger;
pub use extractor::{extract_candidates, provider_error, ProviderRedirectError};
pub use gate::{AuthGate, GateDecision};
pub use gotrue::{GoTrueClient, PkceVerifier};
pub use listeners::{Listeners, Subscription};
pub use manager::{AuthManager, SignInOutcome};
pub use provider::{IdentityProvider, ProviderEvent, ProviderListener};
pub use state::{AuthState, CheckTicket};
pub use store::{is_safe_return_path, SessionStore};
pub use types::{
    AuthStatus, AuthenticatedSession, CredentialCandidate, CredentialKind, Session, SignOutScope,
    SignUpOutcome, User, UserAttributes, UserMetadata,
};
