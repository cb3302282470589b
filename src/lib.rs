//! Auth convergence for client applications.
//!
//! Re-exports the workspace crates under one name and provides
//! [`bootstrap`], which wires logging, configuration and an [`AuthManager`]
//! in one call. The `desktop` feature (default) supplies reqwest and SQLite
//! bridges when none are injected.

use anyhow::Context;
use std::sync::Arc;

pub use bridge_traits;
pub use core_auth;
pub use core_runtime;

#[cfg(feature = "desktop")]
pub use bridge_desktop;

pub use core_auth::{
    AuthError, AuthGate, AuthManager, AuthState, AuthStatus, CallbackController, CallbackOutcome,
    GateDecision, GoTrueClient, IdentityProvider, Session, SessionStore, User,
};
pub use core_runtime::config::{AuthConfig, AuthConfigBuilder};
pub use core_runtime::events::{AuthEvent, CoreEvent, EventBus, RouteEvent};
pub use core_runtime::logging::LoggingConfig;

/// Build a GoTrue-backed [`AuthManager`] from `builder`.
///
/// Installs the global tracing subscriber when `logging` is given, and
/// mirrors provider events when called inside a tokio runtime.
pub fn bootstrap(
    builder: AuthConfigBuilder,
    logging: Option<LoggingConfig>,
    events: EventBus,
) -> anyhow::Result<Arc<AuthManager>> {
    if let Some(logging) = logging {
        core_runtime::logging::init_logging(logging).context("failed to initialise logging")?;
    }

    let config = builder.build().context("invalid auth configuration")?;
    tracing::info!(provider = %config.provider_url, "Auth configured");

    let manager = Arc::new(AuthManager::with_gotrue(&config, events));
    manager.mirror_provider_events();
    Ok(manager)
}
