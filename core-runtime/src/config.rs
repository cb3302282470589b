//! # Authentication Configuration
//!
//! Holds the provider endpoint, routing table, storage layout, timeouts and
//! injected host bridges the authentication core runs against.
//!
//! ## Overview
//!
//! An [`AuthConfig`] is assembled with [`AuthConfigBuilder`]. The builder fails
//! fast when a required bridge is missing instead of letting the first sign-in
//! blow up later.
//!
//! ## Required Dependencies
//!
//! - `HttpClient` - round trips to the identity provider
//! - `DurableStore` - session persistence across restarts
//!
//! `Clock` is optional and defaults to [`SystemClock`].
//!
//! When the `desktop-shims` feature is enabled, `ReqwestHttpClient` and a
//! SQLite-backed store at [`AuthConfigBuilder::database_path`] are injected
//! automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::AuthConfig;
//! use std::sync::Arc;
//!
//! let config = AuthConfig::builder()
//!     .provider_url("https://project.example.co")
//!     .publishable_key("anon-key")
//!     .public_routes(["/", "/login", "/signup"])
//!     .http_client(Arc::new(MyHttpClient))
//!     .durable_store(Arc::new(MyStore))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, DurableStore, HttpClient, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const ENV_PROVIDER_URL: &str = "AUTH_PROVIDER_URL";
pub const ENV_PUBLISHABLE_KEY: &str = "AUTH_PUBLISHABLE_KEY";
pub const ENV_REDIRECT_URL: &str = "AUTH_REDIRECT_URL";

/// Key names written by earlier client generations. `clear()` removes them.
pub const DEFAULT_LEGACY_KEYS: &[&str] = &[
    "sb-access-token",
    "sb-refresh-token",
    "supabase.auth.token",
    "isAuthenticated",
    "userId",
    "user_id",
    "authRedirectPath",
];

/// Route table consulted by the gate and the callback controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Where the identity provider sends the browser back to
    pub callback_route: String,
    /// Where unauthenticated visitors are sent
    pub login_route: String,
    /// Landing page after sign-in when no return path was saved
    pub default_destination: String,
    /// Routes that render without a session. Matched as path prefixes on
    /// segment boundaries; `/` only matches itself.
    pub public_routes: Vec<String>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            callback_route: "/auth/callback".to_string(),
            login_route: "/login".to_string(),
            default_destination: "/".to_string(),
            public_routes: vec![
                "/".to_string(),
                "/login".to_string(),
                "/signup".to_string(),
                "/reset-password".to_string(),
                "/auth/callback".to_string(),
            ],
        }
    }
}

impl RouteConfig {
    pub fn is_public(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        self.public_routes.iter().any(|route| {
            if route == "/" {
                return path == "/" || path.is_empty();
            }
            let route = route.trim_end_matches('/');
            path == route
                || path
                    .strip_prefix(route)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// Durable key layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Prefix for canonical keys (`{prefix}.session`, ...)
    pub prefix: String,
    pub legacy_keys: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            prefix: "auth".to_string(),
            legacy_keys: DEFAULT_LEGACY_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Upper bound on each credential exchange round trip
    pub exchange_timeout: Duration,
    /// Upper bound on the gate's remote session check
    pub remote_check_timeout: Duration,
    /// Sessions expiring within this window are refreshed proactively
    pub refresh_buffer: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(10),
            remote_check_timeout: Duration::from_secs(5),
            refresh_buffer: Duration::from_secs(60),
        }
    }
}

/// Configuration for the authentication core.
///
/// Use [`AuthConfig::builder`] to construct instances.
#[derive(Clone)]
pub struct AuthConfig {
    /// Base URL of the identity provider, without trailing slash
    pub provider_url: String,
    /// Publishable (anon) key sent as `apikey` on every request
    pub publishable_key: String,
    /// Absolute URL the provider redirects to after an OAuth round trip
    pub redirect_url: Option<String>,
    pub routes: RouteConfig,
    pub storage: StorageConfig,
    pub timeouts: TimeoutConfig,
    pub http_client: Arc<dyn HttpClient>,
    pub durable_store: Arc<dyn DurableStore>,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("provider_url", &self.provider_url)
            .field("publishable_key", &"[REDACTED]")
            .field("redirect_url", &self.redirect_url)
            .field("routes", &self.routes)
            .field("storage", &self.storage)
            .field("timeouts", &self.timeouts)
            .field("http_client", &"HttpClient { ... }")
            .field("durable_store", &"DurableStore { ... }")
            .field("clock", &"Clock { ... }")
            .finish()
    }
}

impl AuthConfig {
    pub fn builder() -> AuthConfigBuilder {
        AuthConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Provider URL parses as http(s)
    /// - Publishable key is not empty
    /// - Every route is an absolute path
    /// - Timeouts are non-zero
    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.provider_url)
            .map_err(|e| Error::Config(format!("Invalid provider URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(
                "Provider URL must use http or https".to_string(),
            ));
        }

        if self.publishable_key.trim().is_empty() {
            return Err(Error::Config(
                "Publishable key cannot be empty".to_string(),
            ));
        }

        if let Some(redirect) = &self.redirect_url {
            url::Url::parse(redirect)
                .map_err(|e| Error::Config(format!("Invalid redirect URL: {}", e)))?;
        }

        let routes = [
            &self.routes.callback_route,
            &self.routes.login_route,
            &self.routes.default_destination,
        ];
        for route in routes.into_iter().chain(self.routes.public_routes.iter()) {
            if !route.starts_with('/') || route.starts_with("//") {
                return Err(Error::Config(format!(
                    "Route '{}' must be an absolute path",
                    route
                )));
            }
        }

        if self.storage.prefix.is_empty() {
            return Err(Error::Config("Storage prefix cannot be empty".to_string()));
        }

        if self.timeouts.exchange_timeout.is_zero() || self.timeouts.remote_check_timeout.is_zero()
        {
            return Err(Error::Config("Timeouts must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required to reach the identity provider. \
                 Desktop: enable the 'desktop-shims' feature to use ReqwestHttpClient."
            .to_string(),
    }
}

fn durable_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "DurableStore".to_string(),
        message: "DurableStore implementation is required for session persistence. \
                 Desktop: enable the 'desktop-shims' feature and set database_path(). \
                 Other hosts: inject a store backed by the platform's local storage."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    let client = bridge_desktop::ReqwestHttpClient::new()
        .map_err(|e| Error::Internal(format!("Failed to build default HttpClient: {}", e)))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_durable_store(database_path: Option<PathBuf>) -> Result<Arc<dyn DurableStore>> {
    use bridge_desktop::SqliteDurableStore;
    use std::thread;
    use tokio::runtime::{Builder, Handle};

    let path = database_path.ok_or_else(durable_store_missing_error)?;

    let init_store = |path: PathBuf| -> Result<SqliteDurableStore> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                Error::Internal(format!(
                    "Failed to create Tokio runtime for default DurableStore: {}",
                    e
                ))
            })?;

        runtime
            .block_on(SqliteDurableStore::new(path))
            .map_err(|e| Error::Internal(format!("Failed to initialize default DurableStore: {}", e)))
    };

    // block_on panics inside a runtime, so hop to a plain thread there
    let store = match Handle::try_current() {
        Ok(_) => thread::spawn(move || init_store(path))
            .join()
            .map_err(|_| {
                Error::Internal(
                    "Worker thread panicked while creating default DurableStore".to_string(),
                )
            })??,
        Err(_) => init_store(path)?,
    };

    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_durable_store(_database_path: Option<PathBuf>) -> Result<Arc<dyn DurableStore>> {
    Err(durable_store_missing_error())
}

/// Builder for [`AuthConfig`].
#[derive(Default)]
pub struct AuthConfigBuilder {
    provider_url: Option<String>,
    publishable_key: Option<String>,
    redirect_url: Option<String>,
    routes: RouteConfig,
    storage: StorageConfig,
    timeouts: TimeoutConfig,
    database_path: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    durable_store: Option<Arc<dyn DurableStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AuthConfigBuilder {
    /// Seeds provider settings from `AUTH_PROVIDER_URL`, `AUTH_PUBLISHABLE_KEY`
    /// and `AUTH_REDIRECT_URL`. Unset variables leave the field empty so
    /// `build()` reports them.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            provider_url: non_empty(ENV_PROVIDER_URL),
            publishable_key: non_empty(ENV_PUBLISHABLE_KEY),
            redirect_url: non_empty(ENV_REDIRECT_URL),
            ..Self::default()
        }
    }

    pub fn provider_url(mut self, url: impl Into<String>) -> Self {
        self.provider_url = Some(url.into());
        self
    }

    pub fn publishable_key(mut self, key: impl Into<String>) -> Self {
        self.publishable_key = Some(key.into());
        self
    }

    pub fn redirect_url(mut self, url: impl Into<String>) -> Self {
        self.redirect_url = Some(url.into());
        self
    }

    /// Default: `/auth/callback`
    pub fn callback_route(mut self, route: impl Into<String>) -> Self {
        self.routes.callback_route = route.into();
        self
    }

    /// Default: `/login`
    pub fn login_route(mut self, route: impl Into<String>) -> Self {
        self.routes.login_route = route.into();
        self
    }

    /// Default: `/`
    pub fn default_destination(mut self, route: impl Into<String>) -> Self {
        self.routes.default_destination = route.into();
        self
    }

    /// Replaces the public route list.
    pub fn public_routes<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes.public_routes = routes.into_iter().map(Into::into).collect();
        self
    }

    /// Default: `auth`
    pub fn storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage.prefix = prefix.into();
        self
    }

    /// Replaces the legacy key list removed on sign-out.
    pub fn legacy_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.storage.legacy_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Default: 10 seconds
    pub fn exchange_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.exchange_timeout = timeout;
        self
    }

    /// Default: 5 seconds
    pub fn remote_check_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.remote_check_timeout = timeout;
        self
    }

    /// Default: 60 seconds
    pub fn refresh_buffer(mut self, buffer: Duration) -> Self {
        self.timeouts.refresh_buffer = buffer;
        self
    }

    /// Location of the SQLite file used by the desktop default store.
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the final `AuthConfig`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] when provider settings are missing or invalid
    /// - [`Error::CapabilityMissing`] when a required bridge was not injected
    ///   and no desktop default applies
    pub fn build(self) -> Result<AuthConfig> {
        let provider_url = self.provider_url.ok_or_else(|| {
            Error::Config(format!(
                "Provider URL is required. Use .provider_url() or set {}.",
                ENV_PROVIDER_URL
            ))
        })?;

        let publishable_key = self.publishable_key.ok_or_else(|| {
            Error::Config(format!(
                "Publishable key is required. Use .publishable_key() or set {}.",
                ENV_PUBLISHABLE_KEY
            ))
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let durable_store = match self.durable_store {
            Some(store) => store,
            None => provide_default_durable_store(self.database_path)?,
        };

        let config = AuthConfig {
            provider_url: provider_url.trim_end_matches('/').to_string(),
            publishable_key,
            redirect_url: self.redirect_url,
            routes: self.routes,
            storage: self.storage,
            timeouts: self.timeouts,
            http_client,
            durable_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::{BridgeError, HttpRequest, HttpResponse, MemoryStore};
    use std::collections::HashMap;

    struct NoopHttpClient;

    #[async_trait]
    impl HttpClient for NoopHttpClient {
        async fn execute(
            &self,
            _request: HttpRequest,
        ) -> std::result::Result<HttpResponse, BridgeError> {
            Ok(HttpResponse::new(200, "{}"))
        }
    }

    fn base_builder() -> AuthConfigBuilder {
        AuthConfig::builder()
            .provider_url("https://project.example.co/")
            .publishable_key("anon-key")
            .http_client(Arc::new(NoopHttpClient))
            .durable_store(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_build_with_defaults() {
        let config = base_builder().build().unwrap();

        assert_eq!(config.provider_url, "https://project.example.co");
        assert_eq!(config.routes.login_route, "/login");
        assert_eq!(config.routes.callback_route, "/auth/callback");
        assert_eq!(config.storage.prefix, "auth");
        assert_eq!(config.storage.legacy_keys.len(), DEFAULT_LEGACY_KEYS.len());
        assert_eq!(config.timeouts.exchange_timeout, Duration::from_secs(10));
        assert_eq!(config.timeouts.remote_check_timeout, Duration::from_secs(5));
        assert_eq!(config.timeouts.refresh_buffer, Duration::from_secs(60));
    }

    #[test]
    fn test_builder_requires_provider_url() {
        let result = AuthConfig::builder()
            .publishable_key("anon-key")
            .http_client(Arc::new(NoopHttpClient))
            .durable_store(Arc::new(MemoryStore::new()))
            .build();

        match result {
            Err(Error::Config(msg)) => assert!(msg.contains("Provider URL")),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_builder_requires_publishable_key() {
        let result = AuthConfig::builder()
            .provider_url("https://project.example.co")
            .http_client(Arc::new(NoopHttpClient))
            .durable_store(Arc::new(MemoryStore::new()))
            .build();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_bridges() {
        let result = AuthConfig::builder()
            .provider_url("https://project.example.co")
            .publishable_key("anon-key")
            .durable_store(Arc::new(MemoryStore::new()))
            .build();

        match result {
            Err(Error::CapabilityMissing { capability, .. }) => {
                assert_eq!(capability, "HttpClient")
            }
            other => panic!("expected missing capability, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_store_without_path_is_reported() {
        let result = AuthConfig::builder()
            .provider_url("https://project.example.co")
            .publishable_key("anon-key")
            .http_client(Arc::new(NoopHttpClient))
            .build();

        match result {
            Err(Error::CapabilityMissing { capability, .. }) => {
                assert_eq!(capability, "DurableStore")
            }
            other => panic!("expected missing capability, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_validate_rejects_bad_provider_url() {
        let result = base_builder().provider_url("ftp://nope").build();
        assert!(matches!(result, Err(Error::Config(_))));

        let result = base_builder().provider_url("not a url").build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_relative_routes() {
        let result = base_builder().login_route("login").build();
        assert!(matches!(result, Err(Error::Config(_))));

        let result = base_builder().public_routes(["//evil.example"]).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let result = base_builder().exchange_timeout(Duration::ZERO).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_lookup_reads_provider_settings() {
        let env: HashMap<&str, &str> = [
            (ENV_PROVIDER_URL, "https://env.example.co"),
            (ENV_PUBLISHABLE_KEY, "env-key"),
            (ENV_REDIRECT_URL, "  "),
        ]
        .into_iter()
        .collect();

        let builder = AuthConfigBuilder::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        let config = builder
            .http_client(Arc::new(NoopHttpClient))
            .durable_store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();

        assert_eq!(config.provider_url, "https://env.example.co");
        assert_eq!(config.publishable_key, "env-key");
        assert_eq!(config.redirect_url, None);
    }

    #[test]
    fn test_public_route_matching() {
        let routes = RouteConfig {
            public_routes: vec!["/".into(), "/login".into(), "/discover/".into()],
            ..RouteConfig::default()
        };

        assert!(routes.is_public("/"));
        assert!(routes.is_public("/login"));
        assert!(routes.is_public("/login?next=/x"));
        assert!(routes.is_public("/discover/artists"));
        assert!(!routes.is_public("/loginx"));
        assert!(!routes.is_public("/dashboard"));
    }

    #[test]
    fn test_debug_redacts_publishable_key() {
        let config = base_builder().publishable_key("very-secret").build().unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_desktop_defaults_open_sqlite_store() {
        let dir = std::env::temp_dir().join(format!("auth-config-{}", uuid::Uuid::new_v4()));
        let config = AuthConfig::builder()
            .provider_url("https://project.example.co")
            .publishable_key("anon-key")
            .database_path(dir.join("auth.db"))
            .build()
            .unwrap();

        assert_eq!(config.storage.prefix, "auth");
        let _ = std::fs::remove_dir_all(dir);
    }
}
