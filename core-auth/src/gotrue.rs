//! GoTrue-compatible identity provider client with PKCE support.
//!
//! Implements [`IdentityProvider`] against the REST surface exposed under
//! `{provider_url}/auth/v1`:
//!
//! | operation              | endpoint                                  |
//! |------------------------|-------------------------------------------|
//! | `exchange_code`        | `POST /token?grant_type=pkce`             |
//! | `sign_in_with_password`| `POST /token?grant_type=password`         |
//! | `refresh_session`      | `POST /token?grant_type=refresh_token`    |
//! | `get_user`             | `GET /user`                               |
//! | `update_user`          | `PUT /user`                               |
//! | `sign_up`              | `POST /signup`                            |
//! | `sign_out`             | `POST /logout?scope=...`                  |
//! | `reset_password_...`   | `POST /recover`                           |
//!
//! # Security
//!
//! - The PKCE verifier is generated locally and only its S256 challenge
//!   leaves the device; the verifier is kept in the [`DurableStore`] until
//!   the code is exchanged.
//! - Tokens, codes, verifiers and passwords are never logged.
//!
//! # Example
//!
//! ```no_run
//! use core_auth::gotrue::GoTrueClient;
//! use core_runtime::config::AuthConfig;
//!
//! # async fn example(config: AuthConfig) -> core_auth::Result<()> {
//! let client = GoTrueClient::new(&config);
//! let url = client.authorize_url("github").await?;
//! // Open `url` in the browser; the redirect lands on the callback route.
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::listeners::{Listeners, Subscription};
use crate::provider::{IdentityProvider, ProviderEvent, ProviderListener};
use crate::store::SessionStore;
use crate::types::{
    AuthenticatedSession, Session, SignOutScope, SignUpOutcome, User, UserAttributes,
    UserMetadata,
};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
use bridge_traits::{Clock, DurableStore};
use core_runtime::config::AuthConfig;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use url::{form_urlencoded, Url};

const AUTH_API_PATH: &str = "/auth/v1";

/// PKCE (Proof Key for Code Exchange) verifier.
///
/// The verifier must be kept secret and never transmitted to the
/// authorization server. Only the challenge is sent when authorizing.
#[derive(Clone)]
pub struct PkceVerifier {
    verifier: String,
}

impl PkceVerifier {
    /// 32 random bytes, base64-url-encoded without padding (43 characters).
    pub fn new() -> Self {
        let mut verifier_bytes = [0u8; 32];
        rand::thread_rng().fill(&mut verifier_bytes);
        Self {
            verifier: URL_SAFE_NO_PAD.encode(verifier_bytes),
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// S256 method: BASE64URL(SHA256(code_verifier))
    pub fn challenge(&self) -> String {
        challenge_for(&self.verifier)
    }
}

impl Default for PkceVerifier {
    fn default() -> Self {
        Self::new()
    }
}

fn challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Token response from the `/token` endpoint.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    user: Option<User>,
}

fn default_expires_in() -> i64 {
    3600 // Default to 1 hour if not specified
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct JwtClaims {
    #[serde(default)]
    exp: Option<i64>,
}

/// HTTP client for a GoTrue-style identity service.
pub struct GoTrueClient {
    auth_url: String,
    api_key: String,
    redirect_url: Option<String>,
    http_client: Arc<dyn HttpClient>,
    durable_store: Arc<dyn DurableStore>,
    sessions: SessionStore,
    clock: Arc<dyn Clock>,
    verifier_key: String,
    retry_policy: RetryPolicy,
    current: RwLock<Option<Session>>,
    listeners: Listeners<ProviderEvent>,
}

impl GoTrueClient {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            auth_url: format!("{}{}", config.provider_url, AUTH_API_PATH),
            api_key: config.publishable_key.clone(),
            redirect_url: config.redirect_url.clone(),
            http_client: config.http_client.clone(),
            durable_store: config.durable_store.clone(),
            sessions: SessionStore::from_config(config),
            clock: config.clock.clone(),
            verifier_key: format!("{}.code_verifier", config.storage.prefix),
            retry_policy: RetryPolicy::default(),
            current: RwLock::new(None),
            listeners: Listeners::new(),
        }
    }

    /// Backoff used for token refresh.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Start a PKCE authorization round trip with an OAuth provider
    /// (`github`, `google`, ...).
    ///
    /// A fresh verifier is stored and the returned URL carries its challenge.
    #[instrument(skip(self))]
    pub async fn authorize_url(&self, oauth_provider: &str) -> Result<String> {
        let pkce = PkceVerifier::new();

        let mut url = Url::parse(&format!("{}/authorize", self.auth_url))
            .map_err(|e| AuthError::Config(format!("Invalid authorize URL: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("provider", oauth_provider);
            if let Some(redirect) = &self.redirect_url {
                query.append_pair("redirect_to", redirect);
            }
            query
                .append_pair("code_challenge", &pkce.challenge())
                .append_pair("code_challenge_method", "s256");
        }

        self.durable_store
            .set_item(&self.verifier_key, pkce.verifier())
            .await?;

        debug!("Built authorization URL");
        Ok(url.into())
    }

    fn request(&self, method: HttpMethod, path: &str) -> HttpRequest {
        HttpRequest::new(method, format!("{}{}", self.auth_url, path))
            .header("apikey", self.api_key.as_str())
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.http_client.execute(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(error_from_response(&response))
        }
    }

    async fn token_grant(
        &self,
        grant_type: &str,
        body: Value,
        fallback_refresh: Option<&str>,
    ) -> Result<AuthenticatedSession> {
        let request = self
            .request(HttpMethod::Post, &format!("/token?grant_type={}", grant_type))
            .json(&body)?;
        let response = self.send(request).await?;

        let token: TokenResponse = response
            .json()
            .map_err(|e| AuthError::Serialization(format!("Invalid token response: {}", e)))?;

        let refresh_token = token
            .refresh_token
            .or_else(|| fallback_refresh.map(str::to_string))
            .ok_or_else(|| AuthError::Serialization("Token response has no refresh_token".into()))?;

        let mut session = Session::new(
            token.access_token,
            refresh_token,
            token
                .expires_at
                .unwrap_or_else(|| self.clock.unix_timestamp() + token.expires_in),
        );
        session.token_type = token.token_type;

        let user = match token.user {
            Some(user) => user,
            None => self.get_user(&session.access_token).await?,
        };

        Ok(AuthenticatedSession { session, user })
    }

    async fn adopt(&self, authenticated: &AuthenticatedSession) {
        *self.current.write().await = Some(authenticated.session.clone());
    }

    /// The in-memory session, restored from durable storage on first use.
    async fn current_session(&self) -> Option<Session> {
        if let Some(session) = self.current.read().await.clone() {
            return Some(session);
        }

        let restored = match self.sessions.get().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Could not restore persisted session");
                None
            }
        };

        let mut current = self.current.write().await;
        if current.is_none() {
            *current = restored;
        }
        current.clone()
    }

    fn notify(&self, event: ProviderEvent) {
        debug!(event = event.name(), "Provider auth change");
        self.listeners.notify(&event);
    }
}

#[async_trait]
impl IdentityProvider for GoTrueClient {
    #[instrument(skip(self))]
    async fn get_session(&self) -> Result<Option<Session>> {
        let Some(session) = self.current_session().await else {
            return Ok(None);
        };

        if !session.is_expired(self.clock.as_ref()) {
            return Ok(Some(session));
        }

        debug!("Current session expired, refreshing");
        match self.refresh_session(&session.refresh_token).await {
            Ok(refreshed) => Ok(Some(refreshed.session)),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                debug!(error = %e, "Expired session could not be refreshed");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, access_token))]
    async fn get_user(&self, access_token: &str) -> Result<User> {
        let request = self
            .request(HttpMethod::Get, "/user")
            .bearer_token(access_token);
        let response = self.send(request).await?;

        response
            .json()
            .map_err(|e| AuthError::Serialization(format!("Invalid user response: {}", e)))
    }

    #[instrument(skip(self, code))]
    async fn exchange_code(&self, code: &str) -> Result<AuthenticatedSession> {
        let verifier = self
            .durable_store
            .get_item(&self.verifier_key)
            .await?
            .ok_or_else(|| {
                AuthError::InvalidRedirect("No PKCE verifier pending for this code".into())
            })?;

        let authenticated = self
            .token_grant(
                "pkce",
                json!({ "auth_code": code, "code_verifier": verifier }),
                None,
            )
            .await?;

        if let Err(e) = self.durable_store.remove_item(&self.verifier_key).await {
            warn!(error = %e, "Failed to discard used PKCE verifier");
        }

        self.adopt(&authenticated).await;
        info!("Authorization code exchanged");
        self.notify(ProviderEvent::SignedIn {
            user: authenticated.user.clone(),
            session: authenticated.session.clone(),
        });
        Ok(authenticated)
    }

    #[instrument(skip(self, access_token, refresh_token))]
    async fn set_session(&self, access_token: &str, refresh_token: &str) -> Result<Session> {
        let now = self.clock.unix_timestamp();

        match jwt_expiry(access_token) {
            Some(expires_at) if expires_at > now => {
                let user = self.get_user(access_token).await?;
                let session = Session::new(access_token, refresh_token, expires_at)
                    .with_token_type("bearer");
                *self.current.write().await = Some(session.clone());
                self.notify(ProviderEvent::SignedIn {
                    user,
                    session: session.clone(),
                });
                Ok(session)
            }
            _ => {
                debug!("Access token expired or opaque, refreshing");
                Ok(self.refresh_session(refresh_token).await?.session)
            }
        }
    }

    #[instrument(skip(self, refresh_token))]
    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthenticatedSession> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let result = self
                .token_grant(
                    "refresh_token",
                    json!({ "refresh_token": refresh_token }),
                    Some(refresh_token),
                )
                .await;

            match result {
                Ok(authenticated) => {
                    self.adopt(&authenticated).await;
                    info!(
                        expires_at = authenticated.session.expires_at,
                        "Session refreshed"
                    );
                    self.notify(ProviderEvent::TokenRefreshed {
                        session: authenticated.session.clone(),
                    });
                    return Ok(authenticated);
                }
                Err(e) if e.is_transient() && attempts < self.retry_policy.max_attempts => {
                    let delay = self.retry_policy.delay_for_attempt(attempts);
                    warn!(
                        error = %e,
                        attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Session refresh failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AuthError::Provider { status, message }) if status < 500 && status != 429 => {
                    warn!(status = status, "Refresh token rejected");
                    debug!(message = %message, "Provider refresh rejection");
                    *self.current.write().await = None;
                    self.notify(ProviderEvent::SignedOut);
                    return Err(AuthError::SessionExpired);
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[instrument(skip(self, email, password))]
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthenticatedSession> {
        let authenticated = self
            .token_grant(
                "password",
                json!({ "email": email, "password": password }),
                None,
            )
            .await
            .map_err(|e| match e {
                AuthError::Provider { status: 400, .. } => AuthError::InvalidCredentials,
                other => other,
            })?;

        self.adopt(&authenticated).await;
        self.notify(ProviderEvent::SignedIn {
            user: authenticated.user.clone(),
            session: authenticated.session.clone(),
        });
        Ok(authenticated)
    }

    #[instrument(skip(self, email, password, profile))]
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        profile: UserMetadata,
    ) -> Result<SignUpOutcome> {
        let path = match &self.redirect_url {
            Some(redirect) => format!("/signup?redirect_to={}", encode_component(redirect)),
            None => "/signup".to_string(),
        };
        let request = self
            .request(HttpMethod::Post, &path)
            .json(&json!({ "email": email, "password": password, "data": profile }))?;
        let body: Value = self
            .send(request)
            .await?
            .json()
            .map_err(|e| AuthError::Serialization(format!("Invalid sign-up response: {}", e)))?;

        if body.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(body)?;
            let refresh_token = token.refresh_token.unwrap_or_default();
            let session = Session::new(
                token.access_token,
                refresh_token,
                token
                    .expires_at
                    .unwrap_or_else(|| self.clock.unix_timestamp() + token.expires_in),
            );
            let user = match token.user {
                Some(user) => user,
                None => self.get_user(&session.access_token).await?,
            };
            *self.current.write().await = Some(session.clone());
            self.notify(ProviderEvent::SignedIn {
                user: user.clone(),
                session: session.clone(),
            });
            return Ok(SignUpOutcome {
                user,
                session: Some(session),
            });
        }

        info!("Sign-up pending email confirmation");
        Ok(SignUpOutcome {
            user: serde_json::from_value(body)?,
            session: None,
        })
    }

    #[instrument(skip(self))]
    async fn sign_out(&self, scope: SignOutScope) -> Result<()> {
        let session = self.current_session().await;
        *self.current.write().await = None;
        self.notify(ProviderEvent::SignedOut);

        let Some(session) = session else {
            debug!("No provider session to revoke");
            return Ok(());
        };

        let request = self
            .request(HttpMethod::Post, &format!("/logout?scope={}", scope.as_str()))
            .bearer_token(&session.access_token);

        match self.send(request).await {
            Ok(_) => Ok(()),
            // Session already revoked or expired server-side
            Err(AuthError::Provider {
                status: 401 | 403 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, email))]
    async fn reset_password_for_email(
        &self,
        email: &str,
        redirect_to: Option<String>,
    ) -> Result<()> {
        let path = match redirect_to.or_else(|| self.redirect_url.clone()) {
            Some(redirect) => format!("/recover?redirect_to={}", encode_component(&redirect)),
            None => "/recover".to_string(),
        };
        let request = self
            .request(HttpMethod::Post, &path)
            .json(&json!({ "email": email }))?;
        self.send(request).await?;
        Ok(())
    }

    #[instrument(skip(self, access_token, attributes))]
    async fn update_user(&self, access_token: &str, attributes: UserAttributes) -> Result<User> {
        let request = self
            .request(HttpMethod::Put, "/user")
            .bearer_token(access_token)
            .json(&attributes)?;
        let user: User = self
            .send(request)
            .await?
            .json()
            .map_err(|e| AuthError::Serialization(format!("Invalid user response: {}", e)))?;

        self.notify(ProviderEvent::UserUpdated { user: user.clone() });
        Ok(user)
    }

    async fn discard_session(&self) {
        if self.current.write().await.take().is_some() {
            debug!("Discarded unpersisted session");
        }
    }

    fn subscribe(&self, listener: ProviderListener) -> Subscription {
        self.listeners.subscribe(move |event| listener(event))
    }
}

fn error_from_response(response: &HttpResponse) -> AuthError {
    let body: ErrorBody = response.json().unwrap_or_default();
    let message = body
        .error_description
        .or(body.msg)
        .or(body.message)
        .or(body.error_code)
        .or(body.error)
        .unwrap_or_else(|| format!("HTTP {}", response.status));

    AuthError::Provider {
        status: response.status,
        message,
    }
}

/// `exp` claim of a JWT access token, if it is one.
fn jwt_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice::<JwtClaims>(&bytes).ok()?.exp
}

fn encode_component(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::{FixedClock, MemoryStore};
    use mockall::{mock, Sequence};
    use std::sync::Mutex;
    use std::time::Duration;

    mock! {
        HttpClient {}

        #[async_trait]
        impl HttpClient for HttpClient {
            async fn execute(&self, request: HttpRequest) -> bridge_traits::error::Result<HttpResponse>;
        }
    }

    const NOW: i64 = 1_700_000_000;

    fn client_with(http: MockHttpClient) -> (GoTrueClient, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = AuthConfig::builder()
            .provider_url("https://id.example.com")
            .publishable_key("anon-key")
            .redirect_url("https://app.example.com/auth/callback")
            .http_client(Arc::new(http))
            .durable_store(store.clone())
            .clock(Arc::new(FixedClock::at_unix(NOW)))
            .build()
            .unwrap();
        let client = GoTrueClient::new(&config).with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        });
        (client, store)
    }

    fn token_body(access: &str, refresh: &str) -> String {
        json!({
            "access_token": access,
            "refresh_token": refresh,
            "token_type": "bearer",
            "expires_in": 3600,
            "user": { "id": "user-1", "email": "ada@example.com" }
        })
        .to_string()
    }

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(json!({ "sub": "user-1", "exp": exp }).to_string());
        format!("{header}.{claims}.signature")
    }

    fn body_json(request: &HttpRequest) -> Value {
        serde_json::from_slice(request.body.as_ref().unwrap()).unwrap()
    }

    #[test]
    fn test_pkce_verifier_generation() {
        let pkce = PkceVerifier::new();
        assert_eq!(pkce.verifier().len(), 43);
        assert_ne!(pkce.verifier(), PkceVerifier::new().verifier());
    }

    #[test]
    fn test_pkce_challenge_computation() {
        // RFC 7636 appendix B
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_jwt_expiry() {
        assert_eq!(jwt_expiry(&jwt_with_exp(NOW + 60)), Some(NOW + 60));
        assert_eq!(jwt_expiry("opaque-token"), None);
        assert_eq!(jwt_expiry("a.!!!.c"), None);
    }

    #[tokio::test]
    async fn test_authorize_url_stores_verifier() {
        let (client, store) = client_with(MockHttpClient::new());

        let url = Url::parse(&client.authorize_url("github").await.unwrap()).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/auth/v1/authorize");
        assert_eq!(params["provider"], "github");
        assert_eq!(params["redirect_to"], "https://app.example.com/auth/callback");
        assert_eq!(params["code_challenge_method"], "s256");

        let verifier = store.get_item("auth.code_verifier").await.unwrap().unwrap();
        assert_eq!(params["code_challenge"], challenge_for(&verifier));
    }

    #[tokio::test]
    async fn test_exchange_code_consumes_verifier() {
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| {
                let body = body_json(req);
                req.url == "https://id.example.com/auth/v1/token?grant_type=pkce"
                    && req.headers.get("apikey").map(String::as_str) == Some("anon-key")
                    && body["auth_code"] == "code-123"
                    && body["code_verifier"] == "stored-verifier"
            })
            .times(1)
            .returning(|_| Ok(HttpResponse::new(200, token_body("acc", "ref"))));

        let (client, store) = client_with(http);
        store
            .set_item("auth.code_verifier", "stored-verifier")
            .await
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = client.subscribe(Box::new(move |e: &ProviderEvent| sink.lock().unwrap().push(e.name())));

        let result = client.exchange_code("code-123").await.unwrap();

        assert_eq!(result.user.id, "user-1");
        assert_eq!(result.session.expires_at, NOW + 3600);
        assert!(store.get_item("auth.code_verifier").await.unwrap().is_none());
        assert_eq!(*events.lock().unwrap(), vec!["SIGNED_IN"]);
        assert_eq!(
            client.get_session().await.unwrap().map(|s| s.access_token),
            Some("acc".to_string())
        );
    }

    #[tokio::test]
    async fn test_discarded_session_is_not_returned() {
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(200, token_body("acc", "ref"))));

        let (client, store) = client_with(http);
        store.set_item("auth.code_verifier", "v").await.unwrap();
        client.exchange_code("code-123").await.unwrap();

        client.discard_session().await;

        // Nothing was persisted, so there is nothing to restore either
        assert_eq!(client.get_session().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exchange_code_without_verifier() {
        let (client, _) = client_with(MockHttpClient::new());
        let err = client.exchange_code("code").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidRedirect(_)));
    }

    #[tokio::test]
    async fn test_set_session_with_live_jwt_only_fetches_user() {
        let token = jwt_with_exp(NOW + 600);
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| req.method == HttpMethod::Get && req.url.ends_with("/auth/v1/user"))
            .times(1)
            .returning(|_| Ok(HttpResponse::new(200, r#"{"id":"user-1"}"#)));

        let (client, _) = client_with(http);
        let session = client.set_session(&token, "ref").await.unwrap();

        assert_eq!(session.expires_at, NOW + 600);
        assert_eq!(session.refresh_token, "ref");
    }

    #[tokio::test]
    async fn test_set_session_with_opaque_token_refreshes() {
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| {
                req.url.ends_with("grant_type=refresh_token")
                    && body_json(req)["refresh_token"] == "ref"
            })
            .times(1)
            .returning(|_| Ok(HttpResponse::new(200, token_body("new-acc", "new-ref"))));

        let (client, _) = client_with(http);
        let session = client.set_session("opaque", "ref").await.unwrap();

        assert_eq!(session.access_token, "new-acc");
        assert_eq!(session.refresh_token, "new-ref");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_retries_transient_failures() {
        let mut http = MockHttpClient::new();
        let mut seq = Sequence::new();
        http.expect_execute()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::new(503, r#"{"msg":"unavailable"}"#)));
        http.expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::new(200, token_body("acc", "ref2"))));

        let (client, _) = client_with(http);
        let refreshed = client.refresh_session("ref").await.unwrap();

        assert_eq!(refreshed.session.refresh_token, "ref2");
    }

    #[tokio::test]
    async fn test_rejected_refresh_token_signs_out() {
        let mut http = MockHttpClient::new();
        http.expect_execute().times(1).returning(|_| {
            Ok(HttpResponse::new(
                400,
                r#"{"error":"invalid_grant","error_description":"Invalid Refresh Token"}"#,
            ))
        });

        let (client, _) = client_with(http);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = client.subscribe(Box::new(move |e: &ProviderEvent| sink.lock().unwrap().push(e.name())));

        let err = client.refresh_session("stale").await.unwrap_err();

        assert!(matches!(err, AuthError::SessionExpired));
        assert_eq!(*events.lock().unwrap(), vec!["SIGNED_OUT"]);
    }

    #[tokio::test]
    async fn test_password_rejection_maps_to_invalid_credentials() {
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| req.url.ends_with("grant_type=password"))
            .returning(|_| {
                Ok(HttpResponse::new(
                    400,
                    r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
                ))
            });

        let (client, _) = client_with(http);
        let err = client
            .sign_in_with_password("ada@example.com", "wrong")
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_sign_up_pending_confirmation() {
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| {
                req.url.contains("/auth/v1/signup?redirect_to=")
                    && body_json(req)["data"]["full_name"] == "Ada"
            })
            .returning(|_| {
                Ok(HttpResponse::new(
                    200,
                    r#"{"id":"user-9","email":"ada@example.com","confirmation_sent_at":"2024-01-01T00:00:00Z"}"#,
                ))
            });

        let (client, _) = client_with(http);
        let mut profile = UserMetadata::new();
        profile.insert("full_name".into(), json!("Ada"));

        let outcome = client
            .sign_up("ada@example.com", "s3cret!", profile)
            .await
            .unwrap();

        assert_eq!(outcome.user.id, "user-9");
        assert!(outcome.session.is_none());
    }

    #[tokio::test]
    async fn test_sign_out_revokes_restored_session() {
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| {
                req.url == "https://id.example.com/auth/v1/logout?scope=global"
                    && req.headers.get("Authorization").map(String::as_str)
                        == Some("Bearer persisted-acc")
            })
            .times(1)
            .returning(|_| Ok(HttpResponse::new(401, "")));

        let (client, store) = client_with(http);
        let persisted = Session::new("persisted-acc", "ref", NOW + 600);
        store
            .set_item("auth.session", &serde_json::to_string(&persisted).unwrap())
            .await
            .unwrap();

        client.sign_out(SignOutScope::Global).await.unwrap();
        assert!(client.current.read().await.is_none());
    }

    #[tokio::test]
    async fn test_sign_out_without_session_skips_network() {
        let (client, _) = client_with(MockHttpClient::new());
        client.sign_out(SignOutScope::Local).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_user_notifies() {
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|req| req.method == HttpMethod::Put && body_json(req)["email"] == "new@example.com")
            .returning(|_| Ok(HttpResponse::new(200, r#"{"id":"user-1","email":"new@example.com"}"#)));

        let (client, _) = client_with(http);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = client.subscribe(Box::new(move |e: &ProviderEvent| sink.lock().unwrap().push(e.name())));

        let user = client
            .update_user(
                "acc",
                UserAttributes {
                    email: Some("new@example.com".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(user.email.as_deref(), Some("new@example.com"));
        assert_eq!(*events.lock().unwrap(), vec!["USER_UPDATED"]);
    }

    #[test]
    fn test_error_message_preference() {
        let response = HttpResponse::new(422, r#"{"msg":"Password should be at least 6 characters"}"#);
        match error_from_response(&response) {
            AuthError::Provider { status, message } => {
                assert_eq!(status, 422);
                assert!(message.contains("6 characters"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let empty = HttpResponse::new(500, "");
        assert!(error_from_response(&empty).is_transient());
    }
}
