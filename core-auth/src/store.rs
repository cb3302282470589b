//! Durable session persistence.
//!
//! `SessionStore` is the only writer of authentication keys. Keys are
//! namespaced by the configured prefix (default `auth`):
//!
//! | key                  | value                         |
//! |----------------------|-------------------------------|
//! | `auth.session`       | JSON [`Session`]              |
//! | `auth.authenticated` | `"true"`                      |
//! | `auth.user_id`       | id of the session's user      |
//! | `auth.return_path`   | path to resume after sign-in  |
//!
//! A session write is a single [`WriteBatch`], so readers observe either the
//! previous session or the new one, never a mix. Legacy key names left by
//! earlier client versions are only removed by [`SessionStore::clear`].

use crate::error::{AuthError, Result};
use crate::types::Session;
use bridge_traits::{Clock, DurableStore, WriteBatch};
use core_runtime::config::AuthConfig;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Key family written by older provider SDKs: `sb-<project-ref>-auth-token`.
const PROVIDER_TOKEN_PREFIX: &str = "sb-";
const PROVIDER_TOKEN_SUFFIX: &str = "-auth-token";

#[derive(Debug, Clone)]
struct StorageKeys {
    session: String,
    authenticated: String,
    user_id: String,
    return_path: String,
}

impl StorageKeys {
    fn new(prefix: &str) -> Self {
        Self {
            session: format!("{prefix}.session"),
            authenticated: format!("{prefix}.authenticated"),
            user_id: format!("{prefix}.user_id"),
            return_path: format!("{prefix}.return_path"),
        }
    }
}

pub struct SessionStore {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    keys: StorageKeys,
    legacy_keys: Vec<String>,
}

impl SessionStore {
    pub fn new(
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        prefix: &str,
        legacy_keys: Vec<String>,
    ) -> Self {
        Self {
            store,
            clock,
            keys: StorageKeys::new(prefix),
            legacy_keys,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.durable_store.clone(),
            config.clock.clone(),
            &config.storage.prefix,
            config.storage.legacy_keys.clone(),
        )
    }

    /// Persist `session` for `user_id` in one atomic commit.
    ///
    /// # Errors
    ///
    /// [`AuthError::StorageWriteFailed`] if the commit is rejected; nothing
    /// is written in that case.
    #[instrument(skip(self, session, user_id))]
    pub async fn put(&self, session: &Session, user_id: &str) -> Result<()> {
        let blob = serde_json::to_string(session)?;

        let batch = WriteBatch::new()
            .set(&self.keys.session, blob)
            .set(&self.keys.authenticated, "true")
            .set(&self.keys.user_id, user_id);

        self.store
            .commit(batch)
            .await
            .map_err(|e| AuthError::StorageWriteFailed(e.to_string()))?;

        debug!(expires_at = session.expires_at, "Session persisted");
        Ok(())
    }

    /// The last persisted session, expired or not.
    ///
    /// A blob that no longer decodes is deleted and reported as `None`.
    pub async fn get(&self) -> Result<Option<Session>> {
        let Some(blob) = self.read(&self.keys.session).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Session>(&blob) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable persisted session");
                if let Err(e) = self.store.remove_item(&self.keys.session).await {
                    warn!(error = %e, "Failed to delete unreadable session");
                }
                Ok(None)
            }
        }
    }

    /// The persisted session only if it has not expired.
    pub async fn get_active(&self) -> Result<Option<Session>> {
        Ok(self
            .get()
            .await?
            .filter(|session| !session.is_expired(self.clock.as_ref())))
    }

    pub async fn user_id(&self) -> Result<Option<String>> {
        self.read(&self.keys.user_id).await
    }

    /// Remove canonical keys, the return path, and every legacy key.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        let mut batch = WriteBatch::new()
            .remove(&self.keys.session)
            .remove(&self.keys.authenticated)
            .remove(&self.keys.user_id)
            .remove(&self.keys.return_path);

        for key in &self.legacy_keys {
            batch = batch.remove(key);
        }

        match self.store.keys().await {
            Ok(keys) => {
                for key in keys.into_iter().filter(|k| is_provider_token_key(k)) {
                    batch = batch.remove(key);
                }
            }
            Err(e) => warn!(error = %e, "Could not enumerate keys for legacy cleanup"),
        }

        self.store
            .commit(batch)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?;

        debug!("Authentication storage cleared");
        Ok(())
    }

    /// Remember where to resume after sign-in.
    ///
    /// Returns `false` (and stores nothing) unless `path` is a same-origin
    /// relative path.
    pub async fn save_return_path(&self, path: &str) -> Result<bool> {
        if !is_safe_return_path(path) {
            debug!("Ignoring unsafe return path");
            return Ok(false);
        }
        self.store
            .set_item(&self.keys.return_path, path)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        Ok(true)
    }

    /// Read and delete the saved return path.
    pub async fn take_return_path(&self) -> Result<Option<String>> {
        let Some(path) = self.read(&self.keys.return_path).await? else {
            return Ok(None);
        };
        self.store
            .remove_item(&self.keys.return_path)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        Ok(Some(path).filter(|p| is_safe_return_path(p)))
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        self.store
            .get_item(key)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))
    }
}

/// `/dashboard?tab=1` is safe; `//evil.example`, `https://...` and `dashboard` are not.
pub fn is_safe_return_path(path: &str) -> bool {
    path.starts_with('/')
        && !path.starts_with("//")
        && !path.starts_with("/\\")
        && !path.chars().any(char::is_control)
}

fn is_provider_token_key(key: &str) -> bool {
    key.len() > PROVIDER_TOKEN_PREFIX.len() + PROVIDER_TOKEN_SUFFIX.len()
        && key.starts_with(PROVIDER_TOKEN_PREFIX)
        && key.ends_with(PROVIDER_TOKEN_SUFFIX)
}
