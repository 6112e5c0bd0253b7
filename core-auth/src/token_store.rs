//! Session Token Storage
//!
//! Thin persistence layer over the host [`KeyValueStore`] holding the access
//! token, refresh token, cached user profile and session expiry.
//!
//! ## Behavior
//!
//! - Reads never fail. A storage error or malformed value is logged and
//!   reported as absent.
//! - Writes return an error so callers can decide whether it matters.
//! - [`TokenStore::store_session`] writes the access token last, so another
//!   tab watching that key only sees it once the rest of the session is in
//!   place.
//! - Token values are never logged; only fingerprints are.
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::{StorageKeys, TokenStore, UserProfile};
//! use bridge_traits::{KeyValueStore, SystemClock};
//! use std::sync::Arc;
//! # async fn example(store: Arc<dyn KeyValueStore>) -> core_auth::Result<()> {
//! let tokens = TokenStore::new(store, StorageKeys::new("smart_check"), Arc::new(SystemClock));
//!
//! tokens
//!     .store_session("access", Some("refresh"), &UserProfile::new(1))
//!     .await?;
//! assert!(tokens.is_authenticated().await);
//!
//! tokens.clear().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::types::{SessionSnapshot, UserProfile};
use bridge_traits::{storage::KeyValueStore, time::Clock};
use chrono::{DateTime, TimeZone, Utc};
use core_runtime::logging::token_fingerprint;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fully qualified storage keys for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub access_token: String,
    pub refresh_token: String,
    pub user: String,
    pub session_expiry: String,
    pub audit_log: String,
}

impl StorageKeys {
    pub fn new(namespace: &str) -> Self {
        let key = |name: &str| format!("{}:{}", namespace, name);
        Self {
            access_token: key("auth_token"),
            refresh_token: key("refresh_token"),
            user: key("auth_user"),
            session_expiry: key("session_expiry"),
            audit_log: key("auth_audit_log"),
        }
    }

    /// The four keys making up a session, in clearing order.
    pub fn session_keys(&self) -> [&str; 4] {
        [
            &self.access_token,
            &self.refresh_token,
            &self.user,
            &self.session_expiry,
        ]
    }

    /// Keys whose removal or appearance signals a login state change.
    pub fn is_session_marker(&self, key: &str) -> bool {
        key == self.access_token || key == self.user
    }
}

/// Persistence for the current session.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    clock: Arc<dyn Clock>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: StorageKeys, clock: Arc<dyn Clock>) -> Self {
        debug!(key = %keys.access_token, "Initializing TokenStore");
        Self { store, keys, clock }
    }

    pub fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.store.get_string(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read session value");
                None
            }
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.store
            .set_string(key, value)
            .await
            .map_err(AuthError::from_storage)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.store.delete(key).await.map_err(AuthError::from_storage)
    }

    pub async fn access_token(&self) -> Option<String> {
        self.read(&self.keys.access_token).await
    }

    pub async fn set_access_token(&self, token: &str) -> Result<()> {
        debug!(token = %token_fingerprint(token), "Storing access token");
        self.write(&self.keys.access_token, token).await
    }

    pub async fn clear_access_token(&self) -> Result<()> {
        self.remove(&self.keys.access_token).await
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.read(&self.keys.refresh_token).await
    }

    pub async fn set_refresh_token(&self, token: &str) -> Result<()> {
        self.write(&self.keys.refresh_token, token).await
    }

    pub async fn clear_refresh_token(&self) -> Result<()> {
        self.remove(&self.keys.refresh_token).await
    }

    /// Cached profile. Malformed JSON is treated as absent.
    pub async fn user(&self) -> Option<UserProfile> {
        let raw = self.read(&self.keys.user).await?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Discarding malformed cached user profile");
                None
            }
        }
    }

    pub async fn set_user(&self, user: &UserProfile) -> Result<()> {
        let raw = serde_json::to_string(user)
            .map_err(|e| AuthError::Validation(format!("Failed to serialize user: {}", e)))?;
        self.write(&self.keys.user, &raw).await
    }

    pub async fn clear_user(&self) -> Result<()> {
        self.remove(&self.keys.user).await
    }

    /// Session expiry, stored as epoch milliseconds.
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.read(&self.keys.session_expiry).await?;
        let parsed = raw
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());
        if parsed.is_none() {
            warn!(value = %raw, "Ignoring unparseable session expiry");
        }
        parsed
    }

    pub async fn set_expires_at(&self, expires_at: DateTime<Utc>) -> Result<()> {
        self.write(
            &self.keys.session_expiry,
            &expires_at.timestamp_millis().to_string(),
        )
        .await
    }

    pub async fn clear_expires_at(&self) -> Result<()> {
        self.remove(&self.keys.session_expiry).await
    }

    /// `true` iff an expiry exists and has passed.
    pub async fn is_expired(&self) -> bool {
        self.expires_at()
            .await
            .is_some_and(|at| self.clock.now() >= at)
    }

    /// Access token and user present, and not expired.
    pub async fn is_authenticated(&self) -> bool {
        self.session_snapshot()
            .await
            .is_authenticated(self.clock.now())
    }

    pub async fn session_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            access_token: self.access_token().await,
            refresh_token: self.refresh_token().await,
            user: self.user().await,
            expires_at: self.expires_at().await,
        }
    }

    /// Persist a new session: user, then refresh token, then the access token.
    ///
    /// A `None` refresh token removes any stale one. The expiry is owned by
    /// the session monitor and must be written before this call.
    pub async fn store_session(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        user: &UserProfile,
    ) -> Result<()> {
        self.set_user(user).await?;
        match refresh_token {
            Some(token) => self.set_refresh_token(token).await?,
            None => self.clear_refresh_token().await?,
        }
        self.set_access_token(access_token).await?;
        debug!(user_id = %user.id, "Session persisted");
        Ok(())
    }

    /// Replace tokens after a refresh. A `None` refresh token keeps the current one.
    pub async fn update_tokens(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
        if let Some(token) = refresh_token {
            self.set_refresh_token(token).await?;
        }
        self.set_access_token(access_token).await
    }

    /// Remove all four session values, access token first.
    ///
    /// Every key is attempted; the first failure is returned.
    pub async fn clear(&self) -> Result<()> {
        let mut first_error = None;
        for key in self.keys.session_keys() {
            if let Err(e) = self.remove(key).await {
                warn!(key = %key, error = %e, "Failed to clear session value");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Session cleared");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::MemoryKeyValueStore;
    use bridge_traits::{storage::StorageObserver, time::ManualClock};
    use chrono::Duration;
    use serde_json::json;

    fn store_with_clock() -> (TokenStore, MemoryKeyValueStore, ManualClock) {
        let kv = MemoryKeyValueStore::new_origin();
        let clock = ManualClock::default();
        let tokens = TokenStore::new(
            Arc::new(kv.clone()),
            StorageKeys::new("test"),
            Arc::new(clock.clone()),
        );
        (tokens, kv, clock)
    }

    #[test]
    fn test_keys_are_namespaced() {
        let keys = StorageKeys::new("smart_check");
        assert_eq!(keys.access_token, "smart_check:auth_token");
        assert_eq!(keys.user, "smart_check:auth_user");
        assert!(keys.is_session_marker("smart_check:auth_user"));
        assert!(!keys.is_session_marker("smart_check:session_expiry"));
    }

    #[tokio::test]
    async fn test_user_round_trip_and_clear() {
        let (tokens, _, _) = store_with_clock();
        let mut user = UserProfile::new("u-9")
            .with_email("ops@example.com")
            .with_role("operator")
            .with_permissions(["passes.write"]);
        user.extra.insert("gate".into(), json!({"id": 3, "open": true}));

        tokens.set_user(&user).await.unwrap();
        assert_eq!(tokens.user().await, Some(user));

        tokens.clear().await.unwrap();
        assert_eq!(tokens.user().await, None);
    }

    #[tokio::test]
    async fn test_malformed_user_reads_as_absent() {
        let (tokens, kv, _) = store_with_clock();
        kv.set_string("test:auth_user", "{not json").await.unwrap();
        assert_eq!(tokens.user().await, None);
    }

    #[tokio::test]
    async fn test_expiry_is_epoch_millis() {
        let (tokens, kv, clock) = store_with_clock();
        let at = clock.now() + Duration::seconds(600);
        tokens.set_expires_at(at).await.unwrap();

        let raw = kv.get_string("test:session_expiry").await.unwrap().unwrap();
        assert_eq!(raw, at.timestamp_millis().to_string());
        assert_eq!(
            tokens.expires_at().await.map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );

        kv.set_string("test:session_expiry", "soon").await.unwrap();
        assert_eq!(tokens.expires_at().await, None);
    }

    #[tokio::test]
    async fn test_is_authenticated_follows_clock() {
        let (tokens, _, clock) = store_with_clock();
        assert!(!tokens.is_authenticated().await);

        tokens
            .store_session("access", Some("refresh"), &UserProfile::new(1))
            .await
            .unwrap();
        assert!(tokens.is_authenticated().await);
        assert!(!tokens.is_expired().await);

        tokens
            .set_expires_at(clock.now() + Duration::seconds(60))
            .await
            .unwrap();
        clock.advance(std::time::Duration::from_secs(61));
        assert!(tokens.is_expired().await);
        assert!(!tokens.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_store_session_writes_access_token_last() {
        let origin = MemoryKeyValueStore::new_origin();
        let other_tab = origin.open_tab();
        let mut changes = other_tab.subscribe_changes().await.unwrap();

        let tokens = TokenStore::new(
            Arc::new(origin.clone()),
            StorageKeys::new("test"),
            Arc::new(ManualClock::default()),
        );
        tokens
            .store_session("access", Some("refresh"), &UserProfile::new(1))
            .await
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(changes.next().await.unwrap().key.unwrap());
        }
        assert_eq!(order, ["test:auth_user", "test:refresh_token", "test:auth_token"]);
    }

    #[tokio::test]
    async fn test_update_tokens_keeps_refresh_token_when_not_rotated() {
        let (tokens, _, _) = store_with_clock();
        tokens
            .store_session("a1", Some("r1"), &UserProfile::new(1))
            .await
            .unwrap();

        tokens.update_tokens("a2", None).await.unwrap();
        assert_eq!(tokens.access_token().await.as_deref(), Some("a2"));
        assert_eq!(tokens.refresh_token().await.as_deref(), Some("r1"));

        tokens.update_tokens("a3", Some("r2")).await.unwrap();
        assert_eq!(tokens.refresh_token().await.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_clear_removes_all_session_keys() {
        let (tokens, kv, clock) = store_with_clock();
        tokens
            .store_session("a", Some("r"), &UserProfile::new(1))
            .await
            .unwrap();
        tokens.set_expires_at(clock.now()).await.unwrap();
        kv.set_string("test:auth_audit_log", "[]").await.unwrap();

        tokens.clear().await.unwrap();

        assert!(tokens.session_snapshot().await.is_empty());
        // The audit log outlives the session.
        assert!(kv.has_key("test:auth_audit_log").await.unwrap());
    }
}
