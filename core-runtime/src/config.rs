//! # Core Configuration Module
//!
//! Provides configuration management for the Smart Check session core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds all necessary dependencies and settings for the core
//! library. It enforces fail-fast validation so a misconfigured host finds out
//! at startup rather than on the first login.
//!
//! ## Required Dependencies
//!
//! - `api_base_url` - Root of the REST backend (`https://host/api`)
//! - `HttpClient` - HTTP operations (desktop default: reqwest)
//! - `KeyValueStore` - Durable session storage (desktop default: SQLite)
//!
//! ## Optional Dependencies
//!
//! - `StorageObserver` - Writes made by other tabs/processes (needed for
//!   cross-tab sync)
//! - `LifecycleObserver` - Visibility transitions (needed for revalidation
//!   on focus)
//! - `Clock` - Time source (default: system clock)
//! - `LoggerSink` - Host logging pipeline
//!
//! When the `desktop-shims` feature is enabled, desktop-ready defaults are
//! injected for anything not provided: `ReqwestHttpClient`, an SQLite store
//! wrapped in a `PollingStorageObserver`, and `DesktopLifecycleObserver`.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use bridge_desktop::{MemoryKeyValueStore, ReqwestHttpClient};
//! use std::sync::Arc;
//!
//! let storage = MemoryKeyValueStore::new_origin();
//! let config = CoreConfig::builder()
//!     .api_base_url("https://gate.example.com/api")
//!     .http_client(Arc::new(ReqwestHttpClient::new()))
//!     .storage(Arc::new(storage.clone()))
//!     .storage_observer(Arc::new(storage))
//!     .enable_visibility_revalidation(false)
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! The builder validates all required dependencies and provides actionable
//! error messages when capabilities are missing:
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! // Fails: no base URL
//! let err = CoreConfig::builder().build().unwrap_err();
//! assert!(err.to_string().contains("API base URL is required"));
//! ```

use crate::error::{Error, Result};
use bridge_traits::{
    Clock, HttpClient, KeyValueStore, LifecycleObserver, LoggerSink, StorageObserver, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default prefix for every persisted key.
pub const DEFAULT_STORAGE_NAMESPACE: &str = "smart_check";

/// Directory under the platform data dir used by the desktop defaults.
pub const DEFAULT_APP_DIR: &str = "smart-check";

/// Largest accepted audit log capacity.
pub const MAX_AUDIT_LOG_CAPACITY: usize = 1000;

/// Core configuration for the Smart Check session core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Root URL of the REST backend; endpoints are appended to it
    pub api_base_url: Url,

    /// Prefix for every persisted key (origin scoping)
    pub storage_namespace: String,

    /// HTTP client for API requests
    pub http_client: Arc<dyn HttpClient>,

    /// Durable session storage
    pub storage: Arc<dyn KeyValueStore>,

    /// External storage change signal (optional)
    pub storage_observer: Option<Arc<dyn StorageObserver>>,

    /// Visibility signal (optional)
    pub lifecycle_observer: Option<Arc<dyn LifecycleObserver>>,

    /// Time source used for expiry checks
    pub clock: Arc<dyn Clock>,

    /// Host logging pipeline (optional)
    pub logger_sink: Option<Arc<dyn LoggerSink>>,

    /// Session timing and bookkeeping settings
    pub session: SessionSettings,

    /// Feature flags
    pub features: FeatureFlags,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("api_base_url", &self.api_base_url.as_str())
            .field("storage_namespace", &self.storage_namespace)
            .field("http_client", &"HttpClient { ... }")
            .field("storage", &"KeyValueStore { ... }")
            .field(
                "storage_observer",
                &self
                    .storage_observer
                    .as_ref()
                    .map(|_| "StorageObserver { ... }"),
            )
            .field(
                "lifecycle_observer",
                &self
                    .lifecycle_observer
                    .as_ref()
                    .map(|_| "LifecycleObserver { ... }"),
            )
            .field(
                "logger_sink",
                &self.logger_sink.as_ref().map(|_| "LoggerSink { ... }"),
            )
            .field("session", &self.session)
            .field("features", &self.features)
            .finish()
    }
}

/// Session timing and bookkeeping settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// How long before expiry the silent refresh fires
    pub refresh_lead_time: Duration,

    /// Lower bound on the refresh delay, measured from scheduling time
    pub min_refresh_delay: Duration,

    /// Number of audit entries kept (oldest evicted first)
    pub audit_log_capacity: usize,

    /// Per-request timeout for API calls
    pub request_timeout: Duration,

    /// Interval for polling-based storage observers
    pub signal_poll_interval: Duration,

    /// After a rejected refresh, how long to wait for another tab to publish
    /// the tokens it rotated before ending the session. Zero disables the wait.
    pub rotation_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_lead_time: Duration::from_secs(300),
            min_refresh_delay: Duration::from_secs(60),
            audit_log_capacity: 50,
            request_timeout: Duration::from_secs(30),
            signal_poll_interval: Duration::from_secs(2),
            rotation_grace: Duration::from_secs(2),
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.audit_log_capacity == 0 || self.audit_log_capacity > MAX_AUDIT_LOG_CAPACITY {
            return Err(Error::Config(format!(
                "Audit log capacity must be between 1 and {} entries, got {}",
                MAX_AUDIT_LOG_CAPACITY, self.audit_log_capacity
            )));
        }

        if self.min_refresh_delay.is_zero() {
            return Err(Error::Config(
                "Minimum refresh delay must be greater than 0 seconds".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "Request timeout must be greater than 0 seconds".to_string(),
            ));
        }

        if self.signal_poll_interval.is_zero() {
            return Err(Error::Config(
                "Signal poll interval must be greater than 0 seconds".to_string(),
            ));
        }

        Ok(())
    }
}

/// Feature flags control optional functionality.
///
/// Each flag needs its matching bridge; validation fails otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Follow logins/logouts made in other tabs (requires StorageObserver)
    pub cross_tab_sync: bool,

    /// Re-validate the session when the app becomes visible again
    /// (requires LifecycleObserver)
    pub visibility_revalidation: bool,

    /// Ask the server to confirm a session adopted from another tab before
    /// announcing it
    pub revalidate_adopted_sessions: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            cross_tab_sync: true,
            visibility_revalidation: true,
            revalidate_adopted_sessions: false,
        }
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - The base URL is an absolute http(s) URL
    /// - The storage namespace is non-empty and has no `:`
    /// - Session settings are within range
    /// - Feature flags are consistent with available bridges
    pub fn validate(&self) -> Result<()> {
        validate_base_url(&self.api_base_url)?;

        if self.storage_namespace.trim().is_empty() {
            return Err(Error::Config(
                "Storage namespace cannot be empty".to_string(),
            ));
        }

        if self.storage_namespace.contains(':') {
            return Err(Error::Config(
                "Storage namespace cannot contain ':'".to_string(),
            ));
        }

        self.session.validate()?;

        if self.features.cross_tab_sync && self.storage_observer.is_none() {
            return Err(Error::Config(
                "Cross-tab sync enabled but no StorageObserver provided. \
                 Disable the feature or inject a StorageObserver implementation."
                    .to_string(),
            ));
        }

        if self.features.visibility_revalidation && self.lifecycle_observer.is_none() {
            return Err(Error::Config(
                "Visibility revalidation enabled but no LifecycleObserver provided. \
                 Disable the feature or inject a LifecycleObserver implementation."
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Absolute URL for an API path such as `/auth/login`.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Namespaced storage key, e.g. `smart_check:auth_token`.
    pub fn storage_key(&self, name: &str) -> String {
        format!("{}:{}", self.storage_namespace, name)
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::Config(format!("Invalid API base URL '{}': {}", raw, e)))?;
    validate_base_url(&url)?;
    Ok(url)
}

fn validate_base_url(url: &Url) -> Result<()> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!(
            "API base URL must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(Error::Config(format!(
            "API base URL '{}' must be absolute",
            url
        )));
    }

    Ok(())
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required to reach the auth API. \
                 Desktop: enable the 'desktop-shims' feature to use the default ReqwestHttpClient. \
                 Other hosts: inject a native HTTP adapter."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn storage_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "KeyValueStore".to_string(),
        message: "KeyValueStore implementation is required for session persistence. \
                 Desktop: enable the 'desktop-shims' feature to use the default SqliteKeyValueStore. \
                 Web: inject a localStorage-backed store."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::with_timeout(timeout).map_err(|e| {
        Error::BridgeInit(format!("Failed to initialize default HttpClient: {}", e))
    })?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

/// Default storage plus the observer that watches it.
///
/// The SQLite store is shared by every process of the same profile, so it is
/// wrapped in a polling observer that reports the other processes' writes.
#[cfg(feature = "desktop-shims")]
fn provide_default_storage(
    storage_path: Option<PathBuf>,
    namespace: &str,
    poll_interval: Duration,
) -> Result<(Arc<dyn KeyValueStore>, Arc<dyn StorageObserver>)> {
    use bridge_desktop::{PollingStorageObserver, SqliteKeyValueStore};

    let path = match storage_path {
        Some(path) => path,
        None => SqliteKeyValueStore::default_path(DEFAULT_APP_DIR).map_err(|e| {
            Error::BridgeInit(format!("Failed to resolve default storage path: {}", e))
        })?,
    };

    let sqlite = SqliteKeyValueStore::open_lazy(path).map_err(|e| {
        Error::BridgeInit(format!("Failed to initialize default KeyValueStore: {}", e))
    })?;

    let observed = Arc::new(PollingStorageObserver::with_prefix(
        Arc::new(sqlite),
        format!("{}:", namespace),
        poll_interval,
    ));
    let storage: Arc<dyn KeyValueStore> = observed.clone();
    let observer: Arc<dyn StorageObserver> = observed;
    Ok((storage, observer))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_storage(
    _storage_path: Option<PathBuf>,
    _namespace: &str,
    _poll_interval: Duration,
) -> Result<(Arc<dyn KeyValueStore>, Arc<dyn StorageObserver>)> {
    Err(storage_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_lifecycle_observer() -> Option<Arc<dyn LifecycleObserver>> {
    Some(Arc::new(bridge_desktop::DesktopLifecycleObserver::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_lifecycle_observer() -> Option<Arc<dyn LifecycleObserver>> {
    None
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Use this builder to incrementally set configuration options and then
/// call [`build()`](CoreConfigBuilder::build) to create the final config.
#[derive(Default)]
pub struct CoreConfigBuilder {
    api_base_url: Option<String>,
    storage_namespace: Option<String>,
    storage_path: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    storage: Option<Arc<dyn KeyValueStore>>,
    storage_observer: Option<Arc<dyn StorageObserver>>,
    lifecycle_observer: Option<Arc<dyn LifecycleObserver>>,
    clock: Option<Arc<dyn Clock>>,
    logger_sink: Option<Arc<dyn LoggerSink>>,
    session: SessionSettings,
    features: FeatureFlags,
}

impl CoreConfigBuilder {
    /// Sets the REST backend root, e.g. `https://gate.example.com/api`.
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Sets the prefix for every persisted key (default `smart_check`).
    pub fn storage_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.storage_namespace = Some(namespace.into());
        self
    }

    /// Sets the SQLite file used by the desktop default store.
    ///
    /// Ignored when a store is injected with [`storage`](Self::storage).
    pub fn storage_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn storage(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(store);
        self
    }

    pub fn storage_observer(mut self, observer: Arc<dyn StorageObserver>) -> Self {
        self.storage_observer = Some(observer);
        self
    }

    pub fn lifecycle_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.lifecycle_observer = Some(observer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    pub fn session_settings(mut self, settings: SessionSettings) -> Self {
        self.session = settings;
        self
    }

    pub fn refresh_lead_time(mut self, lead: Duration) -> Self {
        self.session.refresh_lead_time = lead;
        self
    }

    pub fn min_refresh_delay(mut self, delay: Duration) -> Self {
        self.session.min_refresh_delay = delay;
        self
    }

    pub fn audit_log_capacity(mut self, capacity: usize) -> Self {
        self.session.audit_log_capacity = capacity;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.session.request_timeout = timeout;
        self
    }

    pub fn signal_poll_interval(mut self, interval: Duration) -> Self {
        self.session.signal_poll_interval = interval;
        self
    }

    pub fn rotation_grace(mut self, grace: Duration) -> Self {
        self.session.rotation_grace = grace;
        self
    }

    pub fn enable_cross_tab_sync(mut self, enabled: bool) -> Self {
        self.features.cross_tab_sync = enabled;
        self
    }

    pub fn enable_visibility_revalidation(mut self, enabled: bool) -> Self {
        self.features.visibility_revalidation = enabled;
        self
    }

    pub fn revalidate_adopted_sessions(mut self, enabled: bool) -> Self {
        self.features.revalidate_adopted_sessions = enabled;
        self
    }

    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Builds the final configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the base URL is missing or invalid, or the
    ///   settings/feature flags are inconsistent
    /// - [`Error::CapabilityMissing`] if a required bridge is absent and no
    ///   platform default is available
    pub fn build(self) -> Result<CoreConfig> {
        let raw_url = self.api_base_url.ok_or_else(|| {
            Error::Config(
                "API base URL is required. Use .api_base_url() to set it.".to_string(),
            )
        })?;
        let api_base_url = parse_base_url(&raw_url)?;

        let storage_namespace = self
            .storage_namespace
            .unwrap_or_else(|| DEFAULT_STORAGE_NAMESPACE.to_string());

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client(self.session.request_timeout)?,
        };

        let (storage, storage_observer) = match self.storage {
            Some(store) => (store, self.storage_observer),
            None => {
                let (store, observer) = provide_default_storage(
                    self.storage_path,
                    &storage_namespace,
                    self.session.signal_poll_interval,
                )?;
                (store, self.storage_observer.or(Some(observer)))
            }
        };

        let lifecycle_observer = self
            .lifecycle_observer
            .or_else(provide_default_lifecycle_observer);

        let config = CoreConfig {
            api_base_url,
            storage_namespace,
            http_client,
            storage,
            storage_observer,
            lifecycle_observer,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            logger_sink: self.logger_sink,
            session: self.session,
            features: self.features,
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_desktop::{ChannelLifecycleObserver, MemoryKeyValueStore};
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::http::{HttpRequest, HttpResponse};
    use bridge_traits::BridgeError;

    struct MockHttpClient;

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            Err(BridgeError::NotAvailable("offline".to_string()))
        }
    }

    fn complete_builder() -> CoreConfigBuilder {
        let storage = MemoryKeyValueStore::new_origin();
        CoreConfig::builder()
            .api_base_url("https://gate.example.com/api")
            .http_client(Arc::new(MockHttpClient))
            .storage(Arc::new(storage.clone()))
            .storage_observer(Arc::new(storage))
            .lifecycle_observer(Arc::new(ChannelLifecycleObserver::default()))
    }

    #[test]
    fn test_builder_with_all_required_fields() {
        let config = complete_builder().build().expect("complete config");

        assert_eq!(config.api_base_url.as_str(), "https://gate.example.com/api");
        assert_eq!(config.storage_namespace, DEFAULT_STORAGE_NAMESPACE);
        assert_eq!(config.session, SessionSettings::default());
        assert_eq!(config.features, FeatureFlags::default());
        assert!(config.storage_observer.is_some());
    }

    #[test]
    fn test_session_defaults() {
        let settings = SessionSettings::default();
        assert_eq!(settings.refresh_lead_time, Duration::from_secs(300));
        assert_eq!(settings.min_refresh_delay, Duration::from_secs(60));
        assert_eq!(settings.audit_log_capacity, 50);
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.rotation_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_builder_requires_base_url() {
        let err = CoreConfig::builder()
            .http_client(Arc::new(MockHttpClient))
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("API base URL is required"));
    }

    #[test]
    fn test_builder_rejects_invalid_base_urls() {
        for url in ["not a url", "ftp://gate.example.com", "mailto:ops@example.com"] {
            let result = complete_builder().api_base_url(url).build();
            assert!(
                matches!(result, Err(Error::Config(_))),
                "{} should be rejected",
                url
            );
        }
    }

    #[test]
    fn test_endpoint_joins_paths() {
        let config = complete_builder()
            .api_base_url("https://gate.example.com/api/")
            .build()
            .unwrap();

        assert_eq!(
            config.endpoint("/auth/login"),
            "https://gate.example.com/api/auth/login"
        );
        assert_eq!(
            config.endpoint("auth/2fa/verify"),
            "https://gate.example.com/api/auth/2fa/verify"
        );
    }

    #[test]
    fn test_storage_key_is_namespaced() {
        let config = complete_builder().storage_namespace("tenant_a").build().unwrap();
        assert_eq!(config.storage_key("auth_token"), "tenant_a:auth_token");
    }

    #[test]
    fn test_builder_rejects_bad_namespace() {
        assert!(complete_builder().storage_namespace("").build().is_err());
        assert!(complete_builder().storage_namespace("a:b").build().is_err());
    }

    #[test]
    fn test_audit_capacity_bounds() {
        assert!(complete_builder().audit_log_capacity(0).build().is_err());
        assert!(complete_builder()
            .audit_log_capacity(MAX_AUDIT_LOG_CAPACITY + 1)
            .build()
            .is_err());
        assert!(complete_builder().audit_log_capacity(1).build().is_ok());
        assert!(complete_builder()
            .audit_log_capacity(MAX_AUDIT_LOG_CAPACITY)
            .build()
            .is_ok());
    }

    #[test]
    fn test_zero_min_refresh_delay_rejected() {
        let err = complete_builder()
            .min_refresh_delay(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Minimum refresh delay"));
    }

    #[test]
    fn test_cross_tab_sync_requires_observer() {
        let storage = MemoryKeyValueStore::new_origin();
        let result = CoreConfig::builder()
            .api_base_url("https://gate.example.com")
            .http_client(Arc::new(MockHttpClient))
            .storage(Arc::new(storage))
            .lifecycle_observer(Arc::new(ChannelLifecycleObserver::default()))
            .build();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("StorageObserver"));
    }

    #[test]
    fn test_features_can_be_disabled_without_observers() {
        let storage = MemoryKeyValueStore::new_origin();
        let config = CoreConfig::builder()
            .api_base_url("https://gate.example.com")
            .http_client(Arc::new(MockHttpClient))
            .storage(Arc::new(storage))
            .enable_cross_tab_sync(false)
            .enable_visibility_revalidation(false)
            .build();

        assert!(config.is_ok());
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_http_client() {
        let storage = MemoryKeyValueStore::new_origin();
        let result = CoreConfig::builder()
            .api_base_url("https://gate.example.com")
            .storage(Arc::new(storage))
            .build();

        match result {
            Err(Error::CapabilityMissing { capability, .. }) => {
                assert_eq!(capability, "HttpClient")
            }
            other => panic!("expected CapabilityMissing, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_storage() {
        let result = CoreConfig::builder()
            .api_base_url("https://gate.example.com")
            .http_client(Arc::new(MockHttpClient))
            .build();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("KeyValueStore"));
        assert!(err.to_string().contains("session persistence"));
    }

    #[cfg(feature = "desktop-shims")]
    #[tokio::test]
    async fn test_build_with_desktop_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let config = CoreConfig::builder()
            .api_base_url("https://gate.example.com")
            .storage_path(dir.path().join("session.db"))
            .build()
            .expect("desktop defaults should succeed");

        assert!(config.storage_observer.is_some());
        assert!(config.lifecycle_observer.is_some());

        let key = config.storage_key("probe");
        config.storage.set_string(&key, "ok").await.unwrap();
        assert_eq!(
            config.storage.get_string(&key).await.unwrap().as_deref(),
            Some("ok")
        );
    }

    #[test]
    fn test_debug_hides_bridges() {
        let config = complete_builder().build().unwrap();
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("gate.example.com"));
        assert!(rendered.contains("HttpClient { ... }"));
    }
}
