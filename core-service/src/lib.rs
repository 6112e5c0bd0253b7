//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP, key-value
//! storage, storage change and lifecycle observers) into the auth core and
//! hands the host one started [`CoreService`]. Desktop apps typically enable
//! the `desktop-shims` feature (which depends on `bridge-desktop`) and call
//! [`bootstrap_desktop`].

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;

use core_auth::{AuthContext, AuthService};
use core_runtime::CoreConfig;
use tracing::info;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop::ChannelLifecycleObserver;
#[cfg(feature = "desktop-shims")]
use core_runtime::logging::{init_logging, LoggingConfig};
#[cfg(feature = "desktop-shims")]
use tracing::debug;

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    auth: Arc<AuthService>,
    context: AuthContext,
}

impl CoreService {
    /// Build the auth core from `config`, restore any persisted session and
    /// start listening for timer, storage and lifecycle signals.
    pub async fn start(config: CoreConfig) -> Result<Self> {
        info!(
            api_base_url = %config.api_base_url,
            namespace = %config.storage_namespace,
            "Starting core service"
        );
        let auth = AuthService::new(&config);
        auth.init().await?;
        let context = AuthContext::new(Arc::clone(&auth)).await;

        Ok(Self {
            inner: Arc::new(CoreInner { auth, context }),
        })
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.inner.auth
    }

    /// Observable session snapshot for UI layers.
    pub fn context(&self) -> &AuthContext {
        &self.inner.context
    }

    /// Stop background work. The persisted session survives for the next start.
    pub async fn shutdown(&self) {
        self.inner.auth.shutdown().await;
        info!("Core service stopped");
    }
}

/// Convenience bootstrapper for desktop hosts.
///
/// Uses the SQLite store in the platform data directory, the reqwest HTTP
/// client and a channel-driven lifecycle observer. The host forwards window
/// focus changes through the returned observer. Logging is installed with
/// the default [`LoggingConfig`] unless the host already installed a
/// subscriber.
///
/// ```no_run
/// # #[cfg(feature = "desktop-shims")]
/// # async fn example() -> core_service::Result<()> {
/// use bridge_traits::background::LifecycleState;
/// use core_service::bootstrap_desktop;
///
/// let (core, lifecycle) = bootstrap_desktop("https://gate.example.com/api").await?;
/// lifecycle.set_state(LifecycleState::Background);
/// core.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "desktop-shims")]
pub async fn bootstrap_desktop(
    api_base_url: &str,
) -> Result<(CoreService, Arc<ChannelLifecycleObserver>)> {
    if let Err(err) = init_logging(LoggingConfig::default()) {
        debug!(error = %err, "Keeping host-installed tracing subscriber");
    }

    let lifecycle = Arc::new(ChannelLifecycleObserver::default());
    let config = CoreConfig::builder()
        .api_base_url(api_base_url)
        .lifecycle_observer(lifecycle.clone())
        .build()
        .map_err(|err| CoreError::InitializationFailed(err.to_string()))?;
    let core = CoreService::start(config).await?;
    Ok((core, lifecycle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_desktop::{ChannelLifecycleObserver, MemoryKeyValueStore};
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
    use bridge_traits::storage::KeyValueStore;
    use core_auth::StorageKeys;

    struct OfflineHttp;

    #[async_trait]
    impl HttpClient for OfflineHttp {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            Err(BridgeError::NotAvailable("offline".to_string()))
        }
    }

    fn config(storage: &MemoryKeyValueStore) -> CoreConfig {
        CoreConfig::builder()
            .api_base_url("https://gate.example.com/api")
            .http_client(Arc::new(OfflineHttp))
            .storage(Arc::new(storage.clone()))
            .storage_observer(Arc::new(storage.clone()))
            .lifecycle_observer(Arc::new(ChannelLifecycleObserver::default()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_without_session() {
        let storage = MemoryKeyValueStore::new_origin();
        let core = CoreService::start(config(&storage)).await.unwrap();

        assert!(!core.context().is_authenticated());
        assert!(core.auth().current_user().await.is_none());
        core.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_restores_persisted_session() {
        let storage = MemoryKeyValueStore::new_origin();
        let keys = StorageKeys::new(core_runtime::config::DEFAULT_STORAGE_NAMESPACE);
        storage.set_string(&keys.access_token, "access").await.unwrap();
        storage
            .set_string(&keys.user, r#"{"id":5,"name":"Shift Lead"}"#)
            .await
            .unwrap();

        let core = CoreService::start(config(&storage)).await.unwrap();

        let snapshot = core.context().snapshot();
        assert!(snapshot.is_authenticated);
        assert_eq!(snapshot.user.and_then(|u| u.name).as_deref(), Some("Shift Lead"));

        core.shutdown().await;
        assert!(storage.has_key(&keys.access_token).await.unwrap());
    }

    #[test]
    fn test_auth_errors_convert() {
        let err: CoreError = core_auth::AuthError::NotAuthenticated.into();
        assert!(matches!(err, CoreError::Auth(_)));
        assert_eq!(err.to_string(), "Authentication error: Not authenticated");
    }
}
