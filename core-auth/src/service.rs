//! # Auth Service
//!
//! Coordinates the token store, session monitor, audit log and event bus
//! behind one explicitly constructed service.
//!
//! ## Overview
//!
//! Every state-changing operation follows the same path:
//!
//! 1. call the API (never while holding a lock other than the refresh lock)
//! 2. persist the outcome in the [`TokenStore`] and reschedule the
//!    [`SessionMonitor`]
//! 3. append an audit entry and publish an [`AuthEvent`]
//!
//! Storage is always updated before the event goes out, so listeners that
//! read the store from their callback see the new state.
//!
//! ## Concurrency
//!
//! - A monotonic session epoch moves on every commit or teardown. Network
//!   operations remember the epoch they started under and discard their
//!   result if it moved while they were waiting.
//! - [`AuthService::refresh_token`] is single-flight. A caller that waited on
//!   another refresh returns without a second exchange.
//! - A failed refresh only ends the session it was refreshing. Tabs sharing
//!   one storage origin refresh independently; a tab that loses the exchange
//!   to another tab's rotation follows the stored tokens instead.
//! - Commits and teardowns are serialised so storage never interleaves two
//!   sessions.
//!
//! ## Signals
//!
//! [`AuthService::init`] spawns a loop that consumes:
//!
//! - session timer firings (silent refresh, expiry)
//! - storage changes made by other tabs (login adoption, `OTHER_TAB` logout)
//! - lifecycle changes (revalidation when the app is visible again)
//!
//! The loop only holds a weak reference; dropping the last handle to the
//! service stops it.
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::{AuthService, LoginCredentials, LogoutReason};
//! use core_runtime::CoreConfig;
//! # async fn example(config: CoreConfig) -> core_auth::Result<()> {
//! let service = AuthService::new(&config);
//! service.init().await?;
//!
//! let _subscription = service.subscribe(|event| println!("{}", event.name()));
//!
//! let user = service
//!     .login(LoginCredentials::new("guard@example.com", "secret"))
//!     .await?;
//! assert!(service.is_authenticated().await);
//!
//! service.logout(LogoutReason::UserInitiated).await;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::api::AuthApi;
use crate::audit_log::{AuditEntry, AuditLog};
use crate::error::{AuthError, Result};
use crate::events::{AuthEvent, EventBus, LogoutReason, Subscription};
use crate::session_monitor::{SessionMonitor, TimerFired, TimerKind};
use crate::token_store::{StorageKeys, TokenStore};
use crate::types::{
    AuthState, LoginCredentials, LoginResponse, PasswordChange, PasswordReset, ProfileUpdate,
    RefreshResponse, RegistrationRequest, SessionSnapshot, TwoFactorVerification, UserProfile,
    ValidationResult,
};
use bridge_traits::{
    background::{LifecycleChangeStream, LifecycleObserver, LifecycleState},
    http::{HttpRequest, HttpResponse},
    storage::{StorageChange, StorageChangeStream, StorageObserver},
    time::Clock,
};
use chrono::{DateTime, Utc};
use core_runtime::{logging::token_fingerprint, CoreConfig, FeatureFlags};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Client-side authentication and session lifecycle.
pub struct AuthService {
    api: AuthApi,
    token_store: TokenStore,
    monitor: SessionMonitor,
    audit: AuditLog,
    events: EventBus,
    clock: Arc<dyn Clock>,
    storage_observer: Option<Arc<dyn StorageObserver>>,
    lifecycle_observer: Option<Arc<dyn LifecycleObserver>>,
    features: FeatureFlags,
    rotation_grace: Duration,
    state: RwLock<AuthState>,
    epoch: AtomicU64,
    refresh_lock: AsyncMutex<()>,
    commit_lock: AsyncMutex<()>,
    timer_rx: Mutex<Option<mpsc::UnboundedReceiver<TimerFired>>>,
    shutdown: CancellationToken,
    signal_task: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl AuthService {
    /// Build a service from validated configuration.
    ///
    /// Nothing is read or spawned until [`init`](Self::init).
    pub fn new(config: &CoreConfig) -> Arc<Self> {
        Self::with_event_bus(config, EventBus::default())
    }

    /// Build a service publishing to an existing bus.
    pub fn with_event_bus(config: &CoreConfig, events: EventBus) -> Arc<Self> {
        let keys = StorageKeys::new(&config.storage_namespace);
        let token_store = TokenStore::new(
            Arc::clone(&config.storage),
            keys.clone(),
            Arc::clone(&config.clock),
        );
        let (monitor, timer_rx) =
            SessionMonitor::new(token_store.clone(), Arc::clone(&config.clock), &config.session);
        let audit = AuditLog::new(
            Arc::clone(&config.storage),
            keys.audit_log,
            config.session.audit_log_capacity,
            Arc::clone(&config.clock),
        );
        let api = AuthApi::new(
            Arc::clone(&config.http_client),
            config.api_base_url.clone(),
            config.session.request_timeout,
        );

        Arc::new(Self {
            api,
            token_store,
            monitor,
            audit,
            events,
            clock: Arc::clone(&config.clock),
            storage_observer: config.storage_observer.clone(),
            lifecycle_observer: config.lifecycle_observer.clone(),
            features: config.features,
            rotation_grace: config.session.rotation_grace,
            state: RwLock::new(AuthState::Anonymous),
            epoch: AtomicU64::new(0),
            refresh_lock: AsyncMutex::new(()),
            commit_lock: AsyncMutex::new(()),
            timer_rx: Mutex::new(Some(timer_rx)),
            shutdown: CancellationToken::new(),
            signal_task: Mutex::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    /// Restore any persisted session and start listening for signals.
    ///
    /// This method:
    /// 1. Subscribes to the storage and lifecycle observers enabled in the
    ///    feature flags
    /// 2. Restores a persisted session, re-arming its timers from the time
    ///    remaining, or ends an already expired one with `SESSION_EXPIRED`
    /// 3. Spawns the signal loop
    ///
    /// Calling it again is a no-op. A signal source that cannot be
    /// subscribed to is logged and skipped.
    #[instrument(skip(self))]
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("AuthService already initialized");
            return Ok(());
        }
        info!("Initializing AuthService");

        let storage = self.subscribe_storage().await;
        let lifecycle = self.subscribe_lifecycle().await;

        self.restore_session().await;

        let timers = self
            .timer_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let handle = tokio::spawn(run_signal_loop(
            Arc::downgrade(self),
            timers,
            storage,
            lifecycle,
            self.shutdown.clone(),
        ));
        *self.signal_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!(state = %self.state(), "AuthService initialized");
        Ok(())
    }

    /// Stop the signal loop and cancel timers. The persisted session is kept.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.monitor.cancel_timers();
        let handle = self
            .signal_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Signal loop ended abnormally");
            }
        }
        info!("AuthService shut down");
    }

    async fn subscribe_storage(&self) -> Option<Box<dyn StorageChangeStream>> {
        if !self.features.cross_tab_sync {
            return None;
        }
        let observer = self.storage_observer.as_ref()?;
        match observer.subscribe_changes().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Storage observer unavailable, cross-tab sync disabled");
                None
            }
        }
    }

    async fn subscribe_lifecycle(&self) -> Option<Box<dyn LifecycleChangeStream>> {
        if !self.features.visibility_revalidation {
            return None;
        }
        let observer = self.lifecycle_observer.as_ref()?;
        match observer.subscribe_changes().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Lifecycle observer unavailable, visibility revalidation disabled");
                None
            }
        }
    }

    async fn restore_session(&self) {
        let snapshot = self.token_store.session_snapshot().await;
        if snapshot.access_token.is_none() {
            debug!("No persisted session");
            return;
        }

        if snapshot.is_expired(self.clock.now()) {
            info!("Persisted session has expired");
            self.logout(LogoutReason::SessionExpired).await;
            return;
        }

        let Some(user) = snapshot.user else {
            warn!("Persisted access token has no cached user, ignoring it");
            return;
        };

        let _guard = self.commit_lock.lock().await;
        self.bump_epoch();
        if let Some(expires_at) = snapshot.expires_at {
            self.monitor.resume(expires_at);
        }
        self.set_state(AuthState::Authenticated);
        info!(user_id = %user.id, "Restored persisted session");
    }

    // ------------------------------------------------------------------
    // Session state
    // ------------------------------------------------------------------

    pub fn state(&self) -> AuthState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: AuthState) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(from = %*state, to = %next, "Auth state transition");
            *state = next;
        }
    }

    /// Derive the state from storage after an operation did not commit.
    async fn settle_state(&self) {
        let next = if self.token_store.is_authenticated().await {
            AuthState::Authenticated
        } else {
            AuthState::Anonymous
        };
        self.set_state(next);
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Access token and user stored, and not expired.
    pub async fn is_authenticated(&self) -> bool {
        self.token_store.is_authenticated().await
    }

    /// The cached user of the current session.
    pub async fn current_user(&self) -> Option<UserProfile> {
        let snapshot = self.token_store.session_snapshot().await;
        if snapshot.is_authenticated(self.clock.now()) {
            snapshot.user
        } else {
            None
        }
    }

    /// The access token of the current session.
    pub async fn access_token(&self) -> Option<String> {
        let snapshot = self.token_store.session_snapshot().await;
        if snapshot.is_authenticated(self.clock.now()) {
            snapshot.access_token
        } else {
            None
        }
    }

    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.token_store.expires_at().await
    }

    pub async fn has_permission(&self, permission: &str) -> bool {
        self.current_user()
            .await
            .is_some_and(|user| user.has_permission(permission))
    }

    pub async fn has_role(&self, role: &str) -> bool {
        self.current_user()
            .await
            .is_some_and(|user| user.has_role(role))
    }

    pub async fn has_any_role(&self, roles: &[&str]) -> bool {
        self.current_user()
            .await
            .is_some_and(|user| user.has_any_role(roles))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register an event callback. See [`EventBus::subscribe`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.token_store
    }

    pub fn session_monitor(&self) -> &SessionMonitor {
        &self.monitor
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.entries().await
    }

    /// Record the event in the audit log, then publish it.
    async fn publish(&self, event: AuthEvent) {
        if let Err(e) = self.audit.append(event.name(), event.audit_data()).await {
            warn!(event = event.name(), error = %e, "Failed to append audit entry");
        }
        self.events.publish(event);
    }

    // ------------------------------------------------------------------
    // Login / logout
    // ------------------------------------------------------------------

    /// Authenticate with email and password.
    ///
    /// On success the session is persisted, its timers are armed and
    /// `LOGIN_SUCCESS` is published. On failure `LOGIN_FAILED` is published
    /// and the error is returned.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] when the server refuses the login
    /// - [`AuthError::Network`] / [`AuthError::Timeout`] on transport failure
    /// - [`AuthError::Superseded`] when another tab's login was adopted
    ///   while this one was in flight
    #[instrument(skip(self, credentials))]
    pub async fn login(&self, credentials: LoginCredentials) -> Result<UserProfile> {
        info!("Starting login");
        let epoch = self.current_epoch();
        self.set_state(AuthState::Authenticating);

        let result = match self.api.login(&credentials).await {
            Ok(response) => self.commit_session(epoch, response).await,
            Err(AuthError::Unauthorized) => Err(AuthError::InvalidCredentials(
                "Invalid email or password".to_string(),
            )),
            Err(AuthError::Rejected(message)) => Err(AuthError::InvalidCredentials(message)),
            Err(e) => Err(e),
        };

        match result {
            Ok(user) => {
                info!(user_id = %user.id, "Login completed successfully");
                self.publish(AuthEvent::LoginSuccess { user: user.clone() })
                    .await;
                Ok(user)
            }
            Err(AuthError::Superseded) => {
                debug!("Login result discarded, session changed meanwhile");
                self.settle_state().await;
                Err(AuthError::Superseded)
            }
            Err(e) => {
                error!(error = %e, "Login failed");
                self.settle_state().await;
                self.publish(AuthEvent::LoginFailed {
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    /// Complete a two-factor login.
    ///
    /// Creates the session like [`login`](Self::login) and publishes
    /// `2FA_VERIFIED`.
    #[instrument(skip(self, verification))]
    pub async fn verify_two_factor(&self, verification: TwoFactorVerification) -> Result<UserProfile> {
        let epoch = self.current_epoch();
        self.set_state(AuthState::Authenticating);

        let result = match self.api.verify_two_factor(&verification).await {
            Ok(response) => self.commit_session(epoch, response).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(user) => {
                info!(user_id = %user.id, "Two-factor verification completed successfully");
                self.publish(AuthEvent::TwoFactorVerified { user: user.clone() })
                    .await;
                Ok(user)
            }
            Err(AuthError::Superseded) => {
                self.settle_state().await;
                Err(AuthError::Superseded)
            }
            Err(e) => {
                error!(error = %e, "Two-factor verification failed");
                self.settle_state().await;
                self.publish(AuthEvent::TwoFactorVerificationFailed {
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    /// Persist a freshly issued session unless the epoch moved since `epoch`.
    async fn commit_session(&self, epoch: u64, response: LoginResponse) -> Result<UserProfile> {
        let _guard = self.commit_lock.lock().await;
        if self.current_epoch() != epoch {
            return Err(AuthError::Superseded);
        }
        self.bump_epoch();

        let LoginResponse {
            user,
            token,
            refresh_token,
            expires_in,
        } = response;

        let persisted = async {
            match expires_in {
                Some(secs) => {
                    self.monitor.start(Duration::from_secs(secs)).await?;
                }
                None => self.monitor.stop().await?,
            }
            self.token_store
                .store_session(&token, refresh_token.as_deref(), &user)
                .await
        }
        .await;

        if let Err(e) = persisted {
            error!(error = %e, "Failed to persist session, rolling back");
            self.monitor.cancel_timers();
            if let Err(e) = self.token_store.clear().await {
                warn!(error = %e, "Failed to roll back partial session");
            }
            return Err(e);
        }

        debug!(token = %token_fingerprint(&token), "Session committed");
        self.set_state(AuthState::Authenticated);
        Ok(user)
    }

    /// End the session.
    ///
    /// The server is told on a best-effort basis (never for `OTHER_TAB`,
    /// `SESSION_EXPIRED` or `AUTHENTICATION_REQUIRED`); a failure there is
    /// logged and ignored. Storage is cleared, timers are stopped and
    /// `LOGOUT` is published with `reason`. Safe to call repeatedly.
    #[instrument(skip_all, fields(reason = %reason))]
    pub async fn logout(&self, reason: LogoutReason) {
        info!("Logging out");
        self.bump_epoch();
        self.monitor.cancel_timers();

        if reason.notifies_server() {
            if let Some(token) = self.token_store.access_token().await {
                if let Err(e) = self.api.logout(&token).await {
                    warn!(error = %e, "Server logout failed, clearing local session anyway");
                }
            }
        }

        {
            let _guard = self.commit_lock.lock().await;
            self.bump_epoch();
            if let Err(e) = self.token_store.clear().await {
                error!(error = %e, "Failed to clear persisted session");
            }
            if let Err(e) = self.monitor.stop().await {
                warn!(error = %e, "Failed to remove session expiry");
            }
            self.set_state(AuthState::Anonymous);
        }

        self.publish(AuthEvent::Logout { reason }).await;
        info!("Logout completed");
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Exchange the refresh token for a new access token.
    ///
    /// This method:
    /// 1. Waits for any refresh already in flight; if that one committed,
    ///    returns without a second exchange
    /// 2. Follows the stored session instead when another tab already
    ///    refreshed it past the expiry armed here
    /// 3. Calls `/auth/refresh` with the stored refresh token
    /// 4. Stores the new tokens, restarts the timers and publishes
    ///    `TOKEN_REFRESHED`
    ///
    /// Any failure ends the session with `TOKEN_REFRESH_FAILED`, unless the
    /// session already changed while the request was in flight or another
    /// tab rotated the tokens. A rejected exchange waits up to
    /// `rotation_grace` for that rotation to land in storage.
    ///
    /// # Errors
    ///
    /// - [`AuthError::TokenRefreshFailed`] when no refresh token is stored
    ///   or the exchange fails
    /// - [`AuthError::SessionInvalidated`] when the session ended while
    ///   waiting for another refresh
    #[instrument(skip(self))]
    pub async fn refresh_token(&self) -> Result<()> {
        let observed = self.current_epoch();
        let _flight = self.refresh_lock.lock().await;

        if self.current_epoch() != observed {
            if self.token_store.is_authenticated().await {
                debug!("Session already refreshed by a concurrent caller");
                return Ok(());
            }
            return Err(AuthError::SessionInvalidated(
                "Session ended while waiting for refresh".to_string(),
            ));
        }

        let stored = self.token_store.session_snapshot().await;
        if self.refreshed_elsewhere(&stored) {
            if self.follow_stored_session().await {
                debug!("Session already refreshed in another tab");
                return Ok(());
            }
            return Err(AuthError::SessionInvalidated(
                "Session ended while refreshing".to_string(),
            ));
        }

        let Some(refresh_token) = stored.refresh_token.clone() else {
            warn!("No refresh token available");
            self.logout(LogoutReason::TokenRefreshFailed).await;
            return Err(AuthError::TokenRefreshFailed(
                "No refresh token available".to_string(),
            ));
        };

        let epoch = self.current_epoch();
        self.set_state(AuthState::Refreshing);
        debug!("Refreshing access token");

        let response = match self.api.refresh(&refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                if self.rotated_elsewhere(&stored, &e).await && self.follow_stored_session().await {
                    info!("Refresh token was rotated by another tab, following its session");
                    return Ok(());
                }
                error!(error = %e, "Token refresh failed");
                if self.current_epoch() == epoch {
                    self.logout(LogoutReason::TokenRefreshFailed).await;
                } else {
                    self.settle_state().await;
                }
                return Err(AuthError::TokenRefreshFailed(e.to_string()));
            }
        };

        match self.commit_refresh(epoch, response).await {
            Ok(expires_at) => {
                info!(?expires_at, "Token refresh completed successfully");
                self.publish(AuthEvent::TokenRefreshed { expires_at }).await;
                Ok(())
            }
            Err(AuthError::Superseded) => {
                debug!("Refresh result discarded, session changed meanwhile");
                self.settle_state().await;
                Err(AuthError::Superseded)
            }
            Err(e) => {
                error!(error = %e, "Failed to persist refreshed tokens");
                self.logout(LogoutReason::TokenRefreshFailed).await;
                Err(AuthError::TokenRefreshFailed(e.to_string()))
            }
        }
    }

    /// The stored expiry is later than the one this tab armed.
    fn refreshed_elsewhere(&self, stored: &SessionSnapshot) -> bool {
        let Some(armed) = self.monitor.armed() else {
            return false;
        };
        stored.is_authenticated(self.clock.now())
            && stored.expires_at.is_some_and(|at| at > armed.expires_at)
    }

    /// Whether storage now holds tokens other than the ones the failed
    /// exchange started from.
    async fn rotated_elsewhere(&self, before: &SessionSnapshot, error: &AuthError) -> bool {
        let rotated = |current: &SessionSnapshot| {
            current.is_authenticated(self.clock.now())
                && (current.access_token != before.access_token
                    || current.refresh_token != before.refresh_token)
        };
        if rotated(&self.token_store.session_snapshot().await) {
            return true;
        }

        let rejected = matches!(error, AuthError::Unauthorized | AuthError::Rejected(_));
        if !rejected || !self.features.cross_tab_sync || self.rotation_grace.is_zero() {
            return false;
        }
        debug!(
            grace_ms = self.rotation_grace.as_millis() as u64,
            "Refresh rejected, waiting for a rotation from another tab"
        );
        tokio::time::sleep(self.rotation_grace).await;
        rotated(&self.token_store.session_snapshot().await)
    }

    /// Re-arm timers from the stored session written by another tab.
    ///
    /// Returns false when storage no longer holds a live session.
    async fn follow_stored_session(&self) -> bool {
        let _guard = self.commit_lock.lock().await;
        let snapshot = self.token_store.session_snapshot().await;
        if !snapshot.is_authenticated(self.clock.now()) {
            self.settle_state().await;
            return false;
        }
        self.bump_epoch();
        match snapshot.expires_at {
            Some(expires_at) => {
                self.monitor.resume(expires_at);
            }
            None => self.monitor.cancel_timers(),
        }
        self.set_state(AuthState::Authenticated);
        true
    }

    async fn commit_refresh(
        &self,
        epoch: u64,
        response: RefreshResponse,
    ) -> Result<Option<DateTime<Utc>>> {
        let _guard = self.commit_lock.lock().await;
        if self.current_epoch() != epoch {
            return Err(AuthError::Superseded);
        }
        self.bump_epoch();

        let expires_at = match response.expires_in {
            Some(secs) => Some(self.monitor.start(Duration::from_secs(secs)).await?),
            None => {
                self.monitor.stop().await?;
                None
            }
        };
        self.token_store
            .update_tokens(&response.token, response.refresh_token.as_deref())
            .await?;
        self.set_state(AuthState::Authenticated);
        Ok(expires_at)
    }

    // ------------------------------------------------------------------
    // Account operations
    // ------------------------------------------------------------------

    /// Create an account. The new user still has to log in.
    #[instrument(skip(self, registration))]
    pub async fn register(&self, registration: RegistrationRequest) -> Result<UserProfile> {
        match self.api.register(&registration).await {
            Ok(user) => {
                info!(user_id = %user.id, "Registration completed successfully");
                self.publish(AuthEvent::RegistrationSuccess { user: user.clone() })
                    .await;
                Ok(user)
            }
            Err(e) => {
                error!(error = %e, "Registration failed");
                self.publish(AuthEvent::RegistrationFailed {
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    /// Ask the server to mail a password reset link.
    #[instrument(skip_all)]
    pub async fn request_password_reset(&self, email: &str) -> Result<()> {
        match self.api.forgot_password(email).await {
            Ok(_) => {
                info!("Password reset requested");
                self.publish(AuthEvent::PasswordResetRequested {
                    email: email.to_string(),
                })
                .await;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Password reset request failed");
                self.publish(AuthEvent::PasswordResetFailed {
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    #[instrument(skip_all)]
    pub async fn reset_password(&self, reset: PasswordReset) -> Result<()> {
        match self.api.reset_password(&reset).await {
            Ok(_) => {
                info!("Password reset completed successfully");
                self.publish(AuthEvent::PasswordResetSuccess).await;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Password reset failed");
                self.publish(AuthEvent::PasswordResetFailed {
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    #[instrument(skip_all)]
    pub async fn change_password(&self, change: PasswordChange) -> Result<()> {
        let result = match self.require_token().await {
            Ok(token) => self.api.change_password(&token, &change).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => {
                info!("Password changed successfully");
                self.publish(AuthEvent::PasswordChanged).await;
                Ok(())
            }
            Err(e) => {
                self.bearer_failure(e, |error| AuthEvent::PasswordChangeFailed { error })
                    .await
            }
        }
    }

    /// Update the signed-in user's profile and the cached copy.
    #[instrument(skip_all)]
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<UserProfile> {
        let epoch = self.current_epoch();
        let result = match self.require_token().await {
            Ok(token) => self.api.update_profile(&token, &update).await,
            Err(e) => Err(e),
        };
        let user = match result {
            Ok(user) => user,
            Err(e) => {
                return self
                    .bearer_failure(e, |error| AuthEvent::ProfileUpdateFailed { error })
                    .await;
            }
        };

        {
            let _guard = self.commit_lock.lock().await;
            if self.current_epoch() != epoch {
                debug!("Profile update discarded, session changed meanwhile");
                return Err(AuthError::Superseded);
            }
            if let Err(e) = self.token_store.set_user(&user).await {
                drop(_guard);
                return self
                    .bearer_failure(e, |error| AuthEvent::ProfileUpdateFailed { error })
                    .await;
            }
        }

        info!(user_id = %user.id, "Profile updated successfully");
        self.publish(AuthEvent::ProfileUpdated { user: user.clone() })
            .await;
        Ok(user)
    }

    /// Start two-factor enrolment. Returns the provider's setup payload.
    #[instrument(skip_all)]
    pub async fn setup_two_factor(&self) -> Result<Value> {
        let result = match self.require_token().await {
            Ok(token) => self.api.setup_two_factor(&token).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(setup) => {
                info!("Two-factor setup initiated");
                self.publish(AuthEvent::TwoFactorSetupInitiated {
                    setup: setup.clone(),
                })
                .await;
                Ok(setup)
            }
            Err(e) => {
                self.bearer_failure(e, |error| AuthEvent::TwoFactorSetupFailed { error })
                    .await
            }
        }
    }

    /// Ask the server whether the current access token is still accepted.
    ///
    /// Never fails and never changes local state: any error reads as
    /// `valid: false`.
    #[instrument(skip(self))]
    pub async fn validate_session(&self) -> ValidationResult {
        let Some(token) = self.token_store.access_token().await else {
            return ValidationResult::invalid();
        };
        match self.api.validate(&token).await {
            Ok(user) => ValidationResult::valid(user),
            Err(e) => {
                debug!(error = %e, "Session validation failed");
                ValidationResult::invalid()
            }
        }
    }

    /// Send an arbitrary API request with the session's bearer token.
    ///
    /// Relative URLs are resolved against the API base URL. A 401 response
    /// ends the session with `AUTHENTICATION_REQUIRED`.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn authorized_request(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        let token = self.require_token().await?;
        if !request.url.contains("://") {
            request.url = self.api.url(&request.url);
        }

        let response = self.api.send(request.bearer_token(token)).await?;
        if response.is_unauthorized() {
            warn!("Request rejected with 401, ending session");
            self.logout(LogoutReason::AuthenticationRequired).await;
            return Err(AuthError::Unauthorized);
        }
        Ok(response)
    }

    async fn require_token(&self) -> Result<String> {
        self.access_token().await.ok_or(AuthError::NotAuthenticated)
    }

    /// Publish the failure event for a bearer call; a 401 also ends the session.
    async fn bearer_failure<T>(
        &self,
        err: AuthError,
        event: impl FnOnce(String) -> AuthEvent,
    ) -> Result<T> {
        error!(error = %err, "Authenticated request failed");
        self.publish(event(err.to_string())).await;
        if err.is_unauthorized() {
            self.logout(LogoutReason::AuthenticationRequired).await;
        }
        Err(err)
    }

    // ------------------------------------------------------------------
    // Signal handlers
    // ------------------------------------------------------------------

    async fn handle_timer(&self, fired: TimerFired) {
        if !self.monitor.is_current(fired.generation) {
            debug!(?fired, "Ignoring stale session timer");
            return;
        }
        match fired.kind {
            TimerKind::Expiry => {
                info!("Session expired");
                self.logout(LogoutReason::SessionExpired).await;
            }
            TimerKind::Refresh => {
                if let Err(e) = self.refresh_token().await {
                    warn!(error = %e, "Scheduled token refresh failed");
                }
            }
        }
    }

    async fn handle_storage_change(self: &Arc<Self>, change: StorageChange) {
        let keys = self.token_store.keys();
        let relevant = match change.key.as_deref() {
            None => true,
            Some(key) => keys.is_session_marker(key),
        };
        if !relevant {
            return;
        }

        if change.is_removed() || change.new_value.is_none() {
            self.follow_foreign_logout().await;
        } else {
            let access_changed = change.key.as_deref() == Some(keys.access_token.as_str());
            self.follow_foreign_session(access_changed).await;
        }
    }

    /// Another tab ended the session. It already cleared storage and told
    /// the server, so only local state is dropped.
    async fn follow_foreign_logout(&self) {
        {
            let _guard = self.commit_lock.lock().await;
            if !self.state().has_session() {
                return;
            }
            self.bump_epoch();
            self.monitor.cancel_timers();
            self.set_state(AuthState::Anonymous);
        }
        info!("Session ended in another tab");
        self.publish(AuthEvent::Logout {
            reason: LogoutReason::OtherTab,
        })
        .await;
    }

    /// Another tab wrote session keys.
    ///
    /// Revalidation runs as its own task so a slow server does not hold up
    /// the signal loop.
    async fn follow_foreign_session(self: &Arc<Self>, access_changed: bool) {
        let snapshot = self.token_store.session_snapshot().await;
        if !snapshot.is_authenticated(self.clock.now()) {
            // Partial write; the access token comes last.
            return;
        }

        if self.state().has_session() {
            // Another tab refreshed: follow its schedule instead of refreshing again.
            if access_changed && self.follow_stored_session().await {
                debug!("Following tokens refreshed in another tab");
            }
            return;
        }

        let Some(token) = snapshot.access_token else {
            return;
        };

        if self.features.revalidate_adopted_sessions {
            let service = Arc::clone(self);
            tokio::spawn(async move {
                match service.api.validate(&token).await {
                    Ok(_) => service.adopt_stored_session(&token).await,
                    Err(e) => {
                        warn!(error = %e, "Not adopting session from another tab, validation failed")
                    }
                }
            });
            return;
        }
        self.adopt_stored_session(&token).await;
    }

    /// Take over the stored session if it still carries `token`.
    async fn adopt_stored_session(&self, token: &str) {
        let user = {
            let _guard = self.commit_lock.lock().await;
            if self.state().has_session() {
                return;
            }
            let snapshot = self.token_store.session_snapshot().await;
            if !snapshot.is_authenticated(self.clock.now())
                || snapshot.access_token.as_deref() != Some(token)
            {
                debug!("Stored session changed before it could be adopted");
                return;
            }
            let Some(user) = snapshot.user else {
                return;
            };
            self.bump_epoch();
            if let Some(expires_at) = snapshot.expires_at {
                self.monitor.resume(expires_at);
            }
            self.set_state(AuthState::Authenticated);
            user
        };
        info!(user_id = %user.id, "Adopted session from another tab");
        self.publish(AuthEvent::LoginSuccess { user }).await;
    }

    async fn handle_lifecycle_change(&self, state: LifecycleState) {
        if !state.is_visible() || !self.token_store.is_authenticated().await {
            return;
        }
        debug!("Visible again, revalidating session");
        let epoch = self.current_epoch();
        let result = self.validate_session().await;
        if !result.valid && self.current_epoch() == epoch {
            warn!("Session no longer accepted by the server");
            self.logout(LogoutReason::SessionInvalid).await;
        }
    }
}

impl Drop for AuthService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn next_timer(timers: &mut Option<mpsc::UnboundedReceiver<TimerFired>>) -> Option<TimerFired> {
    match timers {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_storage_change(
    stream: &mut Option<Box<dyn StorageChangeStream>>,
) -> Option<StorageChange> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn next_lifecycle_change(
    stream: &mut Option<Box<dyn LifecycleChangeStream>>,
) -> Option<LifecycleState> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Dispatch timer, storage and lifecycle signals until shutdown.
///
/// Storage changes are handled in order on the loop itself and never wait on
/// the network; timer and lifecycle handlers may, and run as their own tasks.
async fn run_signal_loop(
    service: Weak<AuthService>,
    mut timers: Option<mpsc::UnboundedReceiver<TimerFired>>,
    mut storage: Option<Box<dyn StorageChangeStream>>,
    mut lifecycle: Option<Box<dyn LifecycleChangeStream>>,
    shutdown: CancellationToken,
) {
    debug!("Auth signal loop started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            fired = next_timer(&mut timers) => match fired {
                Some(fired) => {
                    let Some(service) = service.upgrade() else { break };
                    tokio::spawn(async move { service.handle_timer(fired).await });
                }
                None => timers = None,
            },
            change = next_storage_change(&mut storage) => match change {
                Some(change) => {
                    let Some(service) = service.upgrade() else { break };
                    service.handle_storage_change(change).await;
                }
                None => {
                    debug!("Storage change stream closed");
                    storage = None;
                }
            },
            state = next_lifecycle_change(&mut lifecycle) => match state {
                Some(state) => {
                    let Some(service) = service.upgrade() else { break };
                    tokio::spawn(async move { service.handle_lifecycle_change(state).await });
                }
                None => {
                    debug!("Lifecycle change stream closed");
                    lifecycle = None;
                }
            },
        }
    }
    debug!("Auth signal loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_desktop::MemoryKeyValueStore;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::http::HttpClient;
    use bridge_traits::storage::KeyValueStore;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CountingHttp {
        calls: StdMutex<usize>,
    }

    #[async_trait]
    impl HttpClient for CountingHttp {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            *self.calls.lock().unwrap() += 1;
            Err(BridgeError::NotAvailable("offline".into()))
        }
    }

    fn service() -> (Arc<AuthService>, Arc<CountingHttp>, MemoryKeyValueStore) {
        let http = Arc::new(CountingHttp::default());
        let storage = MemoryKeyValueStore::new_origin();
        let config = CoreConfig::builder()
            .api_base_url("https://gate.example.com/api")
            .http_client(http.clone())
            .storage(Arc::new(storage.clone()))
            .enable_cross_tab_sync(false)
            .enable_visibility_revalidation(false)
            .build()
            .unwrap();
        (AuthService::new(&config), http, storage)
    }

    #[tokio::test]
    async fn test_unrelated_storage_keys_are_ignored() {
        let (service, http, _) = service();
        let mut published = service.events().subscribe_stream();

        service
            .handle_storage_change(StorageChange::new("smart_check:theme", None, Some("dark".into())))
            .await;
        service
            .handle_storage_change(StorageChange::new(
                "smart_check:refresh_token",
                Some("r".into()),
                None,
            ))
            .await;

        assert_eq!(service.state(), AuthState::Anonymous);
        assert!(published.try_recv().is_err());
        assert_eq!(*http.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_foreign_removal_without_session_is_silent() {
        let (service, _, _) = service();
        let mut published = service.events().subscribe_stream();

        service.handle_storage_change(StorageChange::cleared()).await;

        assert!(published.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partial_foreign_write_is_not_adopted() {
        let (service, _, storage) = service();
        let keys = service.token_store().keys().clone();
        storage
            .set_string(&keys.user, r#"{"id":3}"#)
            .await
            .unwrap();

        service
            .handle_storage_change(StorageChange::new(keys.user.as_str(), None, Some("{}".into())))
            .await;

        assert_eq!(service.state(), AuthState::Anonymous);
    }

    #[tokio::test]
    async fn test_stale_timer_is_ignored() {
        let (service, http, _) = service();
        let mut published = service.events().subscribe_stream();

        service
            .handle_timer(TimerFired {
                kind: TimerKind::Expiry,
                generation: 99,
            })
            .await;

        assert!(published.try_recv().is_err());
        assert_eq!(*http.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let (service, _, _) = service();
        service.init().await.unwrap();
        service.init().await.unwrap();
        assert_eq!(service.state(), AuthState::Anonymous);
        service.shutdown().await;
        service.shutdown().await;
    }
}
