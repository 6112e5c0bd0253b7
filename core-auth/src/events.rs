//! Auth Event Bus
//!
//! Multicast notification of auth-state transitions.
//!
//! Two ways to listen:
//!
//! - [`EventBus::subscribe`] registers a synchronous callback. Callbacks run
//!   inline during [`EventBus::publish`], in registration order, and each call
//!   is isolated: a panicking listener is logged and the remaining listeners
//!   still run.
//! - [`EventBus::subscribe_stream`] returns a `broadcast` receiver for async
//!   consumers. A receiver that falls behind loses the oldest events.
//!
//! ## Example
//!
//! ```
//! use core_auth::{AuthEvent, EventBus, LogoutReason};
//!
//! let bus = EventBus::default();
//! let subscription = bus.subscribe(|event| println!("auth event: {}", event.name()));
//!
//! bus.publish(AuthEvent::Logout { reason: LogoutReason::UserInitiated });
//! subscription.unsubscribe();
//! assert_eq!(bus.listener_count(), 0);
//! ```

use crate::types::UserProfile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Default capacity of the async broadcast channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogoutReason {
    UserInitiated,
    SessionInvalid,
    SessionExpired,
    TokenRefreshFailed,
    AuthenticationRequired,
    OtherTab,
}

impl LogoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogoutReason::UserInitiated => "USER_INITIATED",
            LogoutReason::SessionInvalid => "SESSION_INVALID",
            LogoutReason::SessionExpired => "SESSION_EXPIRED",
            LogoutReason::TokenRefreshFailed => "TOKEN_REFRESH_FAILED",
            LogoutReason::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            LogoutReason::OtherTab => "OTHER_TAB",
        }
    }

    /// Whether the server should be told about the logout.
    ///
    /// Skipped when the token is already dead or another tab has done it.
    pub fn notifies_server(&self) -> bool {
        matches!(
            self,
            LogoutReason::UserInitiated
                | LogoutReason::SessionInvalid
                | LogoutReason::TokenRefreshFailed
        )
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Auth-state transitions published by the service.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    LoginSuccess { user: UserProfile },
    LoginFailed { error: String },
    Logout { reason: LogoutReason },
    TokenRefreshed { expires_at: Option<DateTime<Utc>> },
    ProfileUpdated { user: UserProfile },
    ProfileUpdateFailed { error: String },
    RegistrationSuccess { user: UserProfile },
    RegistrationFailed { error: String },
    PasswordResetRequested { email: String },
    PasswordResetSuccess,
    PasswordResetFailed { error: String },
    PasswordChanged,
    PasswordChangeFailed { error: String },
    TwoFactorSetupInitiated { setup: Value },
    TwoFactorSetupFailed { error: String },
    TwoFactorVerified { user: UserProfile },
    TwoFactorVerificationFailed { error: String },
}

impl AuthEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            AuthEvent::LoginSuccess { .. } => "LOGIN_SUCCESS",
            AuthEvent::LoginFailed { .. } => "LOGIN_FAILED",
            AuthEvent::Logout { .. } => "LOGOUT",
            AuthEvent::TokenRefreshed { .. } => "TOKEN_REFRESHED",
            AuthEvent::ProfileUpdated { .. } => "PROFILE_UPDATED",
            AuthEvent::ProfileUpdateFailed { .. } => "PROFILE_UPDATE_FAILED",
            AuthEvent::RegistrationSuccess { .. } => "REGISTRATION_SUCCESS",
            AuthEvent::RegistrationFailed { .. } => "REGISTRATION_FAILED",
            AuthEvent::PasswordResetRequested { .. } => "PASSWORD_RESET_REQUESTED",
            AuthEvent::PasswordResetSuccess => "PASSWORD_RESET_SUCCESS",
            AuthEvent::PasswordResetFailed { .. } => "PASSWORD_RESET_FAILED",
            AuthEvent::PasswordChanged => "PASSWORD_CHANGED",
            AuthEvent::PasswordChangeFailed { .. } => "PASSWORD_CHANGE_FAILED",
            AuthEvent::TwoFactorSetupInitiated { .. } => "2FA_SETUP_INITIATED",
            AuthEvent::TwoFactorSetupFailed { .. } => "2FA_SETUP_FAILED",
            AuthEvent::TwoFactorVerified { .. } => "2FA_VERIFIED",
            AuthEvent::TwoFactorVerificationFailed { .. } => "2FA_VERIFICATION_FAILED",
        }
    }

    /// Error message carried by failure events.
    pub fn error(&self) -> Option<&str> {
        match self {
            AuthEvent::LoginFailed { error }
            | AuthEvent::ProfileUpdateFailed { error }
            | AuthEvent::RegistrationFailed { error }
            | AuthEvent::PasswordResetFailed { error }
            | AuthEvent::PasswordChangeFailed { error }
            | AuthEvent::TwoFactorSetupFailed { error }
            | AuthEvent::TwoFactorVerificationFailed { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error().is_some()
    }

    /// Minimal payload recorded in the audit log.
    ///
    /// Only identifiers are kept: no profile bodies, no 2FA secrets.
    pub fn audit_data(&self) -> Value {
        match self {
            AuthEvent::LoginSuccess { user }
            | AuthEvent::ProfileUpdated { user }
            | AuthEvent::RegistrationSuccess { user }
            | AuthEvent::TwoFactorVerified { user } => json!({ "userId": user.id }),
            AuthEvent::Logout { reason } => json!({ "reason": reason }),
            AuthEvent::TokenRefreshed { expires_at } => json!({ "expiresAt": expires_at }),
            AuthEvent::PasswordResetRequested { .. } => json!({}),
            AuthEvent::PasswordResetSuccess
            | AuthEvent::PasswordChanged
            | AuthEvent::TwoFactorSetupInitiated { .. } => json!({}),
            other => json!({ "error": other.error() }),
        }
    }
}

impl fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Listener = Arc<dyn Fn(&AuthEvent) + Send + Sync>;

struct BusInner {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<AuthEvent>,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }
}

/// Multicast bus for [`AuthEvent`]s. Cheap to clone; clones share listeners.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                sender,
            }),
        }
    }

    /// Register a callback. It stays registered until the returned
    /// [`Subscription`] is unsubscribed or dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        debug!(listener_id = id, "Auth event listener registered");
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    pub fn subscribe_stream(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.sender.subscribe()
    }

    /// Deliver `event` to every listener, then to stream subscribers.
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn publish(&self, event: AuthEvent) -> usize {
        // Snapshot so listeners may (un)subscribe from inside a callback.
        let listeners: Vec<(u64, Listener)> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut delivered = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(
                        event = event.name(),
                        listener_id = id,
                        panic = %message,
                        "Auth event listener panicked"
                    );
                }
            }
        }

        debug!(event = event.name(), delivered, "Published auth event");
        let _ = self.inner.sender.send(event);
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("stream_receivers", &self.inner.sender.receiver_count())
            .finish()
    }
}

/// Handle to a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keep the listener registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(self.id) {
                debug!(listener_id = self.id, "Auth event listener removed");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(bus: &EventBus) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let subscription = bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, subscription)
    }

    #[test]
    fn test_event_wire_names() {
        let user = UserProfile::new("1");
        assert_eq!(AuthEvent::LoginSuccess { user: user.clone() }.name(), "LOGIN_SUCCESS");
        assert_eq!(AuthEvent::PasswordChanged.name(), "PASSWORD_CHANGED");
        assert_eq!(
            AuthEvent::TwoFactorSetupInitiated { setup: json!({}) }.name(),
            "2FA_SETUP_INITIATED"
        );
        assert_eq!(
            AuthEvent::TwoFactorVerificationFailed { error: "x".into() }.name(),
            "2FA_VERIFICATION_FAILED"
        );
        assert_eq!(LogoutReason::OtherTab.to_string(), "OTHER_TAB");
        assert_eq!(
            serde_json::to_value(LogoutReason::TokenRefreshFailed).unwrap(),
            json!("TOKEN_REFRESH_FAILED")
        );
    }

    #[test]
    fn test_audit_data_is_minimal() {
        let user = UserProfile::new(5).with_email("secret@example.com");
        let data = AuthEvent::LoginSuccess { user }.audit_data();
        assert_eq!(data, json!({"userId": 5}));

        let data = AuthEvent::LoginFailed { error: "bad".into() }.audit_data();
        assert_eq!(data, json!({"error": "bad"}));

        let data = AuthEvent::PasswordResetRequested { email: "a@b.c".into() }.audit_data();
        assert_eq!(data, json!({}));
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = EventBus::default();
        let _bad = bus.subscribe(|_| panic!("listener failure"));
        let (count, _good) = counter(&bus);

        let delivered = bus.publish(AuthEvent::PasswordChanged);

        assert_eq!(delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_and_drop() {
        let bus = EventBus::default();
        let (first, first_sub) = counter(&bus);
        let (second, second_sub) = counter(&bus);
        assert_eq!(bus.listener_count(), 2);

        first_sub.unsubscribe();
        bus.publish(AuthEvent::PasswordChanged);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        drop(second_sub);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_detached_listener_stays_registered() {
        let bus = EventBus::default();
        let (count, subscription) = counter(&bus);
        subscription.detach();

        bus.publish(AuthEvent::PasswordResetSuccess);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_listener_may_subscribe_during_publish() {
        let bus = EventBus::default();
        let inner_bus = bus.clone();
        let _outer = bus.subscribe(move |_| inner_bus.subscribe(|_| {}).detach());

        bus.publish(AuthEvent::PasswordChanged);
        assert_eq!(bus.listener_count(), 2);
    }

    #[tokio::test]
    async fn test_stream_receives_events() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe_stream();

        bus.publish(AuthEvent::Logout {
            reason: LogoutReason::SessionExpired,
        });

        let event = stream.recv().await.unwrap();
        assert_eq!(
            event,
            AuthEvent::Logout {
                reason: LogoutReason::SessionExpired
            }
        );
    }
}
