//! # Auth Context
//!
//! Observable view of the session for UI layers.
//!
//! [`AuthContext`] keeps an [`AuthSnapshot`] in a `watch` channel. The
//! snapshot follows the service's events, so a session adopted from another
//! tab or ended by a timer shows up without any call through the context.
//! The action wrappers add the `loading` flag and capture the last error as
//! text for display.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use core_auth::{AuthContext, AuthService, LoginCredentials};
//! # async fn example(service: Arc<AuthService>) {
//! let context = AuthContext::new(service).await;
//! let mut changes = context.watch();
//!
//! tokio::spawn(async move {
//!     while changes.changed().await.is_ok() {
//!         let snapshot = changes.borrow().clone();
//!         println!("authenticated: {}", snapshot.is_authenticated);
//!     }
//! });
//!
//! let _ = context.login(LoginCredentials::new("guard@example.com", "secret")).await;
//! # }
//! ```

use crate::error::Result;
use crate::events::{AuthEvent, LogoutReason, Subscription};
use crate::service::AuthService;
use crate::types::{LoginCredentials, ProfileUpdate, RegistrationRequest, UserProfile};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// What a UI needs to render the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthSnapshot {
    pub is_authenticated: bool,
    pub user: Option<UserProfile>,
    /// An action started through the context is in flight.
    pub loading: bool,
    /// Message of the last failed action or failure event.
    pub error: Option<String>,
}

impl AuthSnapshot {
    fn apply(&mut self, event: &AuthEvent) {
        match event {
            AuthEvent::LoginSuccess { user } | AuthEvent::TwoFactorVerified { user } => {
                self.is_authenticated = true;
                self.user = Some(user.clone());
                self.error = None;
            }
            AuthEvent::Logout { .. } => {
                self.is_authenticated = false;
                self.user = None;
            }
            AuthEvent::ProfileUpdated { user } => {
                self.user = Some(user.clone());
            }
            AuthEvent::TokenRefreshed { .. } => {
                self.is_authenticated = true;
            }
            other => {
                if let Some(error) = other.error() {
                    self.error = Some(error.to_string());
                }
            }
        }
    }
}

pub struct AuthContext {
    service: Arc<AuthService>,
    state: Arc<watch::Sender<AuthSnapshot>>,
    _subscription: Subscription,
}

impl AuthContext {
    /// Attach to `service`, seeding the snapshot from its current session.
    pub async fn new(service: Arc<AuthService>) -> Self {
        let initial = AuthSnapshot {
            is_authenticated: service.is_authenticated().await,
            user: service.current_user().await,
            loading: false,
            error: None,
        };
        let (sender, _) = watch::channel(initial);
        let state = Arc::new(sender);

        let listener_state = Arc::clone(&state);
        let subscription = service.subscribe(move |event| {
            listener_state.send_modify(|snapshot| snapshot.apply(event));
        });
        debug!("Auth context attached");

        Self {
            service,
            state,
            _subscription: subscription,
        }
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified on every snapshot change.
    pub fn watch(&self) -> watch::Receiver<AuthSnapshot> {
        self.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.state.borrow().user.clone()
    }

    pub fn service(&self) -> &Arc<AuthService> {
        &self.service
    }

    pub async fn login(&self, credentials: LoginCredentials) -> Result<UserProfile> {
        self.track(self.service.login(credentials)).await
    }

    pub async fn logout(&self) {
        self.state.send_modify(|s| s.loading = true);
        self.service.logout(LogoutReason::UserInitiated).await;
        self.state.send_modify(|s| s.loading = false);
    }

    pub async fn register(&self, registration: RegistrationRequest) -> Result<UserProfile> {
        self.track(self.service.register(registration)).await
    }

    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<UserProfile> {
        self.track(self.service.update_profile(update)).await
    }

    pub fn clear_error(&self) {
        self.state.send_if_modified(|s| s.error.take().is_some());
    }

    /// Re-read the session from the service.
    pub async fn sync(&self) {
        let is_authenticated = self.service.is_authenticated().await;
        let user = self.service.current_user().await;
        self.state.send_modify(|s| {
            s.is_authenticated = is_authenticated;
            s.user = user;
        });
    }

    async fn track<T>(&self, action: impl Future<Output = Result<T>>) -> Result<T> {
        self.state.send_modify(|s| {
            s.loading = true;
            s.error = None;
        });
        let result = action.await;
        self.state.send_modify(|s| {
            s.loading = false;
            if let Err(e) = &result {
                s.error = Some(e.to_string());
            }
        });
        result
    }
}
