//! # Authentication Module
//!
//! Client-side authentication and session lifecycle for the Smart Check
//! REST backend.
//!
//! ## Overview
//!
//! This crate keeps one user session per storage origin: it logs users in,
//! persists their tokens, refreshes them before they expire and keeps every
//! tab of the same origin in agreement about who is signed in.
//!
//! ## Features
//!
//! - Email/password and two-factor login against `/auth/*`
//! - Silent token refresh ahead of expiry, single-flight across callers
//! - Cross-tab login adoption and logout propagation through storage events
//! - Revalidation when the app becomes visible again
//! - Auth event bus with isolated listeners and a bounded audit log
//! - Role and permission checks on the cached user
//!
//! ## Components
//!
//! - [`TokenStore`]: persisted access/refresh tokens, user and expiry
//! - [`SessionMonitor`]: refresh and expiry timers
//! - [`EventBus`]: publish/subscribe of [`AuthEvent`]s
//! - [`AuthService`]: the orchestrator
//! - [`AuthContext`]: observable snapshot for UI layers

pub mod api;
pub mod audit_log;
pub mod context;
pub mod error;
pub mod events;
pub mod service;
pub mod session_monitor;
pub mod token_store;
pub mod types;

pub use audit_log::{AuditEntry, AuditLog, DEFAULT_AUDIT_LOG_CAPACITY};
pub use context::{AuthContext, AuthSnapshot};
pub use error::{AuthError, ErrorCategory, Result};
pub use events::{AuthEvent, EventBus, LogoutReason, Subscription, DEFAULT_EVENT_BUFFER_SIZE};
pub use service::AuthService;
pub use session_monitor::{ArmedTimers, SessionMonitor, TimerFired, TimerKind};
pub use token_store::{StorageKeys, TokenStore};
pub use types::{
    AuthState, LoginCredentials, LoginResponse, PasswordChange, PasswordReset, ProfileUpdate,
    RefreshResponse, RegistrationRequest, SessionSnapshot, TwoFactorVerification, UserId,
    UserProfile, ValidationResult, ADMIN_ROLES,
};
