use chrono::{DateTime, Utc};
use core_runtime::logging::token_fingerprint;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Roles that implicitly hold every permission.
pub const ADMIN_ROLES: [&str; 2] = ["admin", "super_admin"];

/// Identifier of a user as issued by the backend.
///
/// The API emits numeric ids for some deployments and string ids for others;
/// both forms are kept as-is so a cached profile round-trips unchanged.
///
/// # Examples
///
/// ```
/// use core_auth::UserId;
///
/// let id: UserId = serde_json::from_str("42").unwrap();
/// assert_eq!(id.to_string(), "42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Number(i64),
    Text(String),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Number(n) => write!(f, "{}", n),
            UserId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId::Text(value.to_string())
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        UserId::Number(value)
    }
}

/// Cached profile of the signed-in user.
///
/// Fields the core does not interpret (organization, avatar, phone, ...) are
/// kept in `extra` so nothing is lost between the API and the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            email: None,
            name: None,
            role: None,
            permissions: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.role.as_deref() == Some(role)
    }

    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|role| self.has_role(role))
    }

    pub fn is_admin(&self) -> bool {
        self.has_any_role(&ADMIN_ROLES)
    }

    /// Admin roles imply every permission.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.is_admin() || self.permissions.iter().any(|p| p == permission)
    }
}

/// Login form payload.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remember_me: Option<bool>,
}

impl LoginCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            remember_me: None,
        }
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("remember_me", &self.remember_me)
            .finish()
    }
}

/// Sign-up payload. Deployment-specific fields go in `extra`.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RegistrationRequest {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            password: password.into(),
            extra: Map::new(),
        }
    }
}

impl fmt::Debug for RegistrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationRequest")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Completes a reset started with a forgot-password mail.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordReset {
    pub token: String,
    pub password: String,
}

impl fmt::Debug for PasswordReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordReset").finish_non_exhaustive()
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChange {
    pub current_password: String,
    pub new_password: String,
}

impl fmt::Debug for PasswordChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordChange").finish_non_exhaustive()
    }
}

/// Partial profile update; only the fields that are set are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Second step of a two-factor login.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorVerification {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_token: Option<String>,
}

impl TwoFactorVerification {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            email: None,
            temp_token: None,
        }
    }
}

/// Payload of `/auth/login` and `/auth/2fa/verify`.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: UserProfile,
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of `token` in seconds; absent means it never expires.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginResponse")
            .field("user", &self.user.id)
            .field("token", &token_fingerprint(&self.token))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Payload of `/auth/refresh`.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl fmt::Debug for RefreshResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshResponse")
            .field("token", &token_fingerprint(&self.token))
            .field("rotated", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Payloads that only carry a user (`/auth/register`, `/auth/profile`, `/auth/validate`).
#[derive(Debug, Clone, Deserialize)]
pub struct UserEnvelope {
    pub user: UserProfile,
}

/// Authentication state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthState {
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Anonymous => "ANONYMOUS",
            AuthState::Authenticating => "AUTHENTICATING",
            AuthState::Authenticated => "AUTHENTICATED",
            AuthState::Refreshing => "REFRESHING",
        }
    }

    /// `true` while a session is held, including during a refresh.
    pub fn has_session(&self) -> bool {
        matches!(self, AuthState::Authenticated | AuthState::Refreshing)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the token store holds, read in one pass.
#[derive(Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    /// `true` once `expires_at` has passed. A session without expiry never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Access token and user present, and not expired.
    pub fn is_authenticated(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_some() && self.user.is_some() && !self.is_expired(now)
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.user.is_none()
            && self.expires_at.is_none()
    }
}

impl fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field(
                "access_token",
                &self.access_token.as_deref().map(token_fingerprint),
            )
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("user", &self.user.as_ref().map(|u| &u.id))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of asking the server whether the current access token is accepted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub user: Option<UserProfile>,
}

impl ValidationResult {
    pub fn valid(user: UserProfile) -> Self {
        Self {
            valid: true,
            user: Some(user),
        }
    }

    pub fn invalid() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_profile_keeps_unknown_fields() {
        let raw = json!({
            "id": 7,
            "email": "guard@example.com",
            "role": "operator",
            "permissions": ["visitors.read"],
            "organization": {"id": "org-1", "name": "HQ"}
        });

        let profile: UserProfile = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(profile.id, UserId::Number(7));
        assert_eq!(profile.extra["organization"]["name"], "HQ");
        assert_eq!(serde_json::to_value(&profile).unwrap(), raw);
    }

    #[test]
    fn test_string_ids_stay_strings() {
        let profile: UserProfile = serde_json::from_value(json!({"id": "u-1"})).unwrap();
        assert_eq!(profile.id, UserId::Text("u-1".into()));
        assert!(profile.permissions.is_empty());
    }

    #[test]
    fn test_admin_roles_imply_every_permission() {
        let admin = UserProfile::new("1").with_role("super_admin");
        assert!(admin.has_permission("anything"));

        let operator = UserProfile::new("2")
            .with_role("operator")
            .with_permissions(["visitors.read"]);
        assert!(operator.has_permission("visitors.read"));
        assert!(!operator.has_permission("visitors.delete"));
        assert!(operator.has_any_role(&["viewer", "operator"]));
        assert!(!operator.has_role("admin"));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = LoginCredentials::new("a@b.c", "hunter2");
        let debug = format!("{:?}", credentials);
        assert!(!debug.contains("hunter2"));
        assert_eq!(
            serde_json::to_value(&credentials).unwrap(),
            json!({"email": "a@b.c", "password": "hunter2"})
        );
    }

    #[test]
    fn test_snapshot_authentication_rules() {
        let now = Utc::now();
        let mut snapshot = SessionSnapshot {
            access_token: Some("token".into()),
            refresh_token: None,
            user: Some(UserProfile::new("1")),
            expires_at: None,
        };
        assert!(snapshot.is_authenticated(now));

        snapshot.expires_at = Some(now + Duration::seconds(10));
        assert!(snapshot.is_authenticated(now));

        snapshot.expires_at = Some(now - Duration::seconds(1));
        assert!(snapshot.is_expired(now));
        assert!(!snapshot.is_authenticated(now));

        snapshot.expires_at = None;
        snapshot.user = None;
        assert!(!snapshot.is_authenticated(now));
    }

    #[test]
    fn test_login_response_debug_hides_token() {
        let response: LoginResponse = serde_json::from_value(json!({
            "user": {"id": 1},
            "token": "secret-access-token",
            "refreshToken": "secret-refresh",
            "expiresIn": 600
        }))
        .unwrap();
        assert_eq!(response.expires_in, Some(600));
        let debug = format!("{:?}", response);
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_auth_state_wire_names() {
        assert_eq!(AuthState::Refreshing.to_string(), "REFRESHING");
        assert!(AuthState::Refreshing.has_session());
        assert!(!AuthState::Authenticating.has_session());
    }
}
