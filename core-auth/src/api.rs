//! HTTP client for the `/auth/*` endpoints.
//!
//! Every response is expected to carry a `success` flag. A payload is
//! accepted either at the top level or nested under `data`. Errors are
//! mapped as follows:
//!
//! - HTTP 401 → [`AuthError::Unauthorized`]
//! - `success: false` or another non-2xx status → [`AuthError::Rejected`]
//!   carrying the server's `message`/`error` text
//! - a 2xx answer without `success: true` → [`AuthError::InvalidResponse`]
//! - transport failures → [`AuthError::Network`] / [`AuthError::Timeout`]

use crate::error::{AuthError, Result};
use crate::types::{
    LoginCredentials, LoginResponse, PasswordChange, PasswordReset, ProfileUpdate,
    RefreshResponse, RegistrationRequest, TwoFactorVerification, UserEnvelope, UserProfile,
};
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

pub struct AuthApi {
    http: Arc<dyn HttpClient>,
    base_url: Url,
    timeout: Duration,
}

impl AuthApi {
    pub fn new(http: Arc<dyn HttpClient>, base_url: Url, timeout: Duration) -> Self {
        Self {
            http,
            base_url,
            timeout,
        }
    }

    /// Absolute URL for an API path, joined with exactly one `/`.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: HttpMethod, path: &str) -> HttpRequest {
        HttpRequest::new(method, self.url(path))
            .header("Accept", "application/json")
            .timeout(self.timeout)
    }

    fn json_request<T: Serialize>(
        &self,
        method: HttpMethod,
        path: &str,
        body: &T,
    ) -> Result<HttpRequest> {
        self.request(method, path)
            .json(body)
            .map_err(|e| AuthError::Validation(format!("Failed to encode request: {}", e)))
    }

    /// Send without automatic retries: none of these calls are safe to replay.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.http
            .execute_with_retry(request, RetryPolicy::none())
            .await
            .map_err(AuthError::from_transport)
    }

    async fn call<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T> {
        let url = request.url.clone();
        let response = self.send(request).await?;
        debug!(url = %url, status = response.status, "Auth API response");
        decode(&response)
    }

    #[instrument(skip_all)]
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<LoginResponse> {
        let request = self.json_request(HttpMethod::Post, "/auth/login", credentials)?;
        self.call(request).await
    }

    #[instrument(skip_all)]
    pub async fn logout(&self, access_token: &str) -> Result<()> {
        let request = self
            .json_request(HttpMethod::Post, "/auth/logout", &json!({}))?
            .bearer_token(access_token);
        self.call::<Value>(request).await.map(|_| ())
    }

    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse> {
        let request = self.json_request(
            HttpMethod::Post,
            "/auth/refresh",
            &json!({ "refreshToken": refresh_token }),
        )?;
        self.call(request).await
    }

    #[instrument(skip_all)]
    pub async fn register(&self, registration: &RegistrationRequest) -> Result<UserProfile> {
        let request = self.json_request(HttpMethod::Post, "/auth/register", registration)?;
        self.call::<UserEnvelope>(request).await.map(|body| body.user)
    }

    #[instrument(skip_all)]
    pub async fn forgot_password(&self, email: &str) -> Result<Value> {
        let request = self.json_request(
            HttpMethod::Post,
            "/auth/forgot-password",
            &json!({ "email": email }),
        )?;
        self.call(request).await
    }

    #[instrument(skip_all)]
    pub async fn reset_password(&self, reset: &PasswordReset) -> Result<Value> {
        let request = self.json_request(HttpMethod::Post, "/auth/reset-password", reset)?;
        self.call(request).await
    }

    #[instrument(skip_all)]
    pub async fn change_password(&self, access_token: &str, change: &PasswordChange) -> Result<Value> {
        let request = self
            .json_request(HttpMethod::Post, "/auth/change-password", change)?
            .bearer_token(access_token);
        self.call(request).await
    }

    #[instrument(skip_all)]
    pub async fn update_profile(&self, access_token: &str, update: &ProfileUpdate) -> Result<UserProfile> {
        let request = self
            .json_request(HttpMethod::Put, "/auth/profile", update)?
            .bearer_token(access_token);
        self.call::<UserEnvelope>(request).await.map(|body| body.user)
    }

    #[instrument(skip_all)]
    pub async fn validate(&self, access_token: &str) -> Result<UserProfile> {
        let request = self
            .request(HttpMethod::Get, "/auth/validate")
            .bearer_token(access_token);
        self.call::<UserEnvelope>(request).await.map(|body| body.user)
    }

    #[instrument(skip_all)]
    pub async fn setup_two_factor(&self, access_token: &str) -> Result<Value> {
        let request = self
            .json_request(HttpMethod::Post, "/auth/2fa/setup", &json!({}))?
            .bearer_token(access_token);
        self.call(request).await
    }

    #[instrument(skip_all)]
    pub async fn verify_two_factor(&self, verification: &TwoFactorVerification) -> Result<LoginResponse> {
        let request = self.json_request(HttpMethod::Post, "/auth/2fa/verify", verification)?;
        self.call(request).await
    }
}

/// Decode an enveloped response body.
fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
    if response.is_unauthorized() {
        return Err(AuthError::Unauthorized);
    }

    let body: Value = if response.body.is_empty() {
        Value::Object(Default::default())
    } else {
        match response.json() {
            Ok(body) => body,
            Err(_) if !response.is_success() => {
                return Err(AuthError::Rejected(format!("HTTP {}", response.status)));
            }
            Err(e) => return Err(AuthError::InvalidResponse(e.to_string())),
        }
    };

    let success = body.get("success").and_then(Value::as_bool);
    if success == Some(false) || !response.is_success() {
        return Err(AuthError::Rejected(server_message(&body, response.status)));
    }
    if success != Some(true) {
        return Err(AuthError::InvalidResponse(
            "Response carries no success flag".to_string(),
        ));
    }

    match serde_json::from_value::<T>(body.clone()) {
        Ok(payload) => Ok(payload),
        Err(top_level) => match body.get("data") {
            Some(data) => serde_json::from_value(data.clone())
                .map_err(|e| AuthError::InvalidResponse(e.to_string())),
            None => Err(AuthError::InvalidResponse(top_level.to_string())),
        },
    }
}

fn server_message(body: &Value, status: u16) -> String {
    ["message", "error"]
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status))
}
