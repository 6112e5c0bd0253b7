//! `HttpClient` over reqwest.
//!
//! `execute` sends once. Retries only happen through `execute_with_retry`
//! and only for transport failures, 429 and 5xx answers. A 401 is handed back
//! untouched: the session layer owns that decision.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy},
};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("smart-check-core/", env!("CARGO_PKG_VERSION"));

fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 429
}

/// Wait before attempt `attempt + 1` (`attempt` counts from 1).
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    if !policy.use_exponential_backoff {
        return policy.base_delay;
    }
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    policy
        .base_delay
        .checked_mul(factor)
        .unwrap_or(policy.max_delay)
        .min(policy.max_delay)
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

fn transport_error(request: &HttpRequest, err: reqwest::Error) -> BridgeError {
    if err.is_timeout() {
        BridgeError::Timeout(format!("{} {} timed out", request.method, request.url))
    } else if err.is_connect() {
        BridgeError::OperationFailed(format!("Connection failed: {}", err))
    } else {
        BridgeError::OperationFailed(err.to_string())
    }
}

/// Desktop HTTP client with a shared connection pool.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT).unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default reqwest client");
            Self::with_client(Client::new())
        })
    }

    /// Client whose requests time out after `timeout` unless the request
    /// carries its own.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                BridgeError::NotAvailable(format!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn build_request(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let response = self
            .build_request(request)
            .send()
            .await
            .map_err(|e| transport_error(request, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(request, e))?;

        debug!(method = %request.method, status, "HTTP response received");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.send_once(&request).await
    }

    async fn execute_with_retry(
        &self,
        request: HttpRequest,
        policy: RetryPolicy,
    ) -> Result<HttpResponse> {
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = self.send_once(&request).await;
            let retry = match &outcome {
                Ok(response) => is_retryable_status(response.status),
                Err(e) => !matches!(e, BridgeError::NotAvailable(_)),
            };
            if !retry || attempt >= attempts {
                return outcome;
            }

            match &outcome {
                Ok(response) => warn!(status = response.status, attempt, "Retryable HTTP status"),
                Err(e) => warn!(error = %e, attempt, "HTTP request failed"),
            }
            let delay = backoff_delay(&policy, attempt);
            debug!(delay_ms = delay.as_millis() as u64, "Retrying after delay");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
