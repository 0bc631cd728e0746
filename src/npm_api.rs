//! Nginx Proxy Manager API client.
//!
//! Every logical request goes through [`NpmClient::execute`], a two-level
//! state machine: the outer level counts attempts against the retry budget,
//! the inner level tracks whether the single re-authentication allowed per
//! request has been spent.  Callers interpret status codes; the client only
//! decides whether to try again.
//!
//! | response            | action                                            |
//! |---------------------|---------------------------------------------------|
//! | 2xx, 4xx (not 401)  | returned immediately                              |
//! | 401                 | re-authenticate once, retry in the next slot      |
//! | 5xx, transport fault| back off `B * 2^attempt`, retry until budget ends |

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::config::Config;
use crate::error::ApiError;
use crate::types::{HostUpdate, ProxyHost, ProxyHostPayload};

const TOKENS_PATH: &str = "/tokens";
const PROXY_HOSTS_PATH: &str = "/nginx/proxy-hosts";

/// Typed CRUD over proxy hosts.  Implemented by [`NpmClient`]; the
/// reconciler only depends on this trait.
#[async_trait]
pub trait ProxyHostApi: Send + Sync {
    /// Exchange the stored credentials for a bearer token.  Returns `false`
    /// on any failure.
    async fn authenticate(&self) -> bool;

    /// All proxy hosts, or `None` when the list could not be fetched.
    async fn list_hosts(&self) -> Option<Vec<ProxyHost>>;

    /// Id assigned to the new host, or `None` on failure.
    async fn create_host(&self, host: &ProxyHostPayload) -> Option<u64>;

    async fn update_host(&self, id: u64, update: &HostUpdate) -> bool;

    async fn delete_host(&self, id: u64) -> bool;
}

/// Attempt budget and timing for every logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait after the zero-based `attempt` failed: `base_delay * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    /// Regular call carrying the bearer token; a 401 may trigger re-login.
    Bearer,
    /// The login call itself; never re-authenticates.
    Credentials,
}

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

#[derive(Deserialize)]
struct CreatedHost {
    id: u64,
}

pub struct NpmClient {
    http: Client,
    base_url: String,
    email: String,
    password: String,
    policy: RetryPolicy,
    token: RwLock<Option<String>>,
}

impl NpmClient {
    pub fn new(
        base_url: &str,
        email: &str,
        password: &str,
        policy: RetryPolicy,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ApiError::Client)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            email: email.to_string(),
            password: password.to_string(),
            policy: RetryPolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
            token: RwLock::new(None),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ApiError> {
        Self::new(
            &cfg.npm_api_url,
            &cfg.npm_api_email,
            &cfg.npm_api_password,
            RetryPolicy {
                max_attempts: cfg.max_retries,
                base_delay: Duration::from_secs(cfg.retry_delay),
                request_timeout: Duration::from_secs(cfg.request_timeout),
            },
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// One HTTP exchange, no retries.
    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        mode: AuthMode,
    ) -> Result<ApiResponse, ApiError> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .timeout(self.policy.request_timeout);

        if mode == AuthMode::Bearer {
            let token = self.token.read().await.clone();
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
        }

        match (mode, body) {
            (AuthMode::Credentials, Some(body)) => {
                debug!("API request: {} {} body=[REDACTED]", method, url);
                request = request.json(body);
            }
            (AuthMode::Bearer, Some(body)) => {
                debug!("API request: {} {} body={}", method, url, body);
                request = request.json(body);
            }
            (_, None) => debug!("API request: {} {}", method, url),
        }

        let transport = |source| ApiError::Transport {
            url: url.to_string(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        debug!("API response: {} {} -> {}", method, url, status);

        Ok(ApiResponse { status, body })
    }

    /// Run one logical request through the retry state machine.
    ///
    /// `None` means no definitive response was obtained; it is distinct from
    /// an error status, which is returned as-is.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        mode: AuthMode,
    ) -> Option<ApiResponse> {
        let url = self.url(path);
        let max_attempts = self.policy.max_attempts;
        let mut reauthenticated = false;
        let mut last_response = None;
        let mut attempt = 0;

        while attempt < max_attempts {
            let has_next = attempt + 1 < max_attempts;

            match self.send_once(&method, &url, body, mode).await {
                Ok(response) if response.status == StatusCode::UNAUTHORIZED => {
                    if mode == AuthMode::Bearer && has_next && !reauthenticated {
                        warn!("Token rejected for {} {}, logging in again", method, url);
                        reauthenticated = true;
                        if ProxyHostApi::authenticate(self).await {
                            info!("Re-authenticated, retrying {} {}", method, url);
                            attempt += 1;
                            continue;
                        }
                        error!("Re-authentication failed, giving up on {} {}", method, url);
                    }
                    return Some(response);
                }
                Ok(response) if response.status.is_server_error() => {
                    warn!(
                        "{} {} returned {} (attempt {}/{})",
                        method,
                        url,
                        response.status,
                        attempt + 1,
                        max_attempts
                    );
                    last_response = Some(response);
                }
                Ok(response) => return Some(response),
                Err(e) => {
                    warn!(
                        "API request failed (attempt {}/{}): {}",
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    last_response = None;
                }
            }

            if has_next {
                let delay = self.policy.backoff(attempt);
                info!(
                    "Retrying {} {} in {:?} ({}/{})",
                    method,
                    url,
                    delay,
                    attempt + 2,
                    max_attempts
                );
                sleep(delay).await;
            }
            attempt += 1;
        }

        match &last_response {
            Some(response) => error!(
                "{} {} still failing after {} attempts: {}",
                method, url, max_attempts, response.status
            ),
            None => error!(
                "{} {} got no response after {} attempts",
                method, url, max_attempts
            ),
        }
        last_response
    }
}

#[async_trait]
impl ProxyHostApi for NpmClient {
    async fn authenticate(&self) -> bool {
        let body = json!({
            "identity": self.email,
            "secret": self.password,
        });

        let response = match self
            .execute(Method::POST, TOKENS_PATH, Some(&body), AuthMode::Credentials)
            .await
        {
            Some(response) => response,
            None => {
                error!("NPM login failed: no response from {}", self.base_url);
                return false;
            }
        };

        if !response.status.is_success() {
            error!("NPM login failed: status {}", response.status);
            log_api_errors(&response);
            return false;
        }

        match response.json::<TokenResponse>() {
            Ok(TokenResponse { token: Some(token) }) if !token.is_empty() => {
                *self.token.write().await = Some(token);
                info!("Logged in to Nginx Proxy Manager at {}", self.base_url);
                true
            }
            Ok(_) => {
                error!("NPM login response did not contain a token");
                false
            }
            Err(e) => {
                error!("NPM login response could not be decoded: {}", e);
                false
            }
        }
    }

    async fn list_hosts(&self) -> Option<Vec<ProxyHost>> {
        let response = match self
            .execute(Method::GET, PROXY_HOSTS_PATH, None, AuthMode::Bearer)
            .await
        {
            Some(response) => response,
            None => {
                error!("Failed to fetch proxy hosts: no response");
                return None;
            }
        };

        if response.status != StatusCode::OK {
            error!("Failed to fetch proxy hosts: status {}", response.status);
            log_api_errors(&response);
            return None;
        }

        let entries: Vec<Value> = match response.json() {
            Ok(entries) => entries,
            Err(e) => {
                error!("Proxy host list could not be decoded: {}", e);
                return None;
            }
        };

        let hosts: Vec<ProxyHost> = entries
            .into_iter()
            .filter_map(|entry| match ProxyHost::from_remote(&entry) {
                Ok(host) => Some(host),
                Err(e) => {
                    warn!("Skipping unreadable proxy host entry: {}", e);
                    None
                }
            })
            .collect();

        info!("Fetched {} proxy hosts", hosts.len());
        Some(hosts)
    }

    async fn create_host(&self, host: &ProxyHostPayload) -> Option<u64> {
        let domain = host
            .domain_names
            .first()
            .map(String::as_str)
            .unwrap_or("<none>");
        let body = match serde_json::to_value(host) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode proxy host {}: {}", domain, e);
                return None;
            }
        };

        info!("Creating proxy host {}", domain);
        let response = match self
            .execute(Method::POST, PROXY_HOSTS_PATH, Some(&body), AuthMode::Bearer)
            .await
        {
            Some(response) => response,
            None => {
                error!("Failed to create proxy host {}: no response from API", domain);
                debug!("Request data: {}", body);
                return None;
            }
        };

        if response.status != StatusCode::CREATED {
            error!(
                "Failed to create proxy host {}: status {}",
                domain, response.status
            );
            log_api_errors(&response);
            debug!("Request data: {}", body);
            return None;
        }

        match response.json::<CreatedHost>() {
            Ok(created) => {
                info!("Created proxy host {} (ID {})", domain, created.id);
                Some(created.id)
            }
            Err(e) => {
                error!("Create response for {} carried no host id: {}", domain, e);
                None
            }
        }
    }

    async fn update_host(&self, id: u64, update: &HostUpdate) -> bool {
        let body = match serde_json::to_value(update) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode update for proxy host {}: {}", id, e);
                return false;
            }
        };

        let path = format!("{}/{}", PROXY_HOSTS_PATH, id);
        match self
            .execute(Method::PUT, &path, Some(&body), AuthMode::Bearer)
            .await
        {
            Some(response) if response.status == StatusCode::OK => {
                info!("Updated proxy host ID {}", id);
                true
            }
            Some(response) => {
                error!(
                    "Failed to update proxy host ID {}: status {}",
                    id, response.status
                );
                log_api_errors(&response);
                false
            }
            None => {
                error!(
                    "Failed to update proxy host ID {}: no response (network error?)",
                    id
                );
                false
            }
        }
    }

    async fn delete_host(&self, id: u64) -> bool {
        let path = format!("{}/{}", PROXY_HOSTS_PATH, id);
        match self
            .execute(Method::DELETE, &path, None, AuthMode::Bearer)
            .await
        {
            Some(response) if response.status == StatusCode::OK => {
                info!("Deleted proxy host ID {}", id);
                true
            }
            Some(response) => {
                error!(
                    "Failed to delete proxy host ID {}: status {}",
                    id, response.status
                );
                log_api_errors(&response);
                false
            }
            None => {
                error!("Failed to delete proxy host ID {}: no response", id);
                false
            }
        }
    }
}

fn log_api_errors(response: &ApiResponse) {
    for message in error_messages(&response.body) {
        error!("{}", message);
    }
}

/// Human-readable lines for an error body.
///
/// NPM answers validation failures either with
/// `{"error": {"message": .., "errors": [{"field": .., "message": ..}]}}`
/// or with a bare list of `{"message": ..}` items.  Each field-level
/// problem gets its own line.
pub fn error_messages(body: &str) -> Vec<String> {
    let parsed: Value = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) if body.trim().is_empty() => return Vec::new(),
        Err(_) => return vec![format!("Response body: {}", body)],
    };

    let mut messages = Vec::new();
    match &parsed {
        Value::Object(map) => {
            let error = map.get("error");
            let general = map
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.and_then(|e| e.get("message")).and_then(Value::as_str))
                .or_else(|| error.and_then(Value::as_str));
            if let Some(message) = general {
                messages.push(format!("API error message: {}", message));
            }
            if let Some(Value::Array(errors)) = error.and_then(|e| e.get("errors")) {
                messages.extend(errors.iter().filter_map(field_message));
            }
            if messages.is_empty() {
                messages.push(format!("API error response: {}", parsed));
            }
        }
        Value::Array(items) => {
            for item in items {
                messages.push(
                    field_message(item).unwrap_or_else(|| format!("API error item: {}", item)),
                );
            }
        }
        other => messages.push(format!("API error response: {}", other)),
    }
    messages
}

fn field_message(item: &Value) -> Option<String> {
    let message = item.get("message")?.as_str()?;
    Some(match item.get("field").and_then(Value::as_str) {
        Some(field) => format!("field '{}': {}", field, message),
        None => format!("Validation error: {}", message),
    })
}
