//! Admin dashboard API client.
//!
//! [`PosBackend`] is the seam the sync engine talks through; [`HttpBackend`]
//! is the authenticated reqwest implementation used in production. The
//! split between transport failures and server rejections is decided here.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{
    DirectOrderRequest, OrderRequest, PushRequest, PushResponse, ServerOrder, SyncSnapshot,
};

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight health check.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

const PULL_PATH: &str = "/api/pos/sync/pull";
const PUSH_PATH: &str = "/api/pos/sync/push";
const ORDERS_PATH: &str = "/api/pos/orders";
const HEALTH_PATH: &str = "/api/health";

/// Remote side of the sync engine.
#[async_trait]
pub trait PosBackend: Send + Sync {
    /// Fetch the current reference snapshot. `sync_token` is the cursor from
    /// the previous pull, if any.
    async fn pull(&self, sync_token: Option<&str>) -> Result<SyncSnapshot, SyncError>;

    /// Submit one batch of queued orders and payments.
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, SyncError>;

    /// Create an order directly while online.
    async fn create_order(
        &self,
        temp_id: &str,
        order: &OrderRequest,
    ) -> Result<ServerOrder, SyncError>;

    /// Cheap reachability check. Never errors.
    async fn health(&self) -> bool;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Terminals are provisioned with a single pasted string: either raw JSON or
/// url-safe base64 of JSON carrying `key`, `url` and `tid`.
fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let standard = compact.replace('-', "+").replace('_', "/");
    let padding = (4 - standard.len() % 4) % 4;
    let padded = format!("{standard}{}", "=".repeat(padding));
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key", "apiKey"])
}

pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url", "adminUrl"]).map(|u| normalize_admin_url(&u))
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tid", "terminalId"])
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// A request that never produced an HTTP response.
fn transport_error(url: &str, err: &reqwest::Error) -> SyncError {
    let message = if err.is_connect() {
        format!("Cannot reach admin dashboard at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid admin dashboard URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    SyncError::TransportFailure(message)
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    }
}

/// Gateway errors mean the request stopped at a proxy in front of the
/// dashboard; everything else non-2xx is the dashboard's own answer.
fn is_gateway_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Map a non-2xx response to an error, preferring the server's message.
fn classify_failure(status: StatusCode, body: &str) -> SyncError {
    if is_gateway_status(status) {
        return SyncError::TransportFailure(status_message(status));
    }
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_message(status));
    SyncError::rejection(status.as_u16(), message)
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

pub struct HttpBackend {
    client: Client,
    health_client: Client,
    base_url: String,
    api_key: String,
    terminal_id: String,
}

impl HttpBackend {
    pub fn new(
        admin_url: &str,
        api_key: &str,
        terminal_id: &str,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let base_url = normalize_admin_url(admin_url);
        if base_url.is_empty() {
            return Err(SyncError::NotConfigured("admin dashboard URL".into()));
        }
        let resolved_api_key =
            extract_api_key_from_connection_string(api_key).unwrap_or_else(|| api_key.to_string());

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(client_build_error)?;
        let health_client = Client::builder()
            .timeout(CONNECTIVITY_TIMEOUT.min(timeout))
            .build()
            .map_err(client_build_error)?;

        Ok(Self {
            client,
            health_client,
            base_url,
            api_key: resolved_api_key,
            terminal_id: terminal_id.to_string(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        Self::new(
            &config.admin_url,
            &config.api_key,
            &config.terminal_id,
            config.request_timeout,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        path: &str,
        req: RequestBuilder,
    ) -> Result<T, SyncError> {
        let started = Instant::now();
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        // A body cut off mid-read is indistinguishable from a dropped
        // connection: the server may or may not have committed.
        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        debug!(
            path,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Admin dashboard responded"
        );

        if !status.is_success() {
            let err = classify_failure(status, &body);
            warn!(path, status = status.as_u16(), error = %err, "Admin dashboard request failed");
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| SyncError::InvalidResponse(format!("{path}: {e}")))
    }
}

fn client_build_error(e: reqwest::Error) -> SyncError {
    SyncError::TransportFailure(format!("Failed to create HTTP client: {e}"))
}

#[async_trait]
impl PosBackend for HttpBackend {
    async fn pull(&self, sync_token: Option<&str>) -> Result<SyncSnapshot, SyncError> {
        let url = format!("{}{PULL_PATH}", self.base_url);
        let mut req = self.client.get(url);
        if let Some(token) = sync_token.filter(|t| !t.is_empty()) {
            req = req.query(&[("syncToken", token)]);
        }
        self.send_json(PULL_PATH, req).await
    }

    async fn push(&self, request: &PushRequest) -> Result<PushResponse, SyncError> {
        let url = format!("{}{PUSH_PATH}", self.base_url);
        self.send_json(PUSH_PATH, self.client.post(url).json(request)).await
    }

    async fn create_order(
        &self,
        temp_id: &str,
        order: &OrderRequest,
    ) -> Result<ServerOrder, SyncError> {
        let url = format!("{}{ORDERS_PATH}", self.base_url);
        let body = DirectOrderRequest { temp_id, order };
        let raw: Value = self
            .send_json(ORDERS_PATH, self.client.post(url).json(&body))
            .await?;
        // Some dashboard versions wrap the order in `{ "order": {...} }`.
        let inner = match raw.get("order") {
            Some(order) if order.is_object() => order.clone(),
            _ => raw,
        };
        serde_json::from_value(inner)
            .map_err(|e| SyncError::InvalidResponse(format!("{ORDERS_PATH}: {e}")))
    }

    async fn health(&self) -> bool {
        let url = format!("{}{HEALTH_PATH}", self.base_url);
        let started = Instant::now();
        match self.authorize(self.health_client.get(&url)).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Health check passed"
                );
                true
            }
            Ok(resp) => {
                info!(status = resp.status().as_u16(), "Health check failed");
                false
            }
            Err(e) => {
                debug!("Health check unreachable: {e}");
                false
            }
        }
    }
}
