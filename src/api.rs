//! HTTP client for the shop backend.
//!
//! Implements [`RemoteDataAccess`] over a small REST surface keyed by
//! collection name and record id. Every request carries the device API key
//! in `X-POS-API-Key`. Failures are mapped onto [`RemoteError`] so the sync
//! engine can tell duplicate-key conflicts and outages apart from real
//! rejections.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::RemoteError;
use crate::models::{EntityKind, ShopData};
use crate::remote::{AuthResponse, RemoteDataAccess};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used for the lightweight health check.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

const API_KEY_HEADER: &str = "X-POS-API-Key";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_backend_url(url: &str) -> String {
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

/// Backend coordinates pasted in as one connection string: either a JSON
/// object `{"url", "key", "shop"}` or the same JSON base64-encoded
/// (standard or URL-safe alphabet, padding optional).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub url: String,
    pub api_key: String,
    pub shop_id: Option<String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Option<Self> {
        let payload = decode_connection_string_payload(raw)?;
        Some(Self {
            url: text_field(&payload, &["url"]).map(|u| normalize_backend_url(&u))?,
            api_key: text_field(&payload, &["key", "apiKey"])?,
            shop_id: text_field(&payload, &["shop", "shopId"]),
        })
    }
}

fn text_field(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a transport-level `reqwest::Error`.
fn transport_error(base: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Timeout(DEFAULT_TIMEOUT.as_secs());
    }
    if err.is_connect() {
        return RemoteError::Unreachable(format!("cannot reach backend at {base}"));
    }
    if err.is_builder() {
        return RemoteError::Encode(format!("invalid backend URL: {base}"));
    }
    RemoteError::Unreachable(format!("network error communicating with {base}: {err}"))
}

/// Map a non-2xx response. Unique-constraint violations are recognised
/// both by status and by the database error text some backends pass
/// through with a 400 or 500.
pub fn classify_failure(status: u16, body: &str) -> RemoteError {
    let message = error_message(body).unwrap_or_else(|| default_message(status));
    let lowered = body.to_ascii_lowercase();

    if status == 409 || lowered.contains("23505") || lowered.contains("duplicate key") {
        return RemoteError::AlreadyExists(message);
    }
    match status {
        401 | 403 => RemoteError::Unauthorized(message),
        408 | 504 => RemoteError::Timeout(DEFAULT_TIMEOUT.as_secs()),
        _ => RemoteError::Rejected { status, message },
    }
}

fn error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Err(_) => Some(trimmed.chars().take(300).collect()),
    }
}

fn default_message(status: u16) -> String {
    match status {
        401 => "API key is invalid or expired".to_string(),
        403 => "Device not authorized".to_string(),
        404 => "Backend endpoint not found".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Encode(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_backend_url(base_url),
            api_key: Zeroizing::new(api_key.trim().to_string()),
        })
    }

    pub fn from_connection_string(raw: &str) -> Result<Self, RemoteError> {
        let parsed = ConnectionString::parse(raw)
            .ok_or_else(|| RemoteError::Encode("unreadable connection string".into()))?;
        Self::new(&parsed.url, &parsed.api_key)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Send one request and return the response body (`Null` when empty).
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        let url = self.url(path);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .header(API_KEY_HEADER, self.api_key.as_str());
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let err = classify_failure(status.as_u16(), &text);
            debug!(
                %method,
                path,
                status = status.as_u16(),
                error = %err,
                "Backend request failed"
            );
            return Err(err);
        }
        if text.trim().is_empty() || status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::InvalidResponse(format!("invalid JSON from backend: {e}")))
    }

    async fn send_for<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, RemoteError> {
        let value = self.send(method, path, body).await?;
        // Some endpoints wrap their payload in `{ "data": ... }`.
        let payload = match value {
            Value::Object(mut map) if map.contains_key("data") => {
                map.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        };
        serde_json::from_value(payload)
            .map_err(|e| RemoteError::InvalidResponse(format!("unexpected response shape: {e}")))
    }
}

#[async_trait]
impl RemoteDataAccess for HttpRemote {
    async fn insert(&self, kind: EntityKind, record: &Value) -> Result<(), RemoteError> {
        let path = format!("/api/{}", kind.collection());
        self.send(Method::POST, &path, Some(record)).await.map(|_| ())
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        changes: &Value,
    ) -> Result<(), RemoteError> {
        let path = format!("/api/{}/{id}", kind.collection());
        self.send(Method::PATCH, &path, Some(changes)).await.map(|_| ())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        let path = format!("/api/{}/{id}", kind.collection());
        match self.send(Method::DELETE, &path, None).await {
            Ok(_) => Ok(()),
            // Already gone is what a delete wants.
            Err(RemoteError::Rejected { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn load_shop_data(&self, shop_id: &str) -> Result<ShopData, RemoteError> {
        let path = format!("/api/shops/{shop_id}/data");
        self.send_for(Method::GET, &path, None).await
    }

    async fn authenticate_user(
        &self,
        identifier: &str,
        secret: &str,
    ) -> Result<AuthResponse, RemoteError> {
        let body = serde_json::json!({
            "identifier": identifier,
            "password": secret,
        });
        self.send_for(Method::POST, "/api/auth/login", Some(&body)).await
    }

    async fn ping(&self) -> bool {
        let result = self
            .client
            .get(self.url("/api/health"))
            .header(API_KEY_HEADER, self.api_key.as_str())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %transport_error(&self.base_url, &e), "Backend health check failed");
                false
            }
        }
    }
}
