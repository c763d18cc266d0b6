//! Sync server HTTP client
//!
//! Provides a typed HTTP client for the sync server. Handles endpoint
//! construction, authentication and device headers, JSON decoding and
//! HTTP 429 back-off.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lockstep_remote::client::SyncServerClient;
//! use lockstep_remote::protocol::{op, EmptyRequest};
//!
//! # async fn example() -> Result<(), lockstep_remote::RemoteError> {
//! let client = SyncServerClient::with_base_url("http://localhost:8080/api", "device-1")?;
//! let response = client.call(op::LOCK, &EmptyRequest::default()).await?;
//! assert_eq!(response.result, Some(0));
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use lockstep_core::config::ServerConfig;

use crate::protocol::{ServerResponse, DEVICE_ID_KEY};
use crate::RemoteError;

/// Default retry-after duration when the header is missing or unreadable
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Upper bound on a server-requested back-off
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

// ============================================================================
// SyncServerClient
// ============================================================================

/// HTTP client for sync server calls
///
/// Every request is a `POST` to `{base_url}/{operation}` whose JSON body
/// carries the device id. A bearer token is attached when configured.
#[derive(Clone)]
pub struct SyncServerClient {
    /// The underlying HTTP client
    client: Client,
    /// Base URL, always ending with `/`
    base_url: Url,
    auth_token: Option<String>,
    device_id: String,
    max_retries: u32,
}

impl SyncServerClient {
    /// Creates a client from the `server` configuration section
    ///
    /// # Arguments
    /// * `config` - Server URL, token, timeout and retry settings
    /// * `device_id` - Resolved identity of this device
    ///
    /// # Errors
    /// `RemoteError::InvalidConfig` if the URL does not parse or the HTTP
    /// client cannot be built
    pub fn new(config: &ServerConfig, device_id: impl Into<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RemoteError::InvalidConfig(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: parse_base_url(&config.url)?,
            auth_token: config.auth_token.clone(),
            device_id: device_id.into(),
            max_retries: config.max_retries,
        })
    }

    /// Creates an unauthenticated client with a custom base URL (useful for testing)
    pub fn with_base_url(
        base_url: &str,
        device_id: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        Ok(Self {
            client: Client::new(),
            base_url: parse_base_url(base_url)?,
            auth_token: None,
            device_id: device_id.into(),
            max_retries: 3,
        })
    }

    /// Sets the bearer token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets how many times a 429 response is retried
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Builds a `POST` for `operation` with the device id merged into `body`
    ///
    /// # Errors
    /// `RemoteError::InvalidConfig` if `body` is not a JSON object or the
    /// operation name cannot be joined onto the base URL
    pub fn request<B: Serialize>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<RequestBuilder, RemoteError> {
        let url = self
            .base_url
            .join(operation)
            .map_err(|e| RemoteError::InvalidConfig(format!("bad operation '{operation}': {e}")))?;

        let mut json = serde_json::to_value(body)
            .map_err(|e| RemoteError::InvalidConfig(format!("cannot encode request: {e}")))?;
        let object = json.as_object_mut().ok_or_else(|| {
            RemoteError::InvalidConfig(format!("{operation} body is not a JSON object"))
        })?;
        object.insert(
            DEVICE_ID_KEY.to_string(),
            serde_json::Value::String(self.device_id.clone()),
        );

        let mut request = self.client.post(url).json(&json);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    /// Calls a JSON operation and checks its `ServerResult`
    ///
    /// # Returns
    /// The decoded response; its result code has been checked
    pub async fn call<B: Serialize>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<ServerResponse, RemoteError> {
        let response = self.execute_with_retry(operation, body).await?;
        let parsed: ServerResponse = response.json().await.map_err(|e| {
            RemoteError::InvalidResponse(format!("{operation}: cannot decode response: {e}"))
        })?;
        parsed.check()?;
        debug!(operation, result = ?parsed.result, "Server call succeeded");
        Ok(parsed)
    }

    /// Calls an operation that answers with raw bytes
    ///
    /// A JSON answer is treated as a result-code response, which must then
    /// report a failure.
    pub async fn call_bytes<B: Serialize>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<Vec<u8>, RemoteError> {
        let response = self.execute_with_retry(operation, body).await?;

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        if is_json {
            let parsed: ServerResponse = response.json().await.map_err(|e| {
                RemoteError::InvalidResponse(format!("{operation}: cannot decode response: {e}"))
            })?;
            parsed.check()?;
            return Err(RemoteError::InvalidResponse(format!(
                "{operation}: expected content, got a result code"
            )));
        }

        let bytes = response.bytes().await?;
        debug!(operation, bytes = bytes.len(), "Received content");
        Ok(bytes.to_vec())
    }

    // ========================================================================
    // 429 handling
    // ========================================================================

    /// Sends a request, retrying HTTP 429 responses after `Retry-After`
    ///
    /// Non-429 failures are classified and returned without retry; the
    /// engines decide about retrying those.
    ///
    /// # Returns
    /// The successful (2xx) HTTP response
    pub async fn execute_with_retry<B: Serialize>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<Response, RemoteError> {
        let mut attempt = 0;
        loop {
            let response = self.request(operation, body)?.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= self.max_retries {
                    warn!(operation, attempts = attempt + 1, "429 retry limit exhausted");
                    return Err(RemoteError::TooManyRequests {
                        attempts: attempt + 1,
                    });
                }

                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| parse_retry_after(v, DEFAULT_RETRY_AFTER))
                    .unwrap_or(DEFAULT_RETRY_AFTER);

                info!(
                    operation,
                    attempt,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Received 429, backing off"
                );

                tokio::time::sleep(retry_after).await;
                attempt += 1;
                continue;
            }

            if status.is_server_error() {
                return Err(RemoteError::ServerError {
                    status: status.as_u16(),
                    body: error_body(response).await,
                });
            }

            if !status.is_success() {
                return Err(RemoteError::HttpStatus {
                    status: status.as_u16(),
                    body: error_body(response).await,
                });
            }

            if attempt > 0 {
                info!(operation, attempt, "Request succeeded after retry");
            }
            return Ok(response);
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url, RemoteError> {
    // Without a trailing slash `join` would replace the last path segment
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|e| RemoteError::InvalidConfig(format!("bad server url '{raw}': {e}")))
}

async fn error_body(response: Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// Parses a `Retry-After` header value
///
/// Accepts either delta-seconds or an HTTP date. Dates in the past and
/// delays over an hour fall back to `default`.
pub fn parse_retry_after(value: &str, default: Duration) -> Duration {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Duration::from_secs(seconds).min(MAX_RETRY_AFTER);
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value.trim()) {
        let remaining = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
        if let Ok(remaining) = remaining.to_std() {
            if remaining <= MAX_RETRY_AFTER {
                return remaining;
            }
        }
    }

    warn!(value, "Could not parse Retry-After header, using default");
    default
}
