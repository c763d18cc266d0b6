//! Lockstep Remote - Sync server HTTP client
//!
//! Provides the driven adapter for the `ISyncServerApi` port:
//! - JSON request/response protocol with one `POST` endpoint per operation
//! - Server result codes mapped onto `ApiError` categories
//! - Bearer authentication and per-device identification
//! - Automatic retry of rate-limited (HTTP 429) requests
//!
//! ## Modules
//!
//! - [`client`] - HTTP transport, authentication and 429 handling
//! - [`protocol`] - Wire DTOs, operation names and result codes
//! - [`server`] - `ISyncServerApi` implementation on top of the client

pub mod client;
pub mod protocol;
pub mod server;

pub use client::SyncServerClient;
pub use server::HttpSyncServer;

use lockstep_core::ports::ApiError;
use thiserror::Error;

use protocol::ResultCode;

/// Errors that can occur when talking to the sync server
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The request never produced a response (connect, timeout, body)
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The server answered with a 5xx status
    #[error("Server error ({status}): {body}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// The server answered with an unexpected 4xx status
    #[error("Request rejected ({status}): {body}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// The server kept answering 429 after every retry
    #[error("Too many requests: gave up after {attempts} attempts")]
    TooManyRequests {
        /// Number of requests sent
        attempts: u32,
    },

    /// The server processed the request and reported a failure result code
    #[error("Server result {code}: {details}")]
    Rejected {
        /// Result code from `ServerResult`
        code: ResultCode,
        /// Text from `ServerErrorDetails`
        details: String,
    },

    /// The response could not be parsed or was missing a required field
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The client configuration is unusable (e.g. malformed base URL)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<RemoteError> for ApiError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NetworkError(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                ApiError::NetworkUnavailable(e.to_string())
            }
            RemoteError::NetworkError(e) => ApiError::InvalidResponse(e.to_string()),
            RemoteError::ServerError { status, body } => {
                ApiError::OperationFailed(format!("HTTP {status}: {body}"))
            }
            RemoteError::TooManyRequests { attempts } => {
                ApiError::OperationFailed(format!("rate limited after {attempts} attempts"))
            }
            RemoteError::HttpStatus { status, body } => {
                ApiError::UsageError(format!("HTTP {status}: {body}"))
            }
            RemoteError::Rejected { code, details } => match code {
                ResultCode::LockAlreadyHeld => ApiError::LockAlreadyHeld,
                ResultCode::LockNotHeld => ApiError::LockNotHeld,
                ResultCode::NetworkFailure => ApiError::NetworkUnavailable(details),
                ResultCode::ApiError => ApiError::UsageError(details),
                ResultCode::OperationFailed
                | ResultCode::Ok
                | ResultCode::OperationInProgress
                | ResultCode::Unknown(_) => ApiError::OperationFailed(details),
            },
            RemoteError::InvalidResponse(msg) => ApiError::InvalidResponse(msg),
            RemoteError::InvalidConfig(msg) => ApiError::UsageError(msg),
        }
    }
}
