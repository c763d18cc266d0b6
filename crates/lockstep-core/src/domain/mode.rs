//! Engine operating mode
//!
//! The mode is persisted with every state change. A process that starts in
//! `Synchronizing` was interrupted mid-cycle and must recover rather than
//! begin a fresh idle cycle.

use serde::{Deserialize, Serialize};

/// Operating mode of the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "detail", rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Idle,
    Synchronizing,
    /// Network is unreachable; the next trigger resumes where this stopped
    NetworkNotConnected,
    /// The caller misused the API; a local-only reset is required
    ClientApiError(String),
    /// A retry budget was exhausted; `reset_from_error` is required
    NonRecoverableError(String),
    /// A protocol invariant was violated; `reset_from_error` is required
    InternalError(String),
}

impl SyncMode {
    /// True for the three modes that carry an error detail
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SyncMode::ClientApiError(_) | SyncMode::NonRecoverableError(_) | SyncMode::InternalError(_)
        )
    }

    /// True if no sync may run until the caller resets the engine
    pub fn requires_reset(&self) -> bool {
        self.is_error()
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            SyncMode::ClientApiError(d)
            | SyncMode::NonRecoverableError(d)
            | SyncMode::InternalError(d) => Some(d),
            _ => None,
        }
    }

    /// Short machine-readable name, used for storage and status output
    pub fn name(&self) -> &'static str {
        match self {
            SyncMode::Idle => "idle",
            SyncMode::Synchronizing => "synchronizing",
            SyncMode::NetworkNotConnected => "network_not_connected",
            SyncMode::ClientApiError(_) => "client_api_error",
            SyncMode::NonRecoverableError(_) => "non_recoverable_error",
            SyncMode::InternalError(_) => "internal_error",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}: {}", self.name(), detail),
            None => write!(f, "{}", self.name()),
        }
    }
}
