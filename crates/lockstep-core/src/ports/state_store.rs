//! State store port (driven/secondary port)
//!
//! Persists the engine snapshot across process restarts.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//! - `save` must be atomic: a crash mid-save leaves the previous snapshot
//!   intact.

use crate::domain::snapshot::EngineSnapshot;

/// Port trait for persisted engine state
#[async_trait::async_trait]
pub trait IStateStore: Send + Sync {
    /// Loads the last saved snapshot
    ///
    /// # Returns
    /// `None` when nothing has been saved yet
    async fn load(&self) -> anyhow::Result<Option<EngineSnapshot>>;

    /// Replaces the saved snapshot
    async fn save(&self, snapshot: &EngineSnapshot) -> anyhow::Result<()>;

    /// Removes all saved state
    async fn clear(&self) -> anyhow::Result<()>;
}
