//! Lockstep Conflict - Reconciliation and conflict resolution
//!
//! Provides:
//! - Reconciliation of the local store against the server file index
//! - Side effects of conflict resolutions on the upload queues
//! - Name-based resolution policy for unattended resolution

pub mod error;
pub mod policy;
pub mod reconcile;
pub mod resolver;

pub use error::ConflictError;
pub use policy::{PolicyDecision, ResolutionPolicy};
pub use reconcile::Reconciler;
pub use resolver::apply_resolution;
