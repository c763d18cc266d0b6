//! Domain entities and business logic
//!
//! This module contains the core domain types for Lockstep:
//! - Newtypes for type-safe identifiers and validated names
//! - Per-file records and the server file index
//! - Upload and download operations and the Operation Store
//! - The one-shot conflict object and download delivery types
//! - Engine mode and persisted snapshot
//! - Domain-specific error types

pub mod conflict;
pub mod delivery;
pub mod errors;
pub mod file_record;
pub mod index;
pub mod mode;
pub mod newtypes;
pub mod operations;
pub mod snapshot;
pub mod store;

// Re-export commonly used types
pub use conflict::{Conflict, ConflictResolution, ConflictType};
pub use delivery::{Acknowledgement, DeliveredDeletion, DeliveredFile, DownloadDelivery};
pub use errors::DomainError;
pub use file_record::{FileAttributes, LocalFileRecord, SyncState};
pub use index::{find_entry, ServerFileIndexEntry};
pub use mode::SyncMode;
pub use newtypes::*;
pub use operations::{
    DownloadOperation, FileUpload, TransferBlock, UploadBatch, UploadOperation,
    DEFAULT_BLOCK_SIZE,
};
pub use snapshot::{
    DownloadProgress, DownloadStage, EngineSnapshot, RecoveryCounters, TransferResume,
    UploadProgress, UploadStage, SNAPSHOT_SCHEMA_VERSION,
};
pub use store::{CompletedBatch, CompletedPass, OperationQueues, OperationStore};
