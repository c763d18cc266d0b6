//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`ISyncServerApi`] - The sync server's request/response API
//! - [`IStateStore`] - Persistent storage for the engine snapshot
//! - [`ILocalFileSystem`] - Block and whole-file I/O on local files
//! - [`ISyncDelegate`] - Progress events and download delivery to the host

pub mod local_filesystem;
pub mod state_store;
pub mod sync_delegate;
pub mod sync_server;

pub use local_filesystem::ILocalFileSystem;
pub use state_store::IStateStore;
pub use sync_delegate::{ISyncDelegate, NullDelegate, SyncEvent};
pub use sync_server::{
    ApiError, DownloadBlock, FileToDelete, ISyncServerApi, OperationStatus, OperationStatusCode,
    UploadBlock, UploadRecoveryResult,
};
