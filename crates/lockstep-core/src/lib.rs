//! Lockstep Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `LocalFileRecord`, `UploadBatch`, `DownloadOperation`, `Conflict`, `SyncMode`
//! - **Operation Store** - durable per-file records plus upload and download queues
//! - **Port definitions** - Traits for adapters: `ISyncServerApi`, `IStateStore`, `ILocalFileSystem`, `ISyncDelegate`
//! - **Configuration** - YAML-backed settings shared by the binaries
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no I/O.
//! Ports define trait interfaces that adapter crates implement; the engines
//! in `lockstep-sync` drive domain entities through those ports.

pub mod config;
pub mod domain;
pub mod ports;
