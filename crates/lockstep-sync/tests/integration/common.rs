//! Shared test helpers for sync engine integration tests
//!
//! Provides an in-memory sync server with fault injection, a delegate that
//! records events and answers deliveries, and a harness that wires both to a
//! `SyncOrchestrator` backed by an in-memory SQLite state store.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Notify;

use lockstep_cache::{DatabasePool, SqliteStateStore};
use lockstep_core::domain::{
    ConflictResolution, ConflictType, DownloadDelivery, FileAttributes, FileUuid, OperationId,
    RemoteName, ServerFileIndexEntry,
};
use lockstep_core::ports::{
    ApiError, DownloadBlock, FileToDelete, ISyncDelegate, ISyncServerApi, OperationStatus,
    OperationStatusCode, SyncEvent, UploadBlock, UploadRecoveryResult,
};
use lockstep_sync::retry::Backoff;
use lockstep_sync::{LocalFileSystemAdapter, SyncOrchestrator, SyncSettings};

// ============================================================================
// FakeServer
// ============================================================================

/// Server method names used for fault injection and call counting
pub mod method {
    pub const LOCK: &str = "lock";
    pub const UNLOCK: &str = "unlock";
    pub const GET_FILE_INDEX: &str = "get_file_index";
    pub const UPLOAD_FILE_BLOCK: &str = "upload_file_block";
    pub const DELETE_FILES: &str = "delete_files";
    pub const START_OUTBOUND_TRANSFER: &str = "start_outbound_transfer";
    pub const SETUP_INBOUND_TRANSFER: &str = "setup_inbound_transfer";
    pub const START_INBOUND_TRANSFER: &str = "start_inbound_transfer";
    pub const CHECK_OPERATION_STATUS: &str = "check_operation_status";
    pub const REMOVE_OPERATION_ID: &str = "remove_operation_id";
    pub const UPLOAD_RECOVERY: &str = "upload_recovery";
    pub const OUTBOUND_TRANSFER_RECOVERY: &str = "outbound_transfer_recovery";
    pub const CLEANUP: &str = "cleanup";
    pub const GET_OPERATION_ID: &str = "get_operation_id";
    pub const DOWNLOAD_FILE_BLOCK: &str = "download_file_block";
}

#[derive(Debug, Clone)]
struct StoredFile {
    entry: ServerFileIndexEntry,
    content: Vec<u8>,
}

/// An upload sitting in outbound staging
#[derive(Debug, Clone)]
struct StagedUpload {
    version: u32,
    attributes: FileAttributes,
    undelete: bool,
    block_count: u32,
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl StagedUpload {
    fn is_complete(&self) -> bool {
        self.blocks.len() == self.block_count as usize
    }

    fn content(&self) -> Vec<u8> {
        self.blocks.values().flatten().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone)]
struct RunningOperation {
    id: OperationId,
    kind: OperationKind,
    /// Scripted statuses reported before the operation succeeds
    script: VecDeque<OperationStatus>,
    finished: bool,
}

#[derive(Debug, Default)]
struct ServerState {
    files: BTreeMap<FileUuid, StoredFile>,
    lock_held: bool,
    foreign_lock: bool,
    outbound: BTreeMap<FileUuid, StagedUpload>,
    outbound_deletions: Vec<FileToDelete>,
    inbound: Vec<FileUuid>,
    operation: Option<RunningOperation>,
    next_operation: u32,
    /// Statuses the next started operation reports before succeeding
    next_script: VecDeque<OperationStatus>,
    /// Errors returned before the call has any effect
    failures: HashMap<&'static str, VecDeque<ApiError>>,
    /// Errors returned after the call took effect (lost responses)
    lost_responses: HashMap<&'static str, VecDeque<ApiError>>,
    /// Files another device updates right after the call returns
    updates_after: HashMap<&'static str, VecDeque<FileUuid>>,
    calls: HashMap<&'static str, u32>,
}

impl ServerState {
    fn require_lock(&self) -> Result<(), ApiError> {
        if self.lock_held {
            Ok(())
        } else {
            Err(ApiError::LockNotHeld)
        }
    }

    fn index(&self) -> Vec<ServerFileIndexEntry> {
        self.files.values().map(|f| f.entry.clone()).collect()
    }

    /// Bumps the version of `uuid` as another device's write would
    fn concurrent_update(&mut self, uuid: FileUuid) {
        if let Some(file) = self.files.get_mut(&uuid) {
            file.entry.version += 1;
            file.content = b"concurrent".to_vec();
            file.entry.size_bytes = file.content.len() as u64;
        }
    }

    /// Applies outbound staging to the stored files
    fn commit_outbound(&mut self) {
        for delete in std::mem::take(&mut self.outbound_deletions) {
            if let Some(file) = self.files.get_mut(&delete.uuid) {
                file.entry.deleted = true;
            }
        }
        for (uuid, staged) in std::mem::take(&mut self.outbound) {
            let content = staged.content();
            let entry = ServerFileIndexEntry {
                uuid,
                version: staged.version,
                remote_name: staged.attributes.remote_name.clone(),
                mime_type: staged.attributes.mime_type.clone(),
                app_file_type: staged.attributes.app_file_type.clone(),
                deleted: false,
                size_bytes: content.len() as u64,
            };
            self.files.insert(uuid, StoredFile { entry, content });
        }
    }
}

/// In-memory sync server for one account
///
/// Models the exclusive lock, outbound and inbound staging, and long-running
/// transfer operations that release the lock when they succeed.
#[derive(Debug, Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
    stall_after: Mutex<Option<&'static str>>,
    stalled: Notify,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    /// Counts the call and returns an injected failure, if any
    fn enter(&self, name: &'static str) -> Result<(), ApiError> {
        let mut state = self.state();
        *state.calls.entry(name).or_default() += 1;
        match state.failures.get_mut(name).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Replaces a successful result with an injected lost response, if any
    fn leave<T>(&self, name: &'static str, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if result.is_err() {
            return result;
        }
        let lost = {
            let mut state = self.state();
            if let Some(uuid) = state.updates_after.get_mut(name).and_then(VecDeque::pop_front) {
                state.concurrent_update(uuid);
            }
            state.lost_responses.get_mut(name).and_then(VecDeque::pop_front)
        };
        match (result, lost) {
            (Ok(_), Some(err)) => Err(err),
            (result, _) => result,
        }
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// The next call of `method` fails with `err` without taking effect
    pub fn fail_next(&self, method: &'static str, err: ApiError) {
        self.state()
            .failures
            .entry(method)
            .or_default()
            .push_back(err);
    }

    /// The next `times` calls of `method` fail with `err`
    pub fn fail_times(&self, method: &'static str, err: ApiError, times: usize) {
        for _ in 0..times {
            self.fail_next(method, err.clone());
        }
    }

    /// The next call of `method` takes effect but its response is lost
    pub fn lose_next_response(&self, method: &'static str, err: ApiError) {
        self.state()
            .lost_responses
            .entry(method)
            .or_default()
            .push_back(err);
    }

    /// Right after the next successful call of `method`, another device
    /// writes a new version of `uuid` regardless of the lock
    pub fn update_after_next(&self, method: &'static str, uuid: FileUuid) {
        self.state()
            .updates_after
            .entry(method)
            .or_default()
            .push_back(uuid);
    }

    /// The next call of `method` takes effect and then never returns
    pub fn stall_after(&self, method: &'static str) {
        *self.stall_after.lock().unwrap() = Some(method);
    }

    /// Resolves once a call stalled by [`FakeServer::stall_after`]
    pub async fn wait_until_stalled(&self) {
        self.stalled.notified().await;
    }

    async fn checkpoint(&self, name: &'static str) {
        let stall = {
            let mut target = self.stall_after.lock().unwrap();
            if *target == Some(name) {
                target.take();
                true
            } else {
                false
            }
        };
        if stall {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }
    }

    /// The next started operation reports `statuses` before it succeeds
    pub fn script_next_operation(&self, statuses: Vec<OperationStatus>) {
        self.state().next_script = statuses.into();
    }

    // ------------------------------------------------------------------
    // Another device
    // ------------------------------------------------------------------

    /// Another device holds (or releases) the account lock
    pub fn set_foreign_lock(&self, held: bool) {
        self.state().foreign_lock = held;
    }

    /// Another device creates or updates a file, returning its new version
    pub fn remote_put(&self, uuid: FileUuid, name: &str, content: &[u8]) -> u32 {
        let mut state = self.state();
        let version = state
            .files
            .get(&uuid)
            .map_or(0, |f| f.entry.version + 1);
        let entry = ServerFileIndexEntry {
            uuid,
            version,
            remote_name: RemoteName::new(name).unwrap(),
            mime_type: "text/plain".to_string(),
            app_file_type: None,
            deleted: false,
            size_bytes: content.len() as u64,
        };
        state.files.insert(
            uuid,
            StoredFile {
                entry,
                content: content.to_vec(),
            },
        );
        version
    }

    /// Another device deletes a file
    pub fn remote_delete(&self, uuid: FileUuid) {
        if let Some(file) = self.state().files.get_mut(&uuid) {
            file.entry.deleted = true;
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn calls(&self, method: &'static str) -> u32 {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    pub fn lock_held(&self) -> bool {
        self.state().lock_held
    }

    pub fn entry(&self, uuid: FileUuid) -> Option<ServerFileIndexEntry> {
        self.state().files.get(&uuid).map(|f| f.entry.clone())
    }

    pub fn content(&self, uuid: FileUuid) -> Option<Vec<u8>> {
        self.state().files.get(&uuid).map(|f| f.content.clone())
    }

    pub fn has_operation(&self) -> bool {
        self.state().operation.is_some()
    }
}

#[async_trait::async_trait]
impl ISyncServerApi for FakeServer {
    async fn lock(&self) -> Result<(), ApiError> {
        self.enter(method::LOCK)?;
        let result = {
            let mut state = self.state();
            if state.foreign_lock {
                Err(ApiError::LockAlreadyHeld)
            } else {
                state.lock_held = true;
                Ok(())
            }
        };
        self.leave(method::LOCK, result)
    }

    async fn unlock(&self) -> Result<(), ApiError> {
        self.enter(method::UNLOCK)?;
        let result = {
            let mut state = self.state();
            state.require_lock().map(|()| state.lock_held = false)
        };
        self.leave(method::UNLOCK, result)
    }

    async fn get_file_index(&self) -> Result<Vec<ServerFileIndexEntry>, ApiError> {
        self.enter(method::GET_FILE_INDEX)?;
        let result = {
            let state = self.state();
            state.require_lock().map(|()| state.index())
        };
        self.leave(method::GET_FILE_INDEX, result)
    }

    async fn upload_file_block(&self, block: UploadBlock) -> Result<(), ApiError> {
        self.enter(method::UPLOAD_FILE_BLOCK)?;
        let result = {
            let mut state = self.state();
            state.require_lock().and_then(|()| {
                let expected = state
                    .files
                    .get(&block.uuid)
                    .map_or(0, |f| f.entry.version + 1);
                if block.version != expected {
                    return Err(ApiError::UsageError(format!(
                        "upload of {} at version {} but the server expects {}",
                        block.uuid, block.version, expected
                    )));
                }
                if state
                    .files
                    .get(&block.uuid)
                    .is_some_and(|f| f.entry.deleted && !block.undelete)
                {
                    return Err(ApiError::UsageError(format!(
                        "{} is deleted",
                        block.uuid
                    )));
                }
                let staged = state.outbound.entry(block.uuid).or_insert_with(|| StagedUpload {
                    version: block.version,
                    attributes: block.attributes.clone(),
                    undelete: block.undelete,
                    block_count: block.block_count,
                    blocks: BTreeMap::new(),
                });
                staged.blocks.insert(block.block_index, block.data);
                Ok(())
            })
        };
        self.leave(method::UPLOAD_FILE_BLOCK, result)
    }

    async fn delete_files(&self, files: &[FileToDelete]) -> Result<(), ApiError> {
        self.enter(method::DELETE_FILES)?;
        let result = {
            let mut state = self.state();
            state.require_lock().map(|()| {
                state.outbound_deletions.extend_from_slice(files);
            })
        };
        self.leave(method::DELETE_FILES, result)
    }

    async fn start_outbound_transfer(&self) -> Result<OperationId, ApiError> {
        self.enter(method::START_OUTBOUND_TRANSFER)?;
        let result = {
            let mut state = self.state();
            state.require_lock().and_then(|()| {
                if state.outbound.values().any(|s| !s.is_complete()) {
                    return Err(ApiError::UsageError("outbound staging incomplete".into()));
                }
                state.next_operation += 1;
                let id = OperationId::new(format!("out-{}", state.next_operation)).unwrap();
                let script = std::mem::take(&mut state.next_script);
                state.operation = Some(RunningOperation {
                    id: id.clone(),
                    kind: OperationKind::Outbound,
                    script,
                    finished: false,
                });
                Ok(id)
            })
        };
        self.checkpoint(method::START_OUTBOUND_TRANSFER).await;
        self.leave(method::START_OUTBOUND_TRANSFER, result)
    }

    async fn setup_inbound_transfer(&self, files: &[FileUuid]) -> Result<(), ApiError> {
        self.enter(method::SETUP_INBOUND_TRANSFER)?;
        let result = {
            let mut state = self.state();
            state.require_lock().map(|()| state.inbound = files.to_vec())
        };
        self.leave(method::SETUP_INBOUND_TRANSFER, result)
    }

    async fn start_inbound_transfer(&self) -> Result<OperationId, ApiError> {
        self.enter(method::START_INBOUND_TRANSFER)?;
        let result = {
            let mut state = self.state();
            state.require_lock().map(|()| {
                state.next_operation += 1;
                let id = OperationId::new(format!("in-{}", state.next_operation)).unwrap();
                let script = std::mem::take(&mut state.next_script);
                state.operation = Some(RunningOperation {
                    id: id.clone(),
                    kind: OperationKind::Inbound,
                    script,
                    finished: false,
                });
                id
            })
        };
        self.leave(method::START_INBOUND_TRANSFER, result)
    }

    async fn check_operation_status(
        &self,
        operation_id: &OperationId,
    ) -> Result<OperationStatus, ApiError> {
        self.enter(method::CHECK_OPERATION_STATUS)?;
        let result = {
            let mut state = self.state();
            match state.operation.as_mut() {
                Some(op) if op.id == *operation_id => {
                    let kind = op.kind;
                    match op.script.pop_front() {
                        Some(status) => {
                            // A failure that processed no files ends the operation
                            if status.code.is_failure() && status.count == 0 {
                                state.operation = None;
                            }
                            Ok(status)
                        }
                        None => {
                            let first_success = !op.finished;
                            op.finished = true;
                            if first_success {
                                if kind == OperationKind::Outbound {
                                    state.commit_outbound();
                                }
                                state.lock_held = false;
                            }
                            Ok(OperationStatus::new(OperationStatusCode::Succeeded))
                        }
                    }
                }
                _ => Err(ApiError::UsageError(format!(
                    "unknown operation {operation_id}"
                ))),
            }
        };
        self.leave(method::CHECK_OPERATION_STATUS, result)
    }

    async fn remove_operation_id(&self) -> Result<(), ApiError> {
        self.enter(method::REMOVE_OPERATION_ID)?;
        self.state().operation = None;
        self.leave(method::REMOVE_OPERATION_ID, Ok(()))
    }

    async fn upload_recovery(&self) -> Result<UploadRecoveryResult, ApiError> {
        self.enter(method::UPLOAD_RECOVERY)?;
        let result = {
            let state = self.state();
            state.require_lock().map(|()| {
                let operation_id = state
                    .operation
                    .as_ref()
                    .filter(|op| op.kind == OperationKind::Outbound)
                    .map(|op| op.id.clone());
                let uploaded = state
                    .outbound
                    .iter()
                    .filter(|(_, staged)| staged.is_complete())
                    .map(|(uuid, staged)| ServerFileIndexEntry {
                        uuid: *uuid,
                        version: staged.version,
                        remote_name: staged.attributes.remote_name.clone(),
                        mime_type: staged.attributes.mime_type.clone(),
                        app_file_type: staged.attributes.app_file_type.clone(),
                        deleted: false,
                        size_bytes: staged.content().len() as u64,
                    })
                    .collect();
                UploadRecoveryResult {
                    operation_id,
                    uploaded: Some(uploaded),
                }
            })
        };
        self.leave(method::UPLOAD_RECOVERY, result)
    }

    async fn outbound_transfer_recovery(&self) -> Result<(), ApiError> {
        self.enter(method::OUTBOUND_TRANSFER_RECOVERY)?;
        let result = {
            let state = self.state();
            state.require_lock()
        };
        self.leave(method::OUTBOUND_TRANSFER_RECOVERY, result)
    }

    async fn cleanup(&self) -> Result<(), ApiError> {
        self.enter(method::CLEANUP)?;
        {
            let mut state = self.state();
            state.outbound.clear();
            state.outbound_deletions.clear();
            state.inbound.clear();
            state.operation = None;
            state.lock_held = false;
        }
        self.leave(method::CLEANUP, Ok(()))
    }

    async fn get_operation_id(&self) -> Result<Option<OperationId>, ApiError> {
        self.enter(method::GET_OPERATION_ID)?;
        let id = self.state().operation.as_ref().map(|op| op.id.clone());
        self.leave(method::GET_OPERATION_ID, Ok(id))
    }

    async fn download_file_block(&self, block: DownloadBlock) -> Result<Vec<u8>, ApiError> {
        self.enter(method::DOWNLOAD_FILE_BLOCK)?;
        let result = {
            let state = self.state();
            match state.files.get(&block.uuid) {
                Some(file) if file.entry.version == block.version => {
                    let start = (block.offset as usize).min(file.content.len());
                    let end = (start + block.length as usize).min(file.content.len());
                    Ok(file.content[start..end].to_vec())
                }
                _ => Err(ApiError::UsageError(format!(
                    "{} v{} is not staged",
                    block.uuid, block.version
                ))),
            }
        };
        self.leave(method::DOWNLOAD_FILE_BLOCK, result)
    }
}

// ============================================================================
// RecordingDelegate
// ============================================================================

/// How the delegate answers a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryBehavior {
    /// Acknowledge everything and resolve conflicts with the resolution
    Accept(ConflictResolution),
    /// Take the delivery and drop every handle unanswered
    Drop,
    /// Resolve conflicts with the resolution and acknowledge everything
    /// except the last download
    Partial(ConflictResolution),
    /// Acknowledge every file and deletion but leave conflicts unresolved
    Unresolved,
    /// Refuse the delivery
    Reject,
}

/// One delivery as the host saw it
#[derive(Debug, Clone, Default)]
pub struct ReceivedDelivery {
    /// (uuid, version, content read from the staged path)
    pub files: Vec<(FileUuid, u32, Vec<u8>)>,
    pub deletions: Vec<FileUuid>,
    pub conflicts: Vec<(FileUuid, ConflictType)>,
}

#[derive(Debug)]
pub struct RecordingDelegate {
    events: Mutex<Vec<SyncEvent>>,
    behavior: Mutex<DeliveryBehavior>,
    deliveries: Mutex<Vec<ReceivedDelivery>>,
    hold: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            behavior: Mutex::new(DeliveryBehavior::Accept(
                ConflictResolution::KeepConflictingClientOperations,
            )),
            deliveries: Mutex::new(Vec::new()),
            hold: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    /// The next delivery waits for [`RecordingDelegate::release`]
    pub fn hold_next_delivery(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub async fn wait_until_delivering(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn set_behavior(&self, behavior: DeliveryBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_events(&self, predicate: impl Fn(&SyncEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    pub fn deliveries(&self) -> Vec<ReceivedDelivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ISyncDelegate for RecordingDelegate {
    fn on_event(&self, event: SyncEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn deliver(&self, delivery: DownloadDelivery) -> anyhow::Result<()> {
        if self.hold.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }

        let behavior = *self.behavior.lock().unwrap();
        if behavior == DeliveryBehavior::Reject {
            anyhow::bail!("host is not ready");
        }

        let mut received = ReceivedDelivery::default();
        for file in &delivery.downloads {
            let content = std::fs::read(&file.path)?;
            received.files.push((file.uuid, file.version, content));
        }
        received.deletions = delivery.deletions.iter().map(|d| d.uuid).collect();
        received.conflicts = delivery
            .conflicts
            .iter()
            .map(|c| (c.uuid(), c.conflict_type()))
            .collect();
        self.deliveries.lock().unwrap().push(received);

        let (resolution, held_back) = match behavior {
            DeliveryBehavior::Accept(resolution) => (Some(resolution), 0),
            DeliveryBehavior::Partial(resolution) => (Some(resolution), 1),
            DeliveryBehavior::Unresolved => (None, 0),
            DeliveryBehavior::Drop | DeliveryBehavior::Reject => return Ok(()),
        };

        if let Some(resolution) = resolution {
            for conflict in &delivery.conflicts {
                conflict.resolve_conflict(resolution)?;
            }
        }
        let acked = delivery.downloads.len().saturating_sub(held_back);
        for file in delivery.downloads.into_iter().take(acked) {
            file.ack.acknowledge();
        }
        for deletion in delivery.deletions {
            deletion.ack.acknowledge();
        }
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub const MAX_ATTEMPTS: u32 = 3;
pub const MAX_POLLS: u32 = 4;

/// Settings with tiny blocks and near-zero delays
pub fn test_settings(staging_dir: PathBuf) -> SyncSettings {
    SyncSettings {
        staging_dir,
        block_size: 4,
        poll_interval: Duration::from_millis(1),
        max_poll_attempts: MAX_POLLS,
        backoff: Backoff::new(MAX_ATTEMPTS, Duration::from_millis(1)),
    }
}

pub fn attrs(name: &str) -> FileAttributes {
    FileAttributes::new(RemoteName::new(name).unwrap(), "text/plain")
}

/// One engine wired to a fake server, a recording delegate and SQLite
pub struct Harness {
    pub server: Arc<FakeServer>,
    pub delegate: Arc<RecordingDelegate>,
    pub state_store: Arc<SqliteStateStore>,
    pub engine: SyncOrchestrator,
    pub dir: TempDir,
    // Keeps the in-memory database alive across reloads
    _pool: DatabasePool,
}

impl Harness {
    pub async fn new() -> Self {
        let pool = DatabasePool::in_memory().await.unwrap();
        let state_store = Arc::new(SqliteStateStore::new(pool.pool().clone()));
        let server = Arc::new(FakeServer::new());
        let delegate = Arc::new(RecordingDelegate::new());
        let dir = TempDir::new().unwrap();

        let engine = Self::build(&server, &delegate, &state_store, &dir).await;
        Self {
            server,
            delegate,
            state_store,
            engine,
            dir,
            _pool: pool,
        }
    }

    async fn build(
        server: &Arc<FakeServer>,
        delegate: &Arc<RecordingDelegate>,
        state_store: &Arc<SqliteStateStore>,
        dir: &TempDir,
    ) -> SyncOrchestrator {
        SyncOrchestrator::load(
            server.clone(),
            state_store.clone(),
            Arc::new(LocalFileSystemAdapter::new()),
            delegate.clone(),
            test_settings(dir.path().join("staging")),
        )
        .await
        .unwrap()
    }

    /// Simulates a process restart: a fresh engine loads the persisted state
    pub async fn restart(&mut self) {
        self.engine = Self::build(&self.server, &self.delegate, &self.state_store, &self.dir).await;
    }

    /// Writes a payload file the test can upload
    pub fn payload(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Queues `content` as a new file without committing it
    pub async fn upload_new(&self, name: &str, content: &[u8]) -> FileUuid {
        let uuid = FileUuid::new();
        self.engine
            .upload_data(uuid, content, Some(attrs(name)))
            .await
            .unwrap();
        uuid
    }

    pub async fn local_version(&self, uuid: FileUuid) -> Option<u32> {
        self.engine
            .local_file_status(uuid)
            .await
            .and_then(|record| record.local_version())
    }
}
