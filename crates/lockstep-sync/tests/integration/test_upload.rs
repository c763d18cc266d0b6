//! Upload pipeline: enqueue, commit, send and apply

use lockstep_core::domain::{FileUuid, SyncMode, SyncState};
use lockstep_core::ports::SyncEvent;
use lockstep_sync::{SyncError, TriggerOutcome};

use crate::common::{attrs, method, Harness};

// ============================================================================
// Commit and versions
// ============================================================================

#[tokio::test]
async fn test_first_upload_commits_version_zero() {
    let h = Harness::new().await;
    let uuid = h.upload_new("notes.txt", b"hello world").await;

    let outcome = h.engine.commit().await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Completed);
    let entry = h.server.entry(uuid).expect("file on server");
    assert_eq!(entry.version, 0);
    assert_eq!(entry.remote_name.as_str(), "notes.txt");
    assert_eq!(h.server.content(uuid).unwrap(), b"hello world");
    // 11 bytes in 4-byte blocks
    assert_eq!(h.server.calls(method::UPLOAD_FILE_BLOCK), 3);

    let record = h.engine.local_file_status(uuid).await.unwrap();
    assert_eq!(record.local_version(), Some(0));
    assert_eq!(record.sync_state(), SyncState::Synced);
    assert_eq!(h.engine.mode().await, SyncMode::Idle);
    assert!(!h.server.lock_held());
}

#[tokio::test]
async fn test_versions_increase_by_one_per_commit() {
    let h = Harness::new().await;
    let uuid = h.upload_new("doc.txt", b"one").await;
    h.engine.commit().await.unwrap();

    for (expected, content) in [(1, b"two".as_slice()), (2, b"three".as_slice())] {
        h.engine.upload_data(uuid, content, None).await.unwrap();
        assert_eq!(h.engine.commit().await.unwrap(), TriggerOutcome::Completed);

        assert_eq!(h.server.entry(uuid).unwrap().version, expected);
        assert_eq!(h.local_version(uuid).await, Some(expected));
        assert_eq!(h.server.content(uuid).unwrap(), content);
    }
}

#[tokio::test]
async fn test_index_version_mismatch_is_a_client_error() {
    let h = Harness::new().await;
    let uuid = h.upload_new("doc.txt", b"one").await;
    h.engine.commit().await.unwrap();

    h.engine.upload_data(uuid, b"two", None).await.unwrap();
    // The index read while reconciling is current; the one fetched for
    // the upload already carries another device's version
    h.server.update_after_next(method::GET_FILE_INDEX, uuid);
    let blocks_sent = h.server.calls(method::UPLOAD_FILE_BLOCK);
    let transfers_started = h.server.calls(method::START_OUTBOUND_TRANSFER);

    let outcome = h.engine.commit().await.unwrap();

    assert!(matches!(
        outcome,
        TriggerOutcome::Halted(SyncMode::ClientApiError(_))
    ));
    assert_eq!(h.server.calls(method::UPLOAD_FILE_BLOCK), blocks_sent);
    assert_eq!(h.server.calls(method::START_OUTBOUND_TRANSFER), transfers_started);
    assert_eq!(h.server.entry(uuid).unwrap().version, 1);
    assert_eq!(h.local_version(uuid).await, Some(0));
    let snapshot = h.engine.snapshot().await;
    assert!(snapshot.store.has_active_batch());
    assert!(snapshot.store.has_pending_upload(uuid));
}

#[tokio::test]
async fn test_later_upload_in_same_batch_supersedes_earlier() {
    let h = Harness::new().await;
    let uuid = FileUuid::new();
    h.engine
        .upload_data(uuid, b"draft", Some(attrs("a.txt")))
        .await
        .unwrap();
    h.engine.upload_data(uuid, b"final", None).await.unwrap();

    h.engine.commit().await.unwrap();

    assert_eq!(h.server.content(uuid).unwrap(), b"final");
    assert_eq!(h.server.entry(uuid).unwrap().version, 0);
}

#[tokio::test]
async fn test_batch_with_several_files_reports_all() {
    let h = Harness::new().await;
    let a = h.upload_new("a.txt", b"aaaa").await;
    let b = h.upload_new("b.txt", b"").await;

    h.engine.commit().await.unwrap();

    assert_eq!(h.server.entry(a).unwrap().version, 0);
    assert_eq!(h.server.entry(b).unwrap().size_bytes, 0);
    assert_eq!(
        h.delegate
            .count_events(|e| matches!(e, SyncEvent::SingleUploadComplete { .. })),
        2
    );
    assert!(h
        .delegate
        .events()
        .contains(&SyncEvent::OutboundTransferComplete { files: 2 }));
}

// ============================================================================
// Payload handling
// ============================================================================

#[tokio::test]
async fn test_temporary_payload_removed_after_commit() {
    let h = Harness::new().await;
    let path = h.payload("scratch.bin", b"temporary");
    let uuid = FileUuid::new();
    h.engine
        .upload_temporary_file(uuid, path.clone(), Some(attrs("scratch.bin")))
        .await
        .unwrap();

    h.engine.commit().await.unwrap();

    assert!(!path.exists());
    assert_eq!(h.server.content(uuid).unwrap(), b"temporary");
}

#[tokio::test]
async fn test_immutable_payload_is_kept() {
    let h = Harness::new().await;
    let path = h.payload("photo.jpg", b"jpegdata");
    let uuid = FileUuid::new();
    h.engine
        .upload_immutable_file(uuid, path.clone(), Some(attrs("photo.jpg")))
        .await
        .unwrap();

    h.engine.commit().await.unwrap();

    assert!(path.exists());
    assert_eq!(h.local_version(uuid).await, Some(0));
}

#[tokio::test]
async fn test_upload_data_stages_under_staging_dir() {
    let h = Harness::new().await;
    h.upload_new("a.txt", b"abc").await;

    let staging = h.engine.settings().staging_dir.clone();
    let staged: Vec<_> = std::fs::read_dir(&staging).unwrap().collect();
    assert_eq!(staged.len(), 1);

    h.engine.commit().await.unwrap();
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
}

// ============================================================================
// Enqueue errors
// ============================================================================

#[tokio::test]
async fn test_missing_payload_rejected_on_enqueue() {
    let h = Harness::new().await;
    let missing = h.dir.path().join("nope.txt");

    let err = h
        .engine
        .upload_immutable_file(FileUuid::new(), missing, Some(attrs("nope.txt")))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::ClientUsage(_)));
    assert_eq!(h.engine.mode().await, SyncMode::Idle);
}

#[tokio::test]
async fn test_first_upload_needs_attributes() {
    let h = Harness::new().await;

    let err = h
        .engine
        .upload_data(FileUuid::new(), b"anonymous", None)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::ClientUsage(_)));
    // The staged copy is removed again
    let staging = h.engine.settings().staging_dir.clone();
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
}

#[tokio::test]
async fn test_commit_with_nothing_queued_still_syncs() {
    let h = Harness::new().await;

    assert_eq!(h.engine.commit().await.unwrap(), TriggerOutcome::Completed);
    assert_eq!(h.server.calls(method::START_OUTBOUND_TRANSFER), 0);
    assert_eq!(h.server.calls(method::GET_FILE_INDEX), 1);
}

// ============================================================================
// Deletions
// ============================================================================

#[tokio::test]
async fn test_deletion_marks_file_deleted() {
    let h = Harness::new().await;
    let uuid = h.upload_new("gone.txt", b"bye").await;
    h.engine.commit().await.unwrap();

    h.engine.delete_file(uuid).await.unwrap();
    h.engine.commit().await.unwrap();

    let entry = h.server.entry(uuid).unwrap();
    assert!(entry.deleted);
    assert_eq!(entry.version, 0);
    assert!(h
        .engine
        .local_file_status(uuid)
        .await
        .unwrap()
        .deleted_on_server());
    assert!(h
        .delegate
        .events()
        .contains(&SyncEvent::DeletionsSent { uuids: vec![uuid] }));

    // A deleted file cannot be uploaded again without a conflict resolution
    let err = h.engine.upload_data(uuid, b"again", None).await.unwrap_err();
    assert!(matches!(err, SyncError::ClientUsage(_)));
}

#[tokio::test]
async fn test_deleting_unknown_file_is_rejected() {
    let h = Harness::new().await;

    let err = h.engine.delete_file(FileUuid::new()).await.unwrap_err();

    assert!(matches!(err, SyncError::ClientUsage(_)));
}

#[tokio::test]
async fn test_deleting_unsynced_file_is_rejected() {
    let h = Harness::new().await;
    let uuid = h.upload_new("new.txt", b"x").await;

    let err = h.engine.delete_file(uuid).await.unwrap_err();

    assert!(matches!(err, SyncError::ClientUsage(_)));
}
