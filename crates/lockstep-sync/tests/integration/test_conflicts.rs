//! Conflicts between a download pass and pending local operations

use lockstep_core::domain::{ConflictResolution, ConflictType, FileUuid};
use lockstep_sync::TriggerOutcome;

use crate::common::{DeliveryBehavior, Harness};

const KEEP: ConflictResolution = ConflictResolution::KeepConflictingClientOperations;
const DROP_LOCAL: ConflictResolution = ConflictResolution::DeleteConflictingClientOperations;

/// Harness with one file committed at version 0
async fn with_synced_file(name: &str) -> (Harness, FileUuid) {
    let h = Harness::new().await;
    let uuid = h.upload_new(name, b"original").await;
    assert_eq!(h.engine.commit().await.unwrap(), TriggerOutcome::Completed);
    (h, uuid)
}

// ============================================================================
// Server deleted, local upload pending
// ============================================================================

#[tokio::test]
async fn test_remote_deletion_with_pending_upload_kept_restores_file() {
    let (h, uuid) = with_synced_file("a.txt").await;
    h.engine.upload_data(uuid, b"local edit", None).await.unwrap();
    h.server.remote_delete(uuid);
    h.delegate.set_behavior(DeliveryBehavior::Accept(KEEP));

    h.engine.trigger_sync().await.unwrap();

    let delivery = h.delegate.deliveries().pop().unwrap();
    assert_eq!(delivery.deletions, vec![uuid]);
    assert_eq!(
        delivery.conflicts,
        vec![(uuid, ConflictType::DownloadDeletionLocalUpload)]
    );
    let record = h.engine.local_file_status(uuid).await.unwrap();
    assert!(record.deleted_on_server());

    // The kept upload restores the file at the next version
    h.engine.commit().await.unwrap();

    let entry = h.server.entry(uuid).unwrap();
    assert!(!entry.deleted);
    assert_eq!(entry.version, 1);
    assert_eq!(h.server.content(uuid).unwrap(), b"local edit");
    let record = h.engine.local_file_status(uuid).await.unwrap();
    assert!(!record.deleted_on_server());
    assert_eq!(record.local_version(), Some(1));
}

#[tokio::test]
async fn test_remote_deletion_with_pending_upload_dropped() {
    let (h, uuid) = with_synced_file("a.txt").await;
    h.engine.upload_data(uuid, b"local edit", None).await.unwrap();
    h.server.remote_delete(uuid);
    h.delegate.set_behavior(DeliveryBehavior::Accept(DROP_LOCAL));

    h.engine.trigger_sync().await.unwrap();

    let snapshot = h.engine.snapshot().await;
    assert!(!snapshot.store.has_pending_upload(uuid));
    assert!(snapshot.store.record(uuid).unwrap().deleted_on_server());

    // Nothing left to send
    h.engine.commit().await.unwrap();
    assert!(h.server.entry(uuid).unwrap().deleted);
}

// ============================================================================
// Server updated, local deletion pending
// ============================================================================

#[tokio::test]
async fn test_remote_update_with_pending_deletion_kept_deletes_new_version() {
    let (h, uuid) = with_synced_file("b.txt").await;
    h.engine.delete_file(uuid).await.unwrap();
    h.server.remote_put(uuid, "b.txt", b"their update");
    h.delegate.set_behavior(DeliveryBehavior::Accept(KEEP));

    h.engine.trigger_sync().await.unwrap();

    let delivery = h.delegate.deliveries().pop().unwrap();
    assert_eq!(
        delivery.conflicts,
        vec![(uuid, ConflictType::DownloadLocalUploadDeletion)]
    );
    assert_eq!(h.local_version(uuid).await, Some(1));
    assert!(h.engine.snapshot().await.store.has_pending_deletion(uuid));

    h.engine.commit().await.unwrap();

    let entry = h.server.entry(uuid).unwrap();
    assert!(entry.deleted);
    assert_eq!(entry.version, 1);
}

#[tokio::test]
async fn test_remote_update_with_pending_deletion_dropped() {
    let (h, uuid) = with_synced_file("b.txt").await;
    h.engine.delete_file(uuid).await.unwrap();
    h.server.remote_put(uuid, "b.txt", b"their update");
    h.delegate.set_behavior(DeliveryBehavior::Accept(DROP_LOCAL));

    h.engine.trigger_sync().await.unwrap();

    assert!(!h.engine.snapshot().await.store.has_pending_deletion(uuid));
    h.engine.commit().await.unwrap();
    assert!(!h.server.entry(uuid).unwrap().deleted);
    assert_eq!(h.local_version(uuid).await, Some(1));
}

// ============================================================================
// Server updated, local upload pending
// ============================================================================

#[tokio::test]
async fn test_remote_update_with_pending_upload_kept_supersedes() {
    let (h, uuid) = with_synced_file("c.txt").await;
    h.engine.upload_data(uuid, b"mine", None).await.unwrap();
    h.server.remote_put(uuid, "c.txt", b"theirs");
    h.delegate.set_behavior(DeliveryBehavior::Accept(KEEP));

    h.engine.trigger_sync().await.unwrap();

    let delivery = h.delegate.deliveries().pop().unwrap();
    assert_eq!(delivery.files, vec![(uuid, 1, b"theirs".to_vec())]);
    assert_eq!(
        delivery.conflicts,
        vec![(uuid, ConflictType::DownloadLocalUpload)]
    );

    h.engine.commit().await.unwrap();

    assert_eq!(h.server.entry(uuid).unwrap().version, 2);
    assert_eq!(h.server.content(uuid).unwrap(), b"mine");
    assert_eq!(h.local_version(uuid).await, Some(2));
}

#[tokio::test]
async fn test_remote_update_with_pending_upload_dropped() {
    let (h, uuid) = with_synced_file("c.txt").await;
    h.engine.upload_data(uuid, b"mine", None).await.unwrap();
    h.server.remote_put(uuid, "c.txt", b"theirs");
    h.delegate.set_behavior(DeliveryBehavior::Accept(DROP_LOCAL));

    h.engine.trigger_sync().await.unwrap();
    h.engine.commit().await.unwrap();

    assert_eq!(h.server.entry(uuid).unwrap().version, 1);
    assert_eq!(h.server.content(uuid).unwrap(), b"theirs");
    assert_eq!(h.local_version(uuid).await, Some(1));
}

// ============================================================================
// Committed batches
// ============================================================================

#[tokio::test]
async fn test_conflict_found_for_committed_batch() {
    let (h, uuid) = with_synced_file("d.txt").await;
    h.engine.upload_data(uuid, b"queued", None).await.unwrap();
    h.server.remote_put(uuid, "d.txt", b"theirs");
    h.delegate.set_behavior(DeliveryBehavior::Accept(KEEP));

    // Reconciliation runs before the committed batch is promoted
    assert_eq!(h.engine.commit().await.unwrap(), TriggerOutcome::Completed);

    let delivery = h.delegate.deliveries().pop().unwrap();
    assert_eq!(
        delivery.conflicts,
        vec![(uuid, ConflictType::DownloadLocalUpload)]
    );
    assert_eq!(h.server.entry(uuid).unwrap().version, 2);
    assert_eq!(h.server.content(uuid).unwrap(), b"queued");
}
