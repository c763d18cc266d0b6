//! Upload recovery, error modes and reset

use lockstep_core::domain::{FileUuid, SyncMode, UploadStage};
use lockstep_core::ports::{ApiError, OperationStatus, OperationStatusCode, SyncEvent};
use lockstep_sync::TriggerOutcome;

use crate::common::{attrs, method, Harness, MAX_ATTEMPTS, MAX_POLLS};

fn status(code: OperationStatusCode, count: u32) -> OperationStatus {
    OperationStatus {
        code,
        count,
        error: None,
    }
}

fn recovery_events(h: &Harness, stage: &str) -> usize {
    h.delegate
        .count_events(|e| matches!(e, SyncEvent::Recovery { stage: s } if s == stage))
}

// ============================================================================
// Ambiguous commit
// ============================================================================

#[tokio::test]
async fn test_lost_commit_response_resumes_from_operation_id() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server.lose_next_response(
        method::START_OUTBOUND_TRANSFER,
        ApiError::NetworkUnavailable("connection reset".into()),
    );

    let outcome = h.engine.commit().await.unwrap();
    assert_eq!(
        outcome,
        TriggerOutcome::Halted(SyncMode::NetworkNotConnected)
    );
    assert_eq!(
        h.engine.snapshot().await.upload.stage,
        UploadStage::PossiblyCommitted
    );

    let outcome = h.engine.trigger_sync().await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Completed);
    assert_eq!(h.server.calls(method::START_OUTBOUND_TRANSFER), 1);
    assert_eq!(h.server.calls(method::UPLOAD_FILE_BLOCK), 1);
    assert_eq!(h.server.entry(uuid).unwrap().version, 0);
    assert_eq!(h.local_version(uuid).await, Some(0));
}

#[tokio::test]
async fn test_commit_that_never_arrived_is_resent() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server.fail_next(
        method::START_OUTBOUND_TRANSFER,
        ApiError::NetworkUnavailable("connection refused".into()),
    );

    h.engine.commit().await.unwrap();
    let outcome = h.engine.trigger_sync().await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Completed);
    assert_eq!(h.server.calls(method::START_OUTBOUND_TRANSFER), 2);
    // The staged upload survived on the server and is not sent again
    assert_eq!(h.server.calls(method::UPLOAD_FILE_BLOCK), 1);
    assert_eq!(recovery_events(&h, "awaiting_lock_and_index"), 1);
    assert_eq!(h.local_version(uuid).await, Some(0));
}

// ============================================================================
// Operation id removal
// ============================================================================

fn outbound_completions(h: &Harness) -> usize {
    h.delegate
        .count_events(|e| matches!(e, SyncEvent::OutboundTransferComplete { .. }))
}

#[tokio::test]
async fn test_failed_operation_id_removal_is_retried() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server.fail_next(
        method::REMOVE_OPERATION_ID,
        ApiError::OperationFailed("storage busy".into()),
    );

    assert_eq!(h.engine.commit().await.unwrap(), TriggerOutcome::Completed);
    assert_eq!(h.server.calls(method::REMOVE_OPERATION_ID), 2);
    assert!(!h.server.has_operation());
    assert_eq!(h.local_version(uuid).await, Some(0));

    // A later commit that never reaches the server must not find the
    // earlier operation and count itself as committed
    h.engine.upload_data(uuid, b"second", None).await.unwrap();
    h.server.fail_next(
        method::START_OUTBOUND_TRANSFER,
        ApiError::NetworkUnavailable("connection refused".into()),
    );
    assert_eq!(
        h.engine.commit().await.unwrap(),
        TriggerOutcome::Halted(SyncMode::NetworkNotConnected)
    );
    assert_eq!(h.local_version(uuid).await, Some(0));

    assert_eq!(h.engine.trigger_sync().await.unwrap(), TriggerOutcome::Completed);
    assert_eq!(h.server.entry(uuid).unwrap().version, 1);
    assert_eq!(h.server.content(uuid).unwrap(), b"second");
    assert_eq!(h.local_version(uuid).await, Some(1));
}

#[tokio::test]
async fn test_network_loss_before_operation_id_removed_keeps_batch() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server.fail_times(
        method::REMOVE_OPERATION_ID,
        ApiError::NetworkUnavailable("connection reset".into()),
        MAX_ATTEMPTS as usize,
    );

    assert_eq!(
        h.engine.commit().await.unwrap(),
        TriggerOutcome::Halted(SyncMode::NetworkNotConnected)
    );
    assert_eq!(h.server.calls(method::REMOVE_OPERATION_ID), MAX_ATTEMPTS);
    assert!(h.server.has_operation());
    let snapshot = h.engine.snapshot().await;
    assert!(snapshot.store.has_active_batch());
    assert_eq!(snapshot.upload.stage, UploadStage::PossiblyCommitted);
    assert_eq!(h.local_version(uuid).await, None);
    assert_eq!(outbound_completions(&h), 0);

    // The succeeded commit is found again and wrapped up once
    assert_eq!(h.engine.trigger_sync().await.unwrap(), TriggerOutcome::Completed);

    assert!(!h.server.has_operation());
    assert_eq!(h.server.calls(method::START_OUTBOUND_TRANSFER), 1);
    assert_eq!(h.server.entry(uuid).unwrap().version, 0);
    assert_eq!(h.local_version(uuid).await, Some(0));
    assert!(!h.engine.snapshot().await.store.has_active_batch());
    assert_eq!(outbound_completions(&h), 1);
}

#[tokio::test]
async fn test_rejected_operation_id_removal_is_non_recoverable() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server.fail_next(
        method::REMOVE_OPERATION_ID,
        ApiError::UsageError("unknown device".into()),
    );

    let outcome = h.engine.commit().await.unwrap();

    assert!(matches!(
        outcome,
        TriggerOutcome::Halted(SyncMode::NonRecoverableError(_))
    ));
    assert_eq!(h.server.calls(method::REMOVE_OPERATION_ID), 1);
    assert!(h.engine.snapshot().await.store.has_active_batch());
    assert_eq!(h.local_version(uuid).await, None);
    assert_eq!(outbound_completions(&h), 0);
}

// ============================================================================
// Failed transfers
// ============================================================================

#[tokio::test]
async fn test_failed_during_transfer_with_progress_is_retried() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server
        .script_next_operation(vec![status(OperationStatusCode::FailedDuringTransfer, 1)]);

    let outcome = h.engine.commit().await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Completed);
    assert_eq!(h.server.calls(method::OUTBOUND_TRANSFER_RECOVERY), 1);
    assert_eq!(h.server.calls(method::START_OUTBOUND_TRANSFER), 1);
    assert_eq!(recovery_events(&h, "transfer_in_progress"), 1);
    assert_eq!(h.local_version(uuid).await, Some(0));
}

#[tokio::test]
async fn test_failed_after_transfer_with_progress_is_retried() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server
        .script_next_operation(vec![status(OperationStatusCode::FailedAfterTransfer, 1)]);

    h.engine.commit().await.unwrap();

    assert_eq!(h.server.calls(method::OUTBOUND_TRANSFER_RECOVERY), 1);
    assert_eq!(h.server.entry(uuid).unwrap().version, 0);
}

#[tokio::test]
async fn test_failed_before_transfer_resends_remaining_work() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server
        .script_next_operation(vec![status(OperationStatusCode::FailedBeforeTransfer, 0)]);

    let outcome = h.engine.commit().await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Completed);
    assert_eq!(h.server.calls(method::START_OUTBOUND_TRANSFER), 2);
    assert_eq!(h.server.calls(method::UPLOAD_FILE_BLOCK), 1);
    assert_eq!(h.server.calls(method::OUTBOUND_TRANSFER_RECOVERY), 0);
    assert_eq!(h.local_version(uuid).await, Some(0));
}

#[tokio::test]
async fn test_lost_lock_during_upload_restarts_from_recovery() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abcdefgh").await;
    h.server
        .fail_next(method::UPLOAD_FILE_BLOCK, ApiError::LockNotHeld);

    let outcome = h.engine.commit().await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Completed);
    assert_eq!(h.server.calls(method::UPLOAD_RECOVERY), 1);
    assert_eq!(h.server.content(uuid).unwrap(), b"abcdefgh");
}

// ============================================================================
// Exhaustion and reset
// ============================================================================

#[tokio::test]
async fn test_exhausted_recovery_requires_reset() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server.fail_times(
        method::START_OUTBOUND_TRANSFER,
        ApiError::OperationFailed("storage busy".into()),
        (MAX_ATTEMPTS + 1) as usize,
    );

    let outcome = h.engine.commit().await.unwrap();
    assert!(matches!(
        outcome,
        TriggerOutcome::Halted(SyncMode::NonRecoverableError(_))
    ));
    assert_eq!(
        h.server.calls(method::START_OUTBOUND_TRANSFER),
        MAX_ATTEMPTS + 1
    );

    // Halted until reset: no server traffic
    let locks = h.server.calls(method::LOCK);
    let outcome = h.engine.trigger_sync().await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Halted(_)));
    assert_eq!(h.server.calls(method::LOCK), locks);

    h.engine.reset_from_error().await.unwrap();

    assert_eq!(h.engine.mode().await, SyncMode::Idle);
    assert_eq!(h.server.calls(method::CLEANUP), 1);
    assert!(!h.server.lock_held());
    let snapshot = h.engine.snapshot().await;
    assert!(!snapshot.store.has_active_batch());
    assert!(!snapshot.server_lock_held);
    assert_eq!(snapshot.upload.stage, UploadStage::Normal);

    // The file can be queued again once the engine is idle
    h.engine.upload_data(uuid, b"abc", None).await.unwrap();
    assert_eq!(h.engine.commit().await.unwrap(), TriggerOutcome::Completed);
    assert_eq!(h.local_version(uuid).await, Some(0));
}

#[tokio::test]
async fn test_transfer_that_never_finishes_is_non_recoverable() {
    let h = Harness::new().await;
    h.upload_new("a.txt", b"abc").await;
    h.server.script_next_operation(
        (0..MAX_POLLS)
            .map(|_| status(OperationStatusCode::InProgress, 0))
            .collect(),
    );

    let outcome = h.engine.commit().await.unwrap();

    assert!(matches!(
        outcome,
        TriggerOutcome::Halted(SyncMode::NonRecoverableError(_))
    ));
    assert_eq!(h.server.calls(method::CHECK_OPERATION_STATUS), MAX_POLLS);

    h.engine.reset_from_error().await.unwrap();
    assert!(!h.server.has_operation());
}

#[tokio::test]
async fn test_unreadable_payload_is_a_client_error() {
    let h = Harness::new().await;
    let path = h.payload("vanishing.txt", b"soon gone");
    h.engine
        .upload_immutable_file(
            FileUuid::new(),
            path.clone(),
            Some(attrs("vanishing.txt")),
        )
        .await
        .unwrap();
    std::fs::remove_file(&path).unwrap();

    let outcome = h.engine.commit().await.unwrap();
    assert!(matches!(
        outcome,
        TriggerOutcome::Halted(SyncMode::ClientApiError(_))
    ));

    h.engine.reset_from_error().await.unwrap();

    // Local-only reset: the server is not asked to clean up
    assert_eq!(h.server.calls(method::CLEANUP), 0);
    assert_eq!(h.engine.mode().await, SyncMode::Idle);
    assert!(!h.engine.snapshot().await.store.has_active_batch());

    assert_eq!(
        h.engine.trigger_sync().await.unwrap(),
        TriggerOutcome::Completed
    );
    assert!(!h.server.lock_held());
}

#[tokio::test]
async fn test_failed_cleanup_keeps_error_mode() {
    let h = Harness::new().await;
    h.upload_new("a.txt", b"abc").await;
    h.server.fail_times(
        method::START_OUTBOUND_TRANSFER,
        ApiError::OperationFailed("busy".into()),
        (MAX_ATTEMPTS + 1) as usize,
    );
    h.engine.commit().await.unwrap();
    h.server.fail_times(
        method::CLEANUP,
        ApiError::NetworkUnavailable("offline".into()),
        MAX_ATTEMPTS as usize,
    );

    assert!(h.engine.reset_from_error().await.is_err());

    assert!(matches!(
        h.engine.mode().await,
        SyncMode::NonRecoverableError(_)
    ));
    assert!(h.engine.snapshot().await.store.has_active_batch());
}

#[tokio::test]
async fn test_reset_when_idle_does_nothing() {
    let h = Harness::new().await;

    h.engine.reset_from_error().await.unwrap();

    assert_eq!(h.engine.mode().await, SyncMode::Idle);
    assert_eq!(h.server.calls(method::CLEANUP), 0);
}

// ============================================================================
// Network
// ============================================================================

#[tokio::test]
async fn test_network_loss_at_lock_resumes_on_next_trigger() {
    let h = Harness::new().await;
    h.server
        .fail_next(method::LOCK, ApiError::NetworkUnavailable("offline".into()));

    let outcome = h.engine.trigger_sync().await.unwrap();
    assert_eq!(
        outcome,
        TriggerOutcome::Halted(SyncMode::NetworkNotConnected)
    );
    assert_eq!(h.engine.mode().await, SyncMode::NetworkNotConnected);

    let outcome = h.engine.trigger_sync().await.unwrap();
    assert_eq!(outcome, TriggerOutcome::Completed);
    assert_eq!(h.engine.mode().await, SyncMode::Idle);
}

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn test_restart_after_commit_sent_resumes_possibly_committed() {
    let mut h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server.stall_after(method::START_OUTBOUND_TRANSFER);

    tokio::select! {
        _ = h.engine.commit() => panic!("commit should stall"),
        _ = h.server.wait_until_stalled() => {}
    }
    assert_eq!(h.engine.snapshot().await.mode, SyncMode::Synchronizing);

    h.restart().await;
    let outcome = h.engine.trigger_sync().await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Completed);
    assert_eq!(recovery_events(&h, "upload possibly_committed"), 1);
    assert_eq!(h.server.calls(method::START_OUTBOUND_TRANSFER), 1);
    assert_eq!(h.server.calls(method::UPLOAD_FILE_BLOCK), 1);
    assert_eq!(h.local_version(uuid).await, Some(0));
    assert_eq!(h.engine.mode().await, SyncMode::Idle);
}

#[tokio::test]
async fn test_restart_during_delivery_redelivers_staged_files() {
    let mut h = Harness::new().await;
    let uuid = FileUuid::new();
    h.server.remote_put(uuid, "restart.txt", b"restart");
    h.delegate.hold_next_delivery();

    tokio::select! {
        _ = h.engine.trigger_sync() => panic!("delivery should be held"),
        _ = h.delegate.wait_until_delivering() => {}
    }
    let fetched = h.server.calls(method::DOWNLOAD_FILE_BLOCK);

    h.restart().await;
    let outcome = h.engine.trigger_sync().await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Completed);
    assert_eq!(recovery_events(&h, "download deliver_atomically"), 1);
    assert_eq!(h.server.calls(method::DOWNLOAD_FILE_BLOCK), fetched);
    assert_eq!(h.server.calls(method::SETUP_INBOUND_TRANSFER), 1);
    assert_eq!(
        h.delegate.deliveries()[0].files,
        vec![(uuid, 0, b"restart".to_vec())]
    );
    assert_eq!(h.local_version(uuid).await, Some(0));
}
