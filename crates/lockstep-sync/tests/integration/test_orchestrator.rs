//! Priority loop, gate and mode handling

use lockstep_core::domain::{FileUuid, SyncMode};
use lockstep_core::ports::{ApiError, SyncEvent};
use lockstep_sync::{SyncError, TriggerOutcome};

use crate::common::{attrs, method, Harness, MAX_ATTEMPTS};

// ============================================================================
// Idle cycles
// ============================================================================

#[tokio::test]
async fn test_idle_trigger_takes_and_releases_lock() {
    let h = Harness::new().await;

    for round in 1..=2 {
        let outcome = h.engine.trigger_sync().await.unwrap();

        assert_eq!(outcome, TriggerOutcome::Completed);
        assert_eq!(h.server.calls(method::LOCK), round);
        assert_eq!(h.server.calls(method::GET_FILE_INDEX), round);
        assert_eq!(h.server.calls(method::UNLOCK), round);
        assert!(!h.server.lock_held());
    }
    assert!(!h.engine.is_operating());
    assert_eq!(h.engine.mode().await, SyncMode::Idle);
}

#[tokio::test]
async fn test_mode_changes_are_reported() {
    let h = Harness::new().await;

    h.engine.trigger_sync().await.unwrap();

    let modes: Vec<SyncMode> = h
        .delegate
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::ModeChanged { mode } => Some(mode),
            _ => None,
        })
        .collect();
    assert_eq!(modes, vec![SyncMode::Synchronizing, SyncMode::Idle]);
}

// ============================================================================
// Foreign lock
// ============================================================================

#[tokio::test]
async fn test_foreign_lock_defers_committed_work() {
    let h = Harness::new().await;
    let uuid = h.upload_new("a.txt", b"abc").await;
    h.server.set_foreign_lock(true);

    let outcome = h.engine.commit().await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Deferred);
    assert_eq!(h.engine.mode().await, SyncMode::Idle);
    assert!(h.delegate.events().contains(&SyncEvent::LockDeferred));
    assert!(h.engine.snapshot().await.store.has_committed_batches());
    assert!(h.server.entry(uuid).is_none());

    h.server.set_foreign_lock(false);
    let outcome = h.engine.trigger_sync().await.unwrap();

    assert_eq!(outcome, TriggerOutcome::Completed);
    assert_eq!(h.server.entry(uuid).unwrap().version, 0);
}

// ============================================================================
// Gate
// ============================================================================

#[tokio::test]
async fn test_trigger_during_cycle_returns_already_running() {
    let h = Harness::new().await;
    h.server.remote_put(FileUuid::new(), "slow.txt", b"slow");
    h.delegate.hold_next_delivery();

    let (first, second) = tokio::join!(h.engine.trigger_sync(), async {
        h.delegate.wait_until_delivering().await;
        assert!(h.engine.is_operating());
        let second = h.engine.trigger_sync().await.unwrap();
        h.delegate.release();
        second
    });

    assert_eq!(first.unwrap(), TriggerOutcome::Completed);
    assert_eq!(second, TriggerOutcome::AlreadyRunning);
    assert!(h.delegate.events().contains(&SyncEvent::AlreadyRunning));
    assert_eq!(h.server.calls(method::LOCK), 2);
}

#[tokio::test]
async fn test_resets_rejected_during_cycle() {
    let h = Harness::new().await;
    h.server.remote_put(FileUuid::new(), "slow.txt", b"slow");
    h.delegate.hold_next_delivery();

    let (first, (reset, metadata)) = tokio::join!(h.engine.trigger_sync(), async {
        h.delegate.wait_until_delivering().await;
        let reset = h.engine.reset_from_error().await;
        let metadata = h.engine.reset_metadata(None).await;
        h.delegate.release();
        (reset, metadata)
    });

    assert_eq!(first.unwrap(), TriggerOutcome::Completed);
    assert!(matches!(reset, Err(SyncError::ClientUsage(_))));
    assert!(matches!(metadata, Err(SyncError::ClientUsage(_))));
}

#[tokio::test]
async fn test_commit_during_cycle_is_sent_by_running_cycle() {
    let h = Harness::new().await;
    h.server.remote_put(FileUuid::new(), "slow.txt", b"slow");
    h.delegate.hold_next_delivery();
    let queued = FileUuid::new();

    let (first, second) = tokio::join!(h.engine.trigger_sync(), async {
        h.delegate.wait_until_delivering().await;
        h.engine
            .upload_data(queued, b"queued meanwhile", Some(attrs("queued.txt")))
            .await
            .unwrap();
        let second = h.engine.commit().await.unwrap();
        h.delegate.release();
        second
    });

    assert_eq!(second, TriggerOutcome::AlreadyRunning);
    assert_eq!(first.unwrap(), TriggerOutcome::Completed);
    // The running cycle picked up the batch before going idle
    assert_eq!(h.server.entry(queued).unwrap().version, 0);
    assert!(!h.engine.snapshot().await.store.has_committed_batches());
}

// ============================================================================
// Persisted modes
// ============================================================================

#[tokio::test]
async fn test_error_mode_survives_restart() {
    let mut h = Harness::new().await;
    h.upload_new("a.txt", b"abc").await;
    h.server.fail_times(
        method::START_OUTBOUND_TRANSFER,
        ApiError::OperationFailed("busy".into()),
        10,
    );
    h.engine.commit().await.unwrap();

    h.restart().await;

    let mode = h.engine.mode().await;
    assert!(matches!(mode, SyncMode::NonRecoverableError(_)));
    assert_eq!(
        h.engine.trigger_sync().await.unwrap(),
        TriggerOutcome::Halted(mode)
    );
}

#[tokio::test]
async fn test_network_mode_clears_after_successful_cycle() {
    let mut h = Harness::new().await;
    h.server.fail_times(
        method::GET_FILE_INDEX,
        ApiError::NetworkUnavailable("offline".into()),
        MAX_ATTEMPTS as usize,
    );

    let outcome = h.engine.trigger_sync().await.unwrap();
    assert_eq!(
        outcome,
        TriggerOutcome::Halted(SyncMode::NetworkNotConnected)
    );

    h.restart().await;
    assert_eq!(h.engine.mode().await, SyncMode::NetworkNotConnected);

    assert_eq!(
        h.engine.trigger_sync().await.unwrap(),
        TriggerOutcome::Completed
    );
    assert_eq!(h.engine.mode().await, SyncMode::Idle);
}

// ============================================================================
// Metadata reset
// ============================================================================

#[tokio::test]
async fn test_reset_metadata_forgets_one_file() {
    let h = Harness::new().await;
    let kept = h.upload_new("kept.txt", b"kept").await;
    let forgotten = h.upload_new("forgotten.txt", b"gone").await;
    h.engine.commit().await.unwrap();

    h.engine.reset_metadata(Some(forgotten)).await.unwrap();

    assert!(h.engine.local_file_status(forgotten).await.is_none());
    assert_eq!(h.local_version(kept).await, Some(0));
    // Nothing is sent to the server
    assert_eq!(h.server.entry(forgotten).unwrap().version, 0);
}

#[tokio::test]
async fn test_reset_metadata_forgets_everything() {
    let h = Harness::new().await;
    let synced = h.upload_new("synced.txt", b"one").await;
    h.engine.commit().await.unwrap();
    let queued = h.upload_new("queued.txt", b"two").await;

    h.engine.reset_metadata(None).await.unwrap();

    let snapshot = h.engine.snapshot().await;
    assert_eq!(snapshot.store.records().count(), 0);
    assert!(!snapshot.store.has_pending_upload(queued));
    assert!(h.engine.local_file_status(synced).await.is_none());
}

#[tokio::test]
async fn test_forgotten_file_is_downloaded_again() {
    let h = Harness::new().await;
    let uuid = h.upload_new("again.txt", b"again").await;
    h.engine.commit().await.unwrap();

    h.engine.reset_metadata(Some(uuid)).await.unwrap();
    h.engine.trigger_sync().await.unwrap();

    let last = h.delegate.deliveries().pop().unwrap();
    assert_eq!(last.files, vec![(uuid, 0, b"again".to_vec())]);
    assert_eq!(h.local_version(uuid).await, Some(0));
}
