//! Work queue integration tests (in-memory store)

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{add_file, add_files, batch_with_expected, hash, import_in, Harness};
use intake_core::config::{IngestPolicy, StallRecovery};
use intake_core::models::{BatchStatus, FileStatus};
use intake_core::ErrorKind;
use uuid::Uuid;

#[tokio::test]
async fn test_list_queued_in_creation_order() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let files = add_files(&h, import.id, 3, 0x01).await;
    assert!(files[0].created_at <= files[1].created_at);
    assert!(files[1].created_at <= files[2].created_at);

    let queued = h.queue.list_queued(import.id).await.unwrap();
    let ids: Vec<i64> = queued.iter().map(|f| f.id).collect();
    assert_eq!(ids, files.iter().map(|f| f.id).collect::<Vec<_>>());

    let claimed = h.queue.claim_next(import.id, 2).await.unwrap();
    assert_eq!(claimed.iter().map(|f| f.id).collect::<Vec<_>>(), &ids[..2]);

    // PROCESSING files stay visible, terminal ones leave the queue.
    h.files.mark_ingested(files[0].id).await.unwrap();
    let queued = h.queue.list_queued(import.id).await.unwrap();
    assert_eq!(queued.iter().map(|f| f.id).collect::<Vec<_>>(), &ids[1..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_claims_single_winner() {
    let h = Arc::new(Harness::new());
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/contended.tar", &hash(0xaa)).await;

    let claimants = (0..16).map(|_| {
        let h = h.clone();
        tokio::spawn(async move { h.queue.claim_next(import.id, 1).await })
    });
    let results = futures::future::join_all(claimants).await;

    let mut winners = Vec::new();
    for result in results {
        let claimed = result.unwrap().unwrap();
        winners.extend(claimed);
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, file.id);
    assert_eq!(h.files.get(file.id).await.unwrap().status, FileStatus::Processing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_drain_queue_without_overlap() {
    let h = Arc::new(Harness::new());
    let import = import_in(&h, None).await;
    add_files(&h, import.id, 50, 0x00).await;

    let workers = (0..6).map(|_| {
        let h = h.clone();
        tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let claimed = h.queue.claim_next(import.id, 3).await.unwrap();
                if claimed.is_empty() {
                    break;
                }
                for file in claimed {
                    h.files.mark_ingested(file.id).await.unwrap();
                    mine.push(file.id);
                }
            }
            mine
        })
    });

    let mut seen = HashSet::new();
    for handle in futures::future::join_all(workers).await {
        for id in handle.unwrap() {
            assert!(seen.insert(id), "file {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 50);

    let stats = h.queue.queue_stats(import.id).await.unwrap();
    assert_eq!(stats.ingested, 50);
    assert_eq!(stats.active(), 0);
}

#[tokio::test]
async fn test_short_result_when_queue_runs_dry() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    add_files(&h, import.id, 2, 0x10).await;

    assert_eq!(h.queue.claim_next(import.id, 10).await.unwrap().len(), 2);
    assert!(h.queue.claim_next(import.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_limit_is_validated_and_capped() {
    let h = Harness::with_policy(IngestPolicy {
        claim_limit_max: 5,
        ..IngestPolicy::default()
    });
    let import = import_in(&h, None).await;
    add_files(&h, import.id, 10, 0x20).await;

    let err = h.queue.claim_next(import.id, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_eq!(h.queue.claim_next(import.id, 100).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_cancelled_import_stops_claims() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    add_files(&h, import.id, 3, 0x30).await;
    h.queue.claim_next(import.id, 1).await.unwrap();

    h.imports.cancel(import.id).await.unwrap();

    let err = h.queue.claim_next(import.id, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);

    // In-flight work may still finish.
    let stats = h.queue.queue_stats(import.id).await.unwrap();
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.pending, 2);
}

#[tokio::test]
async fn test_cancelled_batch_stops_claims_for_all_imports() {
    let h = Harness::new();
    let batch = batch_with_expected(&h, None).await;
    let first = import_in(&h, Some(batch.id)).await;
    let second = import_in(&h, Some(batch.id)).await;
    add_files(&h, first.id, 2, 0x40).await;
    add_files(&h, second.id, 2, 0x50).await;

    h.batches.cancel(batch.id).await.unwrap();

    for import_id in [first.id, second.id] {
        let err = h.queue.claim_next(import_id, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConflictingState);
    }
}

#[tokio::test]
async fn test_first_claim_starts_batch() {
    let h = Harness::new();
    let batch = batch_with_expected(&h, Some(2)).await;
    let import = import_in(&h, Some(batch.id)).await;
    add_files(&h, import.id, 2, 0x60).await;
    assert_eq!(h.batches.get(batch.id).await.unwrap().status, BatchStatus::Pending);

    h.queue.claim_next(import.id, 1).await.unwrap();
    assert_eq!(h.batches.get(batch.id).await.unwrap().status, BatchStatus::Running);
}

#[tokio::test]
async fn test_unknown_import() {
    let h = Harness::new();
    let missing = Uuid::new_v4();
    assert_eq!(h.queue.claim_next(missing, 1).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(h.queue.list_queued(missing).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(h.queue.queue_stats(missing).await.unwrap_err().kind(), ErrorKind::NotFound);
}

// ============================================================================
// Stalled work
// ============================================================================

#[tokio::test]
async fn test_stalled_files_are_reported_in_manual_mode() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let files = add_files(&h, import.id, 2, 0x70).await;
    h.queue.claim_next(import.id, 2).await.unwrap();

    let now = Utc::now();
    assert!(h.store.touch_file(files[0].id, now - Duration::hours(2)).await);

    let report = h.queue.recover_stalled(now, 100).await.unwrap();
    assert_eq!(report.recovery, StallRecovery::Manual);
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].id, files[0].id);
    assert_eq!(h.files.get(files[0].id).await.unwrap().status, FileStatus::Processing);
}

#[tokio::test]
async fn test_stalled_files_fail_onto_retry_path() {
    let h = Harness::with_policy(IngestPolicy {
        stall_recovery: StallRecovery::Fail,
        ..IngestPolicy::default()
    });
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/slow.tar", &hash(0x80)).await;
    h.queue.claim_next(import.id, 1).await.unwrap();

    let now = Utc::now();
    h.store.touch_file(file.id, now - Duration::hours(1)).await;

    let report = h.queue.recover_stalled(now, 100).await.unwrap();
    assert_eq!(report.files.len(), 1);

    let failed = h.files.get(file.id).await.unwrap();
    assert_eq!(failed.status, FileStatus::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert!(failed.last_error.unwrap_or_default().starts_with("stalled in processing"));

    let retried = h.files.retry(file.id).await.unwrap();
    assert_eq!(retried.status, FileStatus::Processing);
}

#[tokio::test]
async fn test_fresh_processing_files_are_not_stalled() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    add_files(&h, import.id, 3, 0x90).await;
    h.queue.claim_next(import.id, 3).await.unwrap();

    let report = h.queue.recover_stalled(Utc::now(), 100).await.unwrap();
    assert!(report.files.is_empty());
}
