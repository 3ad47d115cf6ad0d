//! File state machine integration tests (in-memory store)

mod common;

use common::{add_file, add_files, hash, import_in, Harness};
use intake_core::config::{DedupScope, IngestPolicy};
use intake_core::models::FileStatus;
use intake_core::shared::PaginationParams;
use intake_core::{CreateFileCommand, ErrorKind, FileFilter, IngestError};
use uuid::Uuid;

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_claim_then_ingest() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/a.tar", &hash(0xaa)).await;
    assert_eq!(file.status, FileStatus::Pending);
    assert_eq!(file.sha256.to_hex(), "aa".repeat(32));

    let claimed = h.queue.claim_next(import.id, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, file.id);
    assert_eq!(claimed[0].status, FileStatus::Processing);

    let ingested = h.files.mark_ingested(file.id).await.unwrap();
    assert_eq!(ingested.status, FileStatus::Ingested);
    assert!(ingested.ingested_at.is_some());

    let stats = h.queue.queue_stats(import.id).await.unwrap();
    assert_eq!(stats.active(), 0);
    assert_eq!(stats.ingested, 1);
}

#[tokio::test]
async fn test_fail_then_retry_keeps_attempt_count() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/b.tar", &hash(0xbb)).await;
    h.queue.claim_next(import.id, 1).await.unwrap();

    let failed = h.files.mark_failed(file.id, "network timeout").await.unwrap();
    assert_eq!(failed.status, FileStatus::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert_eq!(failed.last_error.as_deref(), Some("network timeout"));

    let retried = h.files.retry(file.id).await.unwrap();
    assert_eq!(retried.status, FileStatus::Processing);
    assert_eq!(retried.attempt_count, 1);

    let failed_again = h.files.mark_failed(file.id, "network timeout").await.unwrap();
    assert_eq!(failed_again.attempt_count, 2);
}

#[tokio::test]
async fn test_enqueue_then_claim() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/q.tar", &hash(0x01)).await;

    let queued = h.files.mark_queued(file.id).await.unwrap();
    assert_eq!(queued.status, FileStatus::Queued);

    let claimed = h.queue.claim_next(import.id, 5).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, FileStatus::Processing);

    let err = h.files.mark_queued(file.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
}

// ============================================================================
// Transition safety
// ============================================================================

#[tokio::test]
async fn test_ingest_from_pending_is_rejected() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/c.tar", &hash(0xcc)).await;

    let err = h.files.mark_ingested(file.id).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::InvalidTransition { from: "pending", to: "ingested", .. }
    ));

    let unchanged = h.files.get(file.id).await.unwrap();
    assert_eq!(unchanged.status, FileStatus::Pending);
    assert!(unchanged.ingested_at.is_none());
}

#[tokio::test]
async fn test_mark_ingested_is_idempotent() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/d.tar", &hash(0xdd)).await;
    h.queue.claim_next(import.id, 1).await.unwrap();

    let first = h.files.mark_ingested(file.id).await.unwrap();
    let second = h.files.mark_ingested(file.id).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_quarantine_is_irreversible() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/e.tar", &hash(0xee)).await;
    h.queue.claim_next(import.id, 1).await.unwrap();

    let quarantined = h.files.mark_quarantined(file.id, "corrupt tar header").await.unwrap();
    assert_eq!(quarantined.status, FileStatus::Quarantined);
    assert_eq!(quarantined.last_error.as_deref(), Some("corrupt tar header"));

    for err in [
        h.files.retry(file.id).await.unwrap_err(),
        h.files.mark_ingested(file.id).await.unwrap_err(),
        h.files.mark_failed(file.id, "late").await.unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }
}

#[tokio::test]
async fn test_retry_ceiling() {
    let h = Harness::with_policy(IngestPolicy {
        retry_ceiling: 2,
        ..IngestPolicy::default()
    });
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/f.tar", &hash(0x0f)).await;
    h.queue.claim_next(import.id, 1).await.unwrap();

    h.files.mark_failed(file.id, "checksum mismatch").await.unwrap();
    h.files.retry(file.id).await.unwrap();
    let exhausted = h.files.mark_failed(file.id, "checksum mismatch").await.unwrap();
    assert_eq!(exhausted.attempt_count, 2);

    let err = h.files.retry(file.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(h.files.get(file.id).await.unwrap().status, FileStatus::Failed);
}

#[tokio::test]
async fn test_retry_in_cancelled_import_conflicts() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/g.tar", &hash(0x10)).await;
    h.queue.claim_next(import.id, 1).await.unwrap();
    h.files.mark_failed(file.id, "disk full").await.unwrap();

    h.imports.cancel(import.id).await.unwrap();

    let err = h.files.retry(file.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);
}

#[tokio::test]
async fn test_ingested_at_matches_status() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let files = add_files(&h, import.id, 5, 0x20).await;
    h.queue.claim_next(import.id, 4).await.unwrap();

    h.files.mark_ingested(files[0].id).await.unwrap();
    h.files.mark_failed(files[1].id, "timeout").await.unwrap();
    h.files.mark_quarantined(files[2].id, "bad manifest entry").await.unwrap();
    let duplicate = add_file(&h, import.id, "archive/dup.tar", &files[0].sha256.to_hex()).await;
    h.queue.claim_next(import.id, 10).await.unwrap();
    h.files.mark_skipped_dedup(duplicate.id).await.unwrap();

    let page = h
        .files
        .list(
            &FileFilter {
                import_id: Some(import.id),
                ..Default::default()
            },
            &PaginationParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 6);
    for file in page.items {
        let ingested = matches!(file.status, FileStatus::Ingested | FileStatus::SkippedDedup);
        assert_eq!(ingested, file.ingested_at.is_some(), "file {} {}", file.id, file.status);
        if file.status == FileStatus::Failed {
            assert!(file.last_error.is_some());
        }
    }
}

// ============================================================================
// Deletion
// ============================================================================

#[tokio::test]
async fn test_delete_guard() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let file = add_file(&h, import.id, "archive/h.tar", &hash(0x30)).await;
    h.queue.claim_next(import.id, 1).await.unwrap();

    let err = h.files.delete(file.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);
    assert_eq!(h.files.get(file.id).await.unwrap().status, FileStatus::Processing);

    h.files.mark_ingested(file.id).await.unwrap();
    h.files.delete(file.id).await.unwrap();

    let err = h.files.get(file.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.files.delete(file.id).await.unwrap_err().kind(), ErrorKind::NotFound);
}

// ============================================================================
// Hashes and validation
// ============================================================================

#[tokio::test]
async fn test_hash_round_trip_is_case_insensitive() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let lower = "0123456789abcdef".repeat(4);

    for (i, input) in [lower.clone(), lower.to_uppercase(), "0123456789ABCdef".repeat(4)]
        .into_iter()
        .enumerate()
    {
        let created = add_file(&h, import.id, &format!("archive/{i}.tar"), &input).await;
        let read = h.files.get(created.id).await.unwrap();
        assert_eq!(read.sha256.to_hex(), lower);
    }
}

#[tokio::test]
async fn test_create_rejects_bad_input() {
    let h = Harness::new();
    let import = import_in(&h, None).await;

    let err = h
        .files
        .create(CreateFileCommand {
            import_id: import.id,
            path: "archive/x.tar".to_string(),
            size_bytes: None,
            sha256: "abc".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Validation { field: "sha256", .. }));

    let err = h
        .files
        .create(CreateFileCommand {
            import_id: Uuid::new_v4(),
            path: "archive/x.tar".to_string(),
            size_bytes: None,
            sha256: hash(0x01),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_list_filters_and_paginates() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let other = import_in(&h, None).await;
    add_files(&h, import.id, 7, 0x40).await;
    add_files(&h, other.id, 2, 0x60).await;
    h.queue.claim_next(import.id, 3).await.unwrap();

    let filter = FileFilter {
        import_id: Some(import.id),
        status: Some(FileStatus::Pending.code()),
        sha256: None,
    };
    let page = h
        .files
        .list(&filter, &PaginationParams::new(Some(2), Some(3)))
        .await
        .unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.items.len(), 1);
    assert!(!page.has_next());

    let by_hash = FileFilter {
        sha256: Some(hash(0x61).to_uppercase()),
        ..Default::default()
    };
    let page = h.files.list(&by_hash, &PaginationParams::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].import_id, other.id);

    let far = h
        .files
        .list(&filter, &PaginationParams::new(Some(i64::MAX), Some(50)))
        .await
        .unwrap();
    assert_eq!(far.total, 4);
    assert!(far.items.is_empty());
    assert!(!far.has_next());
}

// ============================================================================
// Dedup
// ============================================================================

#[tokio::test]
async fn test_skip_dedup_requires_ingested_duplicate() {
    let h = Harness::new();
    let import = import_in(&h, None).await;
    let original = add_file(&h, import.id, "archive/orig.tar", &hash(0x70)).await;
    let copy = add_file(&h, import.id, "archive/copy.tar", &hash(0x70)).await;
    h.queue.claim_next(import.id, 2).await.unwrap();

    // The original is not ingested yet.
    assert!(h.files.find_duplicate(copy.id).await.unwrap().is_none());
    let err = h.files.mark_skipped_dedup(copy.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictingState);

    h.files.mark_ingested(original.id).await.unwrap();
    let found = h.files.find_duplicate(copy.id).await.unwrap();
    assert_eq!(found.map(|f| f.id), Some(original.id));

    let skipped = h.files.mark_skipped_dedup(copy.id).await.unwrap();
    assert_eq!(skipped.status, FileStatus::SkippedDedup);
    assert!(skipped.ingested_at.is_some());
}

#[tokio::test]
async fn test_dedup_scope() {
    for (scope, allowed) in [(DedupScope::Import, false), (DedupScope::Global, true)] {
        let h = Harness::with_policy(IngestPolicy {
            dedup_scope: scope,
            ..IngestPolicy::default()
        });
        let first = import_in(&h, None).await;
        let second = import_in(&h, None).await;
        let original = add_file(&h, first.id, "archive/one.tar", &hash(0x80)).await;
        let copy = add_file(&h, second.id, "archive/one.tar", &hash(0x80)).await;
        h.queue.claim_next(first.id, 1).await.unwrap();
        h.files.mark_ingested(original.id).await.unwrap();
        h.queue.claim_next(second.id, 1).await.unwrap();

        let result = h.files.mark_skipped_dedup(copy.id).await;
        assert_eq!(result.is_ok(), allowed, "scope {scope:?}");
    }
}
