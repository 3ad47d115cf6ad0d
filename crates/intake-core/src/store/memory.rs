//! In-process store
//!
//! Holds every table behind one async mutex. Each trait method takes the lock
//! once, so a conditional update is trivially a compare-and-set and two
//! claimants can never both observe a file as claimable.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_common::Sha256Digest;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AttemptQuery, ClaimGate, CountScope, DeleteOutcome, FileQuery, IngestStore};
use crate::error::{IngestError, IngestResult};
use crate::models::{
    AttemptStatus, Batch, BatchStatus, FileStatus, FileStatusCounts, Import, ImportAttempt,
    ImportFile, NewBatch, NewFileRecord,
};
use crate::shared::PaginationParams;
use crate::state_machine::{AttemptChange, FileChange};

#[derive(Default)]
struct Tables {
    batches: HashMap<Uuid, Batch>,
    imports: HashMap<Uuid, Import>,
    files: BTreeMap<i64, ImportFile>,
    attempts: BTreeMap<i64, ImportAttempt>,
    last_file_id: i64,
    last_attempt_id: i64,
}

impl Tables {
    fn batch_of(&self, import_id: Uuid) -> Option<Uuid> {
        self.imports.get(&import_id).and_then(|import| import.batch_id)
    }

    fn in_scope(&self, file: &ImportFile, scope: CountScope) -> bool {
        match scope {
            CountScope::Import(id) => file.import_id == id,
            CountScope::Batch(id) => self.batch_of(file.import_id) == Some(id),
        }
    }

    fn counts(&self, scope: CountScope, retry_ceiling: i32) -> FileStatusCounts {
        let mut counts = FileStatusCounts::default();
        for file in self.files.values().filter(|f| self.in_scope(f, scope)) {
            counts.add(file.status, 1);
            if file.status == FileStatus::Failed && file.attempt_count >= retry_ceiling {
                counts.failed_exhausted += 1;
            }
        }
        counts
    }

    fn recount(&mut self, batch_id: Uuid) -> Option<Batch> {
        let counts = self.counts(CountScope::Batch(batch_id), i32::MAX);
        let batch = self.batches.get_mut(&batch_id)?;
        batch.file_count_discovered = counts.total();
        batch.file_count_ingested = counts.ingested_total();
        batch.updated_at = Utc::now();
        Some(batch.clone())
    }

    fn adjust_counters(&mut self, import_id: Uuid, discovered: i64, ingested: i64) {
        let Some(batch_id) = self.batch_of(import_id) else {
            return;
        };
        if let Some(batch) = self.batches.get_mut(&batch_id) {
            batch.file_count_discovered += discovered;
            batch.file_count_ingested += ingested;
            batch.updated_at = Utc::now();
        }
    }
}

fn page_of<T: Clone>(rows: Vec<&T>, page: &PaginationParams) -> (Vec<T>, i64) {
    let total = rows.len() as i64;
    let items = rows
        .into_iter()
        .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
        .take(page.limit() as usize)
        .cloned()
        .collect();
    (items, total)
}

/// Store kept entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdates `updated_at` of a file; lets callers exercise stall handling.
    pub async fn touch_file(&self, id: i64, updated_at: DateTime<Utc>) -> bool {
        let mut tables = self.tables.lock().await;
        match tables.files.get_mut(&id) {
            Some(file) => {
                file.updated_at = updated_at;
                true
            },
            None => false,
        }
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn insert_batch(&self, batch: NewBatch) -> IngestResult<Batch> {
        let now = Utc::now();
        let record = Batch {
            id: Uuid::new_v4(),
            source_system: batch.source_system,
            created_by: batch.created_by,
            manifest_sha256: batch.manifest_sha256,
            status: BatchStatus::Pending,
            file_count_expected: batch.file_count_expected,
            file_count_discovered: 0,
            file_count_ingested: 0,
            metadata: batch.metadata,
            created_at: now,
            updated_at: now,
        };
        self.tables.lock().await.batches.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_batch(&self, id: Uuid) -> IngestResult<Option<Batch>> {
        Ok(self.tables.lock().await.batches.get(&id).cloned())
    }

    async fn list_batches(
        &self,
        status: Option<BatchStatus>,
        page: &PaginationParams,
    ) -> IngestResult<(Vec<Batch>, i64)> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<&Batch> = tables
            .batches
            .values()
            .filter(|b| status.map_or(true, |s| b.status == s))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(page_of(rows, page))
    }

    async fn set_expected_count(&self, id: Uuid, expected: i64) -> IngestResult<Option<Batch>> {
        let mut tables = self.tables.lock().await;
        let Some(batch) = tables.batches.get_mut(&id) else {
            return Ok(None);
        };
        if expected < batch.file_count_discovered {
            return Ok(None);
        }
        batch.file_count_expected = Some(expected);
        batch.updated_at = Utc::now();
        Ok(Some(batch.clone()))
    }

    async fn update_batch_status(
        &self,
        id: Uuid,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> IngestResult<Option<Batch>> {
        let mut tables = self.tables.lock().await;
        match tables.batches.get_mut(&id) {
            Some(batch) if from.contains(&batch.status) => {
                batch.status = to;
                batch.updated_at = Utc::now();
                Ok(Some(batch.clone()))
            },
            _ => Ok(None),
        }
    }

    async fn recount_batch(&self, id: Uuid) -> IngestResult<Option<Batch>> {
        Ok(self.tables.lock().await.recount(id))
    }

    async fn insert_import(&self, batch_id: Option<Uuid>) -> IngestResult<Import> {
        let mut tables = self.tables.lock().await;
        if let Some(batch_id) = batch_id {
            if !tables.batches.contains_key(&batch_id) {
                return Err(IngestError::not_found("batch", batch_id));
            }
        }
        let import = Import {
            id: Uuid::new_v4(),
            batch_id,
            cancelled_at: None,
            created_at: Utc::now(),
        };
        tables.imports.insert(import.id, import.clone());
        Ok(import)
    }

    async fn get_import(&self, id: Uuid) -> IngestResult<Option<Import>> {
        Ok(self.tables.lock().await.imports.get(&id).cloned())
    }

    async fn cancel_import(&self, id: Uuid) -> IngestResult<Option<Import>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.imports.get_mut(&id).map(|import| {
            import.cancelled_at.get_or_insert_with(Utc::now);
            import.clone()
        }))
    }

    async fn delete_import(&self, id: Uuid) -> IngestResult<DeleteOutcome> {
        let mut tables = self.tables.lock().await;
        let Some(batch_id) = tables.imports.get(&id).map(|import| import.batch_id) else {
            return Ok(DeleteOutcome::NotFound);
        };

        let processing = tables
            .files
            .values()
            .any(|f| f.import_id == id && f.status == FileStatus::Processing);
        if processing {
            return Ok(DeleteOutcome::Blocked(format!("import {id} has files in processing")));
        }
        let active_attempt = tables
            .attempts
            .values()
            .any(|a| a.import_id == id && !a.status.is_terminal());
        if active_attempt {
            return Ok(DeleteOutcome::Blocked(format!("import {id} has an unfinished attempt")));
        }

        tables.files.retain(|_, f| f.import_id != id);
        tables.attempts.retain(|_, a| a.import_id != id);
        tables.imports.remove(&id);
        if let Some(batch_id) = batch_id {
            tables.recount(batch_id);
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn claim_gate(&self, import_id: Uuid) -> IngestResult<Option<ClaimGate>> {
        let tables = self.tables.lock().await;
        Ok(tables.imports.get(&import_id).map(|import| ClaimGate {
            import: import.clone(),
            batch_status: import
                .batch_id
                .and_then(|id| tables.batches.get(&id))
                .map(|batch| batch.status),
        }))
    }

    async fn insert_file(&self, file: NewFileRecord) -> IngestResult<ImportFile> {
        let mut tables = self.tables.lock().await;
        if !tables.imports.contains_key(&file.import_id) {
            return Err(IngestError::not_found("import", file.import_id));
        }

        if let Some(batch) = tables
            .batch_of(file.import_id)
            .and_then(|id| tables.batches.get(&id))
        {
            if batch.status.is_terminal() {
                return Err(IngestError::conflict(format!(
                    "batch {} is {}, no further files",
                    batch.id,
                    batch.status.as_str()
                )));
            }
            if batch
                .file_count_expected
                .is_some_and(|expected| batch.file_count_discovered >= expected)
            {
                return Err(IngestError::conflict(format!(
                    "batch {} already holds its expected {} files",
                    batch.id,
                    batch.file_count_discovered
                )));
            }
        }

        tables.last_file_id += 1;
        let now = Utc::now();
        let record = ImportFile {
            id: tables.last_file_id,
            import_id: file.import_id,
            path: file.path,
            size_bytes: file.size_bytes,
            sha256: file.sha256,
            status: FileStatus::Pending,
            ingested_at: None,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        tables.files.insert(record.id, record.clone());
        tables.adjust_counters(record.import_id, 1, 0);
        Ok(record)
    }

    async fn get_file(&self, id: i64) -> IngestResult<Option<ImportFile>> {
        Ok(self.tables.lock().await.files.get(&id).cloned())
    }

    async fn list_files(
        &self,
        query: &FileQuery,
        page: &PaginationParams,
    ) -> IngestResult<(Vec<ImportFile>, i64)> {
        let tables = self.tables.lock().await;
        let rows: Vec<&ImportFile> = tables
            .files
            .values()
            .filter(|f| query.import_id.map_or(true, |id| f.import_id == id))
            .filter(|f| query.status.map_or(true, |s| f.status == s))
            .filter(|f| query.sha256.map_or(true, |h| f.sha256 == h))
            .collect();
        Ok(page_of(rows, page))
    }

    async fn apply_file_change(
        &self,
        id: i64,
        change: &FileChange,
    ) -> IngestResult<Option<ImportFile>> {
        let mut tables = self.tables.lock().await;
        let event = change.event;
        let Some(file) = tables.files.get_mut(&id) else {
            return Ok(None);
        };
        if !event.sources().contains(&file.status) {
            return Ok(None);
        }

        let now = Utc::now();
        file.status = event.target();
        if event.sets_ingested_at() {
            file.ingested_at = Some(now);
        }
        if event.records_error() {
            file.last_error = change.message.clone();
        }
        if event.increments_attempts() {
            file.attempt_count += 1;
        }
        file.updated_at = now;

        let updated = file.clone();
        if event.target().counts_as_ingested() {
            tables.adjust_counters(updated.import_id, 0, 1);
        }
        Ok(Some(updated))
    }

    async fn delete_file(&self, id: i64) -> IngestResult<DeleteOutcome> {
        let mut tables = self.tables.lock().await;
        let Some(file) = tables.files.get(&id) else {
            return Ok(DeleteOutcome::NotFound);
        };
        if file.status == FileStatus::Processing {
            return Ok(DeleteOutcome::Blocked(format!("file {id} is processing")));
        }
        let (import_id, ingested) = (file.import_id, file.status.counts_as_ingested());
        tables.files.remove(&id);
        tables.adjust_counters(import_id, -1, if ingested { -1 } else { 0 });
        Ok(DeleteOutcome::Deleted)
    }

    async fn claim_files(&self, import_id: Uuid, limit: i64) -> IngestResult<Vec<ImportFile>> {
        let mut tables = self.tables.lock().await;
        let Some(import) = tables.imports.get(&import_id) else {
            return Ok(Vec::new());
        };
        let batch_id = import.batch_id;
        let batch_closed = batch_id
            .and_then(|id| tables.batches.get(&id))
            .is_some_and(|b| b.status.is_terminal());
        if import.is_cancelled() || batch_closed || limit < 1 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<(DateTime<Utc>, i64)> = tables
            .files
            .values()
            .filter(|f| f.import_id == import_id && f.status.is_claimable())
            .map(|f| (f.created_at, f.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit as usize);

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(file) = tables.files.get_mut(&id) {
                file.status = FileStatus::Processing;
                file.updated_at = now;
                claimed.push(file.clone());
            }
        }

        if !claimed.is_empty() {
            if let Some(batch) = batch_id.and_then(|id| tables.batches.get_mut(&id)) {
                if batch.status == BatchStatus::Pending {
                    batch.status = BatchStatus::Running;
                    batch.updated_at = now;
                }
            }
        }
        Ok(claimed)
    }

    async fn active_files(&self, import_id: Uuid) -> IngestResult<Vec<ImportFile>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<ImportFile> = tables
            .files
            .values()
            .filter(|f| f.import_id == import_id && f.status.is_active())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn count_files(
        &self,
        scope: CountScope,
        retry_ceiling: i32,
    ) -> IngestResult<FileStatusCounts> {
        Ok(self.tables.lock().await.counts(scope, retry_ceiling))
    }

    async fn find_ingested_by_hash(
        &self,
        sha256: &Sha256Digest,
        import_id: Option<Uuid>,
        exclude_id: i64,
    ) -> IngestResult<Option<ImportFile>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .files
            .values()
            .find(|f| {
                f.id != exclude_id
                    && f.status == FileStatus::Ingested
                    && f.sha256 == *sha256
                    && import_id.map_or(true, |id| f.import_id == id)
            })
            .cloned())
    }

    async fn stalled_files(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> IngestResult<Vec<ImportFile>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<ImportFile> = tables
            .files
            .values()
            .filter(|f| f.status == FileStatus::Processing && f.updated_at < older_than)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn insert_attempt(&self, import_id: Uuid) -> IngestResult<ImportAttempt> {
        let mut tables = self.tables.lock().await;
        if !tables.imports.contains_key(&import_id) {
            return Err(IngestError::not_found("import", import_id));
        }
        if let Some(active) = tables
            .attempts
            .values()
            .find(|a| a.import_id == import_id && !a.status.is_terminal())
        {
            return Err(IngestError::conflict(format!(
                "import {import_id} already has unfinished attempt {}",
                active.id
            )));
        }

        tables.last_attempt_id += 1;
        let attempt = ImportAttempt {
            id: tables.last_attempt_id,
            import_id,
            started_at: None,
            ended_at: None,
            status: AttemptStatus::Pending,
            error_summary: None,
        };
        tables.attempts.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    async fn get_attempt(&self, id: i64) -> IngestResult<Option<ImportAttempt>> {
        Ok(self.tables.lock().await.attempts.get(&id).cloned())
    }

    async fn list_attempts(
        &self,
        query: &AttemptQuery,
        page: &PaginationParams,
    ) -> IngestResult<(Vec<ImportAttempt>, i64)> {
        let tables = self.tables.lock().await;
        let rows: Vec<&ImportAttempt> = tables
            .attempts
            .values()
            .filter(|a| query.import_id.map_or(true, |id| a.import_id == id))
            .filter(|a| query.status.map_or(true, |s| a.status == s))
            .collect();
        Ok(page_of(rows, page))
    }

    async fn apply_attempt_change(
        &self,
        id: i64,
        change: &AttemptChange,
    ) -> IngestResult<Option<ImportAttempt>> {
        let mut tables = self.tables.lock().await;
        let Some(attempt) = tables.attempts.get_mut(&id) else {
            return Ok(None);
        };
        if !change.event.sources().contains(&attempt.status) {
            return Ok(None);
        }

        let now = Utc::now();
        attempt.status = change.event.target();
        if change.event.ends_attempt() {
            attempt.ended_at = Some(now);
        } else {
            attempt.started_at = Some(now);
        }
        if change.error_summary.is_some() {
            attempt.error_summary = change.error_summary.clone();
        }
        Ok(Some(attempt.clone()))
    }

    async fn delete_attempt(&self, id: i64) -> IngestResult<DeleteOutcome> {
        let mut tables = self.tables.lock().await;
        match tables.attempts.get(&id) {
            None => Ok(DeleteOutcome::NotFound),
            Some(attempt) if !attempt.status.is_terminal() => Ok(DeleteOutcome::Blocked(
                format!("attempt {id} is {}", attempt.status),
            )),
            Some(_) => {
                tables.attempts.remove(&id);
                Ok(DeleteOutcome::Deleted)
            },
        }
    }
}
