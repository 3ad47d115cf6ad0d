//! PostgreSQL store
//!
//! Status changes are single conditional `UPDATE ... WHERE status = ANY(...)`
//! statements; anything that also touches batch counters runs in the same
//! transaction. Claims lock candidate rows with `FOR UPDATE SKIP LOCKED`, so
//! concurrent workers split the queue instead of waiting on each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intake_common::Sha256Digest;
use sqlx::postgres::{PgExecutor, PgPool};
use sqlx::FromRow;
use uuid::Uuid;

use super::{AttemptQuery, ClaimGate, CountScope, DeleteOutcome, FileQuery, IngestStore};
use crate::error::{IngestError, IngestResult};
use crate::models::{
    AttemptStatus, Batch, BatchStatus, FileStatus, FileStatusCounts, Import, ImportAttempt,
    ImportFile, NewBatch, NewFileRecord,
};
use crate::shared::PaginationParams;
use crate::state_machine::{AttemptChange, FileChange};

const BATCH_COLUMNS: &str = "b.id, b.source_system, b.created_by, b.manifest_sha256, b.status, \
     b.file_count_expected, b.file_count_discovered, b.file_count_ingested, b.metadata, \
     b.created_at, b.updated_at";

const IMPORT_COLUMNS: &str = "i.id, i.batch_id, i.cancelled_at, i.created_at";

const FILE_COLUMNS: &str = "f.id, f.import_id, f.path, f.size_bytes, f.sha256, f.status, \
     f.ingested_at, f.attempt_count, f.last_error, f.created_at, f.updated_at";

const ATTEMPT_COLUMNS: &str =
    "a.id, a.import_id, a.started_at, a.ended_at, a.status, a.error_summary";

const UNIQUE_VIOLATION: &str = "23505";

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
struct BatchRow {
    id: Uuid,
    source_system: Option<String>,
    created_by: Option<String>,
    manifest_sha256: Option<Vec<u8>>,
    status: i16,
    file_count_expected: Option<i64>,
    file_count_discovered: i64,
    file_count_ingested: i64,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = IngestError;

    fn try_from(row: BatchRow) -> IngestResult<Self> {
        Ok(Self {
            id: row.id,
            source_system: row.source_system,
            created_by: row.created_by,
            manifest_sha256: row
                .manifest_sha256
                .map(Sha256Digest::try_from)
                .transpose()
                .map_err(decode_error)?,
            status: BatchStatus::from_code(row.status).map_err(decode_error)?,
            file_count_expected: row.file_count_expected,
            file_count_discovered: row.file_count_discovered,
            file_count_ingested: row.file_count_ingested,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ImportRow {
    id: Uuid,
    batch_id: Option<Uuid>,
    cancelled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<ImportRow> for Import {
    fn from(row: ImportRow) -> Self {
        Self {
            id: row.id,
            batch_id: row.batch_id,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ClaimGateRow {
    #[sqlx(flatten)]
    import: ImportRow,
    batch_status: Option<i16>,
}

#[derive(Debug, FromRow)]
struct FileRow {
    id: i64,
    import_id: Uuid,
    path: String,
    size_bytes: Option<i64>,
    sha256: Vec<u8>,
    status: i16,
    ingested_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for ImportFile {
    type Error = IngestError;

    fn try_from(row: FileRow) -> IngestResult<Self> {
        Ok(Self {
            id: row.id,
            import_id: row.import_id,
            path: row.path,
            size_bytes: row.size_bytes,
            sha256: Sha256Digest::try_from(row.sha256).map_err(decode_error)?,
            status: FileStatus::from_code(row.status).map_err(decode_error)?,
            ingested_at: row.ingested_at,
            attempt_count: row.attempt_count,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AttemptRow {
    id: i64,
    import_id: Uuid,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    status: i16,
    error_summary: Option<String>,
}

impl TryFrom<AttemptRow> for ImportAttempt {
    type Error = IngestError;

    fn try_from(row: AttemptRow) -> IngestResult<Self> {
        Ok(Self {
            id: row.id,
            import_id: row.import_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            status: AttemptStatus::from_code(row.status).map_err(decode_error)?,
            error_summary: row.error_summary,
        })
    }
}

/// A column value the models cannot represent
fn decode_error<E>(err: E) -> IngestError
where
    E: std::error::Error + Send + Sync + 'static,
{
    IngestError::Storage(sqlx::Error::Decode(Box::new(err)))
}

fn convert_all<R, T>(rows: Vec<R>) -> IngestResult<Vec<T>>
where
    T: TryFrom<R, Error = IngestError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

fn codes<S: Copy>(statuses: &[S], code: impl Fn(S) -> i16) -> Vec<i16> {
    statuses.iter().map(|s| code(*s)).collect()
}

/// Recomputes both batch counters from one snapshot of its files
async fn recount<'e, E: PgExecutor<'e>>(executor: E, batch_id: Uuid) -> IngestResult<Option<Batch>> {
    let sql = format!(
        r#"
        UPDATE batches b
        SET file_count_discovered = c.discovered,
            file_count_ingested = c.ingested,
            updated_at = NOW()
        FROM (
            SELECT COUNT(f.id) AS discovered,
                   COUNT(f.id) FILTER (WHERE f.status IN (3, 5)) AS ingested
            FROM imports i
            JOIN import_files f ON f.import_id = i.id
            WHERE i.batch_id = $1
        ) c
        WHERE b.id = $1
        RETURNING {BATCH_COLUMNS}
        "#
    );
    sqlx::query_as::<_, BatchRow>(&sql)
        .bind(batch_id)
        .fetch_optional(executor)
        .await?
        .map(Batch::try_from)
        .transpose()
}

/// Adds deltas to the counters of the batch owning `import_id`, if any
async fn adjust_counters<'e, E: PgExecutor<'e>>(
    executor: E,
    import_id: Uuid,
    discovered: i64,
    ingested: i64,
) -> IngestResult<()> {
    sqlx::query(
        r#"
        UPDATE batches b
        SET file_count_discovered = b.file_count_discovered + $2,
            file_count_ingested = b.file_count_ingested + $3,
            updated_at = NOW()
        FROM imports i
        WHERE i.id = $1 AND b.id = i.batch_id
        "#,
    )
    .bind(import_id)
    .bind(discovered)
    .bind(ingested)
    .execute(executor)
    .await?;
    Ok(())
}

/// Store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn insert_batch(&self, batch: NewBatch) -> IngestResult<Batch> {
        let sql = format!(
            r#"
            INSERT INTO batches AS b
                (id, source_system, created_by, manifest_sha256, file_count_expected, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {BATCH_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, BatchRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(batch.source_system)
            .bind(batch.created_by)
            .bind(batch.manifest_sha256.map(|d| d.as_bytes().to_vec()))
            .bind(batch.file_count_expected)
            .bind(batch.metadata)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_batch(&self, id: Uuid) -> IngestResult<Option<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches b WHERE b.id = $1");
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Batch::try_from)
            .transpose()
    }

    async fn list_batches(
        &self,
        status: Option<BatchStatus>,
        page: &PaginationParams,
    ) -> IngestResult<(Vec<Batch>, i64)> {
        let status = status.map(BatchStatus::code);
        let sql = format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM batches b
            WHERE ($1::smallint IS NULL OR b.status = $1)
            ORDER BY b.created_at DESC, b.id
            LIMIT $2 OFFSET $3
            "#
        );
        let rows = sqlx::query_as::<_, BatchRow>(&sql)
            .bind(status)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM batches WHERE ($1::smallint IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((convert_all(rows)?, total))
    }

    async fn set_expected_count(&self, id: Uuid, expected: i64) -> IngestResult<Option<Batch>> {
        let sql = format!(
            r#"
            UPDATE batches b
            SET file_count_expected = $2, updated_at = NOW()
            WHERE b.id = $1 AND b.file_count_discovered <= $2
            RETURNING {BATCH_COLUMNS}
            "#
        );
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(id)
            .bind(expected)
            .fetch_optional(&self.pool)
            .await?
            .map(Batch::try_from)
            .transpose()
    }

    async fn update_batch_status(
        &self,
        id: Uuid,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> IngestResult<Option<Batch>> {
        let sql = format!(
            r#"
            UPDATE batches b
            SET status = $3, updated_at = NOW()
            WHERE b.id = $1 AND b.status = ANY($2)
            RETURNING {BATCH_COLUMNS}
            "#
        );
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(id)
            .bind(codes(from, BatchStatus::code))
            .bind(to.code())
            .fetch_optional(&self.pool)
            .await?
            .map(Batch::try_from)
            .transpose()
    }

    async fn recount_batch(&self, id: Uuid) -> IngestResult<Option<Batch>> {
        recount(&self.pool, id).await
    }

    async fn insert_import(&self, batch_id: Option<Uuid>) -> IngestResult<Import> {
        if let Some(batch_id) = batch_id {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM batches WHERE id = $1)")
                .bind(batch_id)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                return Err(IngestError::not_found("batch", batch_id));
            }
        }

        let sql = format!(
            "INSERT INTO imports AS i (id, batch_id) VALUES ($1, $2) RETURNING {IMPORT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ImportRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(batch_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn get_import(&self, id: Uuid) -> IngestResult<Option<Import>> {
        let sql = format!("SELECT {IMPORT_COLUMNS} FROM imports i WHERE i.id = $1");
        let row = sqlx::query_as::<_, ImportRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Import::from))
    }

    async fn cancel_import(&self, id: Uuid) -> IngestResult<Option<Import>> {
        let sql = format!(
            r#"
            UPDATE imports i
            SET cancelled_at = COALESCE(i.cancelled_at, NOW())
            WHERE i.id = $1
            RETURNING {IMPORT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, ImportRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Import::from))
    }

    async fn delete_import(&self, id: Uuid) -> IngestResult<DeleteOutcome> {
        let mut tx = self.pool.begin().await?;

        let batch_id: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT batch_id FROM imports WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(batch_id) = batch_id else {
            return Ok(DeleteOutcome::NotFound);
        };

        let processing: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM import_files WHERE import_id = $1 AND status = 2)",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if processing {
            return Ok(DeleteOutcome::Blocked(format!("import {id} has files in processing")));
        }

        let active_attempt: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM import_attempts WHERE import_id = $1 AND status IN (0, 1))",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if active_attempt {
            return Ok(DeleteOutcome::Blocked(format!("import {id} has an unfinished attempt")));
        }

        sqlx::query("DELETE FROM imports WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if let Some(batch_id) = batch_id {
            recount(&mut *tx, batch_id).await?;
        }

        tx.commit().await?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn claim_gate(&self, import_id: Uuid) -> IngestResult<Option<ClaimGate>> {
        let sql = format!(
            r#"
            SELECT {IMPORT_COLUMNS}, b.status AS batch_status
            FROM imports i
            LEFT JOIN batches b ON b.id = i.batch_id
            WHERE i.id = $1
            "#
        );
        let Some(row) = sqlx::query_as::<_, ClaimGateRow>(&sql)
            .bind(import_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(ClaimGate {
            import: row.import.into(),
            batch_status: row
                .batch_status
                .map(BatchStatus::from_code)
                .transpose()
                .map_err(decode_error)?,
        }))
    }

    async fn insert_file(&self, file: NewFileRecord) -> IngestResult<ImportFile> {
        let mut tx = self.pool.begin().await?;

        let batch_id: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT batch_id FROM imports WHERE id = $1 FOR SHARE")
                .bind(file.import_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(batch_id) = batch_id else {
            return Err(IngestError::not_found("import", file.import_id));
        };

        if let Some(batch_id) = batch_id {
            let counted = sqlx::query(
                r#"
                UPDATE batches
                SET file_count_discovered = file_count_discovered + 1, updated_at = NOW()
                WHERE id = $1
                  AND status IN (0, 1)
                  AND (file_count_expected IS NULL OR file_count_discovered < file_count_expected)
                "#,
            )
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
            if counted.rows_affected() == 0 {
                return Err(IngestError::conflict(format!(
                    "batch {batch_id} is settled or already holds its expected number of files"
                )));
            }
        }

        let sql = format!(
            r#"
            INSERT INTO import_files AS f (import_id, path, size_bytes, sha256)
            VALUES ($1, $2, $3, $4)
            RETURNING {FILE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, FileRow>(&sql)
            .bind(file.import_id)
            .bind(&file.path)
            .bind(file.size_bytes)
            .bind(file.sha256.as_bytes().as_slice())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn get_file(&self, id: i64) -> IngestResult<Option<ImportFile>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM import_files f WHERE f.id = $1");
        sqlx::query_as::<_, FileRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ImportFile::try_from)
            .transpose()
    }

    async fn list_files(
        &self,
        query: &FileQuery,
        page: &PaginationParams,
    ) -> IngestResult<(Vec<ImportFile>, i64)> {
        const FILTER: &str = r#"
            ($1::uuid IS NULL OR f.import_id = $1)
            AND ($2::smallint IS NULL OR f.status = $2)
            AND ($3::bytea IS NULL OR f.sha256 = $3)
        "#;
        let status = query.status.map(FileStatus::code);
        let sha256 = query.sha256.map(|d| d.as_bytes().to_vec());

        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM import_files f WHERE {FILTER} \
             ORDER BY f.id LIMIT $4 OFFSET $5"
        );
        let rows = sqlx::query_as::<_, FileRow>(&sql)
            .bind(query.import_id)
            .bind(status)
            .bind(sha256.clone())
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        let count_sql = format!("SELECT COUNT(*) FROM import_files f WHERE {FILTER}");
        let total: i64 = sqlx::query_scalar(&count_sql)
            .bind(query.import_id)
            .bind(status)
            .bind(sha256)
            .fetch_one(&self.pool)
            .await?;

        Ok((convert_all(rows)?, total))
    }

    async fn apply_file_change(
        &self,
        id: i64,
        change: &FileChange,
    ) -> IngestResult<Option<ImportFile>> {
        let event = change.event;
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE import_files f
            SET status = $2,
                ingested_at = CASE WHEN $3 THEN clock_timestamp() ELSE f.ingested_at END,
                last_error = CASE WHEN $4 THEN $5 ELSE f.last_error END,
                attempt_count = f.attempt_count + $6,
                updated_at = clock_timestamp()
            WHERE f.id = $1 AND f.status = ANY($7)
            RETURNING {FILE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, FileRow>(&sql)
            .bind(id)
            .bind(event.target().code())
            .bind(event.sets_ingested_at())
            .bind(event.records_error())
            .bind(change.message.as_deref())
            .bind(i32::from(event.increments_attempts()))
            .bind(change.source_codes())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        if event.target().counts_as_ingested() {
            adjust_counters(&mut *tx, row.import_id, 0, 1).await?;
        }

        tx.commit().await?;
        row.try_into().map(Some)
    }

    async fn delete_file(&self, id: i64) -> IngestResult<DeleteOutcome> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(Uuid, i16)> =
            sqlx::query_as("SELECT import_id, status FROM import_files WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((import_id, status)) = current else {
            return Ok(DeleteOutcome::NotFound);
        };
        let status = FileStatus::from_code(status).map_err(decode_error)?;
        if status == FileStatus::Processing {
            return Ok(DeleteOutcome::Blocked(format!("file {id} is processing")));
        }

        sqlx::query("DELETE FROM import_files WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let ingested = if status.counts_as_ingested() { -1 } else { 0 };
        adjust_counters(&mut *tx, import_id, -1, ingested).await?;

        tx.commit().await?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn claim_files(&self, import_id: Uuid, limit: i64) -> IngestResult<Vec<ImportFile>> {
        let mut tx = self.pool.begin().await?;

        // Status literals keep the planner on idx_import_files_queue.
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT f.id
                FROM import_files f
                WHERE f.import_id = $1
                  AND f.status IN (0, 1)
                  AND EXISTS (
                      SELECT 1
                      FROM imports i
                      LEFT JOIN batches b ON b.id = i.batch_id
                      WHERE i.id = f.import_id
                        AND i.cancelled_at IS NULL
                        AND (b.id IS NULL OR b.status IN (0, 1))
                  )
                ORDER BY f.created_at, f.id
                LIMIT $2
                FOR UPDATE OF f SKIP LOCKED
            )
            UPDATE import_files f
            SET status = 2, updated_at = clock_timestamp()
            FROM candidates c
            WHERE f.id = c.id AND f.status IN (0, 1)
            RETURNING {FILE_COLUMNS}
            "#
        );
        let rows = sqlx::query_as::<_, FileRow>(&sql)
            .bind(import_id)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        if !rows.is_empty() {
            sqlx::query(
                r#"
                UPDATE batches b
                SET status = 1, updated_at = NOW()
                FROM imports i
                WHERE i.id = $1 AND b.id = i.batch_id AND b.status = 0
                "#,
            )
            .bind(import_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let mut claimed: Vec<ImportFile> = convert_all(rows)?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn active_files(&self, import_id: Uuid) -> IngestResult<Vec<ImportFile>> {
        let sql = format!(
            r#"
            SELECT {FILE_COLUMNS}
            FROM import_files f
            WHERE f.import_id = $1 AND f.status IN (0, 1, 2)
            ORDER BY f.created_at, f.id
            "#
        );
        let rows = sqlx::query_as::<_, FileRow>(&sql)
            .bind(import_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn count_files(
        &self,
        scope: CountScope,
        retry_ceiling: i32,
    ) -> IngestResult<FileStatusCounts> {
        let (sql, id) = match scope {
            CountScope::Import(id) => (
                r#"
                SELECT f.status, COUNT(*),
                       COUNT(*) FILTER (WHERE f.status = 4 AND f.attempt_count >= $2)
                FROM import_files f
                WHERE f.import_id = $1
                GROUP BY f.status
                "#,
                id,
            ),
            CountScope::Batch(id) => (
                r#"
                SELECT f.status, COUNT(*),
                       COUNT(*) FILTER (WHERE f.status = 4 AND f.attempt_count >= $2)
                FROM imports i
                JOIN import_files f ON f.import_id = i.id
                WHERE i.batch_id = $1
                GROUP BY f.status
                "#,
                id,
            ),
        };

        let rows: Vec<(i16, i64, i64)> = sqlx::query_as(sql)
            .bind(id)
            .bind(retry_ceiling)
            .fetch_all(&self.pool)
            .await?;

        let mut counts = FileStatusCounts::default();
        for (status, count, exhausted) in rows {
            counts.add(FileStatus::from_code(status).map_err(decode_error)?, count);
            counts.failed_exhausted += exhausted;
        }
        Ok(counts)
    }

    async fn find_ingested_by_hash(
        &self,
        sha256: &Sha256Digest,
        import_id: Option<Uuid>,
        exclude_id: i64,
    ) -> IngestResult<Option<ImportFile>> {
        let sql = format!(
            r#"
            SELECT {FILE_COLUMNS}
            FROM import_files f
            WHERE f.sha256 = $1
              AND f.status = 3
              AND f.id <> $3
              AND ($2::uuid IS NULL OR f.import_id = $2)
            ORDER BY f.id
            LIMIT 1
            "#
        );
        sqlx::query_as::<_, FileRow>(&sql)
            .bind(sha256.as_bytes().as_slice())
            .bind(import_id)
            .bind(exclude_id)
            .fetch_optional(&self.pool)
            .await?
            .map(ImportFile::try_from)
            .transpose()
    }

    async fn stalled_files(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> IngestResult<Vec<ImportFile>> {
        let sql = format!(
            r#"
            SELECT {FILE_COLUMNS}
            FROM import_files f
            WHERE f.status = 2 AND f.updated_at < $1
            ORDER BY f.updated_at, f.id
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, FileRow>(&sql)
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn insert_attempt(&self, import_id: Uuid) -> IngestResult<ImportAttempt> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM imports WHERE id = $1)")
            .bind(import_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(IngestError::not_found("import", import_id));
        }

        let sql = format!(
            "INSERT INTO import_attempts AS a (import_id) VALUES ($1) RETURNING {ATTEMPT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(import_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    IngestError::conflict(format!(
                        "import {import_id} already has an unfinished attempt"
                    ))
                } else {
                    IngestError::from(e)
                }
            })?;
        row.try_into()
    }

    async fn get_attempt(&self, id: i64) -> IngestResult<Option<ImportAttempt>> {
        let sql = format!("SELECT {ATTEMPT_COLUMNS} FROM import_attempts a WHERE a.id = $1");
        sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ImportAttempt::try_from)
            .transpose()
    }

    async fn list_attempts(
        &self,
        query: &AttemptQuery,
        page: &PaginationParams,
    ) -> IngestResult<(Vec<ImportAttempt>, i64)> {
        const FILTER: &str = r#"
            ($1::uuid IS NULL OR a.import_id = $1)
            AND ($2::smallint IS NULL OR a.status = $2)
        "#;
        let status = query.status.map(AttemptStatus::code);

        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM import_attempts a WHERE {FILTER} \
             ORDER BY a.id LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(query.import_id)
            .bind(status)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        let count_sql = format!("SELECT COUNT(*) FROM import_attempts a WHERE {FILTER}");
        let total: i64 = sqlx::query_scalar(&count_sql)
            .bind(query.import_id)
            .bind(status)
            .fetch_one(&self.pool)
            .await?;

        Ok((convert_all(rows)?, total))
    }

    async fn apply_attempt_change(
        &self,
        id: i64,
        change: &AttemptChange,
    ) -> IngestResult<Option<ImportAttempt>> {
        let ends = change.event.ends_attempt();
        let sql = format!(
            r#"
            UPDATE import_attempts a
            SET status = $2,
                started_at = CASE WHEN $3 THEN NOW() ELSE a.started_at END,
                ended_at = CASE WHEN $4 THEN NOW() ELSE a.ended_at END,
                error_summary = COALESCE($5, a.error_summary)
            WHERE a.id = $1 AND a.status = ANY($6)
            RETURNING {ATTEMPT_COLUMNS}
            "#
        );
        sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(id)
            .bind(change.event.target().code())
            .bind(!ends)
            .bind(ends)
            .bind(change.error_summary.as_deref())
            .bind(change.source_codes())
            .fetch_optional(&self.pool)
            .await?
            .map(ImportAttempt::try_from)
            .transpose()
    }

    async fn delete_attempt(&self, id: i64) -> IngestResult<DeleteOutcome> {
        let deleted = sqlx::query("DELETE FROM import_attempts WHERE id = $1 AND status IN (2, 3, 4)")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() > 0 {
            return Ok(DeleteOutcome::Deleted);
        }

        let status: Option<i16> = sqlx::query_scalar("SELECT status FROM import_attempts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match status {
            None => Ok(DeleteOutcome::NotFound),
            Some(code) => {
                let status = AttemptStatus::from_code(code).map_err(decode_error)?;
                Ok(DeleteOutcome::Blocked(format!("attempt {id} is {status}")))
            },
        }
    }
}
