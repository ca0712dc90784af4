//! Postgres-backed job store.
//!
//! Jobs live in the `lauda_processings` table with one JSONB column per stage.
//! Every transition runs in a transaction that locks the row (`SELECT ... FOR
//! UPDATE`), applies [`ProcessingJob::apply`] in memory and writes the result
//! back, so the lifecycle rules are identical to the in-memory store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (on insert) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use laudaflow_ai::JsonObject;
use laudaflow_core::{ExpectedVersion, JobId};

use super::store::{delete_conflict, stale_message, JobStore, JobStoreError};
use super::types::{JobFilter, JobPatch, JobStatus, JobSummary, Page, PageRequest, ProcessingJob};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS lauda_processings (
    id                  UUID PRIMARY KEY,
    lauda_content       TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'pending',
    stage1_result       JSONB NULL,
    stage2_result       JSONB NULL,
    stage3_result       JSONB NULL,
    final_layout        JSONB NULL,
    error_message       TEXT NULL,
    started_at          TIMESTAMPTZ NULL,
    completed_at        TIMESTAMPTZ NULL,
    processing_time_ms  BIGINT NULL,
    attempt             INTEGER NOT NULL DEFAULT 1,
    lease_expires_at    TIMESTAMPTZ NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS lauda_processings_status_idx ON lauda_processings (status)",
    "CREATE INDEX IF NOT EXISTS lauda_processings_started_at_idx ON lauda_processings (started_at DESC)",
];

const JOB_COLUMNS: &str = "id, lauda_content, status, stage1_result, stage2_result, stage3_result, \
     final_layout, error_message, started_at, completed_at, processing_time_ms, attempt, \
     lease_expires_at, created_at, updated_at";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create the table and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        for statement in CREATE_INDEXES {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool.begin().await.map_err(|e| map_sqlx_error(operation, e))
    }
}

async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    id: JobId,
) -> Result<Option<ProcessingJob>, JobStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM lauda_processings WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_job", e))?;

    row.map(|r| decode_job(&r)).transpose()
}

/// Write every mutable column of `job` back to its row.
async fn save_job(tx: &mut Transaction<'_, Postgres>, job: &ProcessingJob) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE lauda_processings SET
            status = $2,
            stage1_result = $3,
            stage2_result = $4,
            stage3_result = $5,
            final_layout = $6,
            error_message = $7,
            started_at = $8,
            completed_at = $9,
            processing_time_ms = $10,
            attempt = $11,
            lease_expires_at = $12,
            updated_at = $13
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.stage1_result.clone().map(JsonValue::Object))
    .bind(job.stage2_result.clone().map(JsonValue::Object))
    .bind(job.stage3_result.clone().map(JsonValue::Object))
    .bind(job.final_layout.clone().map(JsonValue::Object))
    .bind(job.error_message.as_deref())
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.processing_duration_ms)
    .bind(attempt_to_db(job.attempt))
    .bind(job.lease_expires_at)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("save_job", e))?;
    Ok(())
}

fn attempt_to_db(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {}", operation)),
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    lauda_content: String,
    status: String,
    stage1_result: Option<JsonValue>,
    stage2_result: Option<JsonValue>,
    stage3_result: Option<JsonValue>,
    final_layout: Option<JsonValue>,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    processing_time_ms: Option<i64>,
    attempt: i32,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            lauda_content: row.try_get("lauda_content")?,
            status: row.try_get("status")?,
            stage1_result: row.try_get("stage1_result")?,
            stage2_result: row.try_get("stage2_result")?,
            stage3_result: row.try_get("stage3_result")?,
            final_layout: row.try_get("final_layout")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            processing_time_ms: row.try_get("processing_time_ms")?,
            attempt: row.try_get("attempt")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for ProcessingJob {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(ProcessingJob {
            id: JobId::from_uuid(row.id),
            content: row.lauda_content,
            status: parse_status(&row.status)?,
            stage1_result: json_column("stage1_result", row.stage1_result)?,
            stage2_result: json_column("stage2_result", row.stage2_result)?,
            stage3_result: json_column("stage3_result", row.stage3_result)?,
            final_layout: json_column("final_layout", row.final_layout)?,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
            processing_duration_ms: row.processing_time_ms,
            attempt: u32::try_from(row.attempt).unwrap_or(0),
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<ProcessingJob, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {}", e)))?
        .try_into()
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|_| JobStoreError::Storage(format!("unknown status in database: {raw}")))
}

fn json_column(column: &str, value: Option<JsonValue>) -> Result<Option<JsonObject>, JobStoreError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Object(map)) => Ok(Some(map)),
        Some(_) => Err(JobStoreError::Storage(format!("{column} is not a JSON object"))),
    }
}

fn decode_summary(row: &sqlx::postgres::PgRow) -> Result<JobSummary, JobStoreError> {
    let read = |e: sqlx::Error| JobStoreError::Storage(format!("failed to deserialize job summary: {}", e));
    let id: Uuid = row.try_get("id").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;

    Ok(JobSummary {
        id: JobId::from_uuid(id),
        status: parse_status(&status)?,
        error_message: row.try_get("error_message").map_err(read)?,
        started_at: row.try_get("started_at").map_err(read)?,
        completed_at: row.try_get("completed_at").map_err(read)?,
        processing_duration_ms: row.try_get("processing_time_ms").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, job: &ProcessingJob) -> Result<JobId, JobStoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO lauda_processings ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(job.id.as_uuid())
        .bind(&job.content)
        .bind(job.status.as_str())
        .bind(job.stage1_result.clone().map(JsonValue::Object))
        .bind(job.stage2_result.clone().map(JsonValue::Object))
        .bind(job.stage3_result.clone().map(JsonValue::Object))
        .bind(job.final_layout.clone().map(JsonValue::Object))
        .bind(job.error_message.as_deref())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.processing_duration_ms)
        .bind(attempt_to_db(job.attempt))
        .bind(job.lease_expires_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(e) if is_unique_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("create", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<ProcessingJob, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM lauda_processings WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self, patch), fields(job_id = %id, patch = patch.kind()))]
    async fn update(&self, id: JobId, expected: ExpectedVersion, patch: JobPatch) -> Result<ProcessingJob, JobStoreError> {
        let mut tx = self.begin("update").await?;

        let mut job = lock_job(&mut tx, id).await?.ok_or(JobStoreError::NotFound(id))?;
        // A rejected transition drops `tx`, which rolls the lock back.
        job.apply(expected, &patch, Utc::now())?;
        save_job(&mut tx, &job).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("update", e))?;
        debug!(status = %job.status, attempt = job.attempt, "job updated");
        Ok(job)
    }

    async fn list(&self, filter: JobFilter, page: PageRequest) -> Result<Page<JobSummary>, JobStoreError> {
        let status_param: Option<&str> = filter.status.as_ref().map(JobStatus::as_str);

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM lauda_processings
            WHERE ($1::text IS NULL OR status = $1)
            "#,
        )
        .bind(status_param)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| JobStoreError::Storage(format!("failed to read count: {}", e)))?;

        let rows = sqlx::query(
            r#"
            SELECT id, status, error_message, started_at, completed_at, processing_time_ms, created_at, updated_at
            FROM lauda_processings
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY started_at DESC NULLS LAST, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status_param)
        .bind(i64::from(page.page_size))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let items = rows.iter().map(decode_summary).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total.max(0) as u64, page))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        let mut tx = self.begin("delete").await?;

        let job = lock_job(&mut tx, id).await?.ok_or(JobStoreError::NotFound(id))?;
        if job.status == JobStatus::Processing {
            return Err(delete_conflict(id));
        }

        sqlx::query("DELETE FROM lauda_processings WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("delete", e))
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<Vec<ProcessingJob>, JobStoreError> {
        let mut tx = self.begin("reclaim_stale").await?;

        // Rows locked by an in-flight update belong to a live runner; skip them.
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM lauda_processings \
             WHERE status = 'processing' AND (lease_expires_at IS NULL OR lease_expires_at <= $1) \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = decode_job(row)?;
            let run = ExpectedVersion::Exact(job.attempt);
            let patch = JobPatch::Fail {
                message: stale_message(&job),
            };
            job.apply(run, &patch, now)?;
            save_job(&mut tx, &job).await?;
            reclaimed.push(job);
        }

        tx.commit().await.map_err(|e| map_sqlx_error("reclaim_stale", e))?;
        Ok(reclaimed)
    }
}
