//! Postgres-backed job store.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::*;
use crate::store::JobStore;

const JOB_COLUMNS: &str = "job_id, job_type, status, payload, result, error, attempts, max_attempts, priority, idempotency_key, owner_id, created_at, updated_at, started_at, completed_at";

#[async_trait]
impl JobStore for super::Db {
    async fn create(&self, record: &JobRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (job_id, job_type, status, payload, result, error, attempts, max_attempts, priority, idempotency_key, owner_id, created_at, updated_at, started_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(record.job_id.0)
        .bind(record.job_type.as_str())
        .bind(record.status.as_str())
        .bind(&record.payload)
        .bind(&record.result)
        .bind(&record.error)
        .bind(record.attempts as i32)
        .bind(record.max_attempts as i32)
        .bind(record.priority)
        .bind(&record.idempotency_key)
        .bind(record.owner_id.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
        row.map(JobRow::try_into_record).transpose()
    }

    async fn get_for_owner(&self, id: JobId, owner: &OwnerId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1 AND owner_id = $2"
        ))
        .bind(id.0)
        .bind(owner.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.map(JobRow::try_into_record).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        owner: &OwnerId,
        key: &str,
    ) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE owner_id = $1 AND idempotency_key = $2
             ORDER BY created_at ASC, seq ASC
             LIMIT 1"
        ))
        .bind(owner.as_str())
        .bind(key)
        .fetch_optional(self.pool())
        .await?;
        row.map(JobRow::try_into_record).transpose()
    }

    async fn list(
        &self,
        owner: &OwnerId,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<(Vec<JobRecord>, u64)> {
        let status = filter.status.map(JobStatus::as_str);
        let job_type = filter.job_type.as_ref().map(JobType::as_str);

        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE owner_id = $1
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR job_type = $3)
             ORDER BY created_at DESC, seq DESC
             LIMIT $4 OFFSET $5"
        ))
        .bind(owner.as_str())
        .bind(status)
        .bind(job_type)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(self.pool())
        .await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs
             WHERE owner_id = $1
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR job_type = $3)",
        )
        .bind(owner.as_str())
        .bind(status)
        .bind(job_type)
        .fetch_one(self.pool())
        .await?;

        let jobs = rows
            .into_iter()
            .map(JobRow::try_into_record)
            .collect::<Result<Vec<_>>>()?;
        Ok((jobs, total.0 as u64))
    }

    async fn update(
        &self,
        id: JobId,
        expect: Option<JobStatus>,
        update: &JobUpdate,
    ) -> Result<Option<JobRecord>> {
        // Each nullable column gets a "touch" flag so that clearing a value
        // (Some(None)) is distinct from leaving it alone (None). $13 lists
        // the statuses the lifecycle lets this update start from.
        let sources: Option<Vec<String>> = update.allowed_sources().map(|statuses| {
            statuses.into_iter().map(|s| s.as_str().to_owned()).collect()
        });
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET
                status       = COALESCE($2::text, status),
                result       = CASE WHEN $3 THEN $4::jsonb ELSE result END,
                error        = CASE WHEN $5 THEN $6::text ELSE error END,
                attempts     = COALESCE($7::int, attempts),
                started_at   = CASE WHEN $8 THEN $9::timestamptz ELSE started_at END,
                completed_at = CASE WHEN $10 THEN $11::timestamptz ELSE completed_at END,
                updated_at   = now()
             WHERE job_id = $1
               AND ($12::text IS NULL OR status = $12)
               AND ($13::text[] IS NULL OR status = ANY($13))
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.0)
        .bind(update.status.map(JobStatus::as_str))
        .bind(update.result.is_some())
        .bind(update.result.clone().flatten())
        .bind(update.error.is_some())
        .bind(update.error.clone().flatten())
        .bind(update.attempts.map(|n| n as i32))
        .bind(update.started_at.is_some())
        .bind(update.started_at.flatten())
        .bind(update.completed_at.is_some())
        .bind(update.completed_at.flatten())
        .bind(expect.map(JobStatus::as_str))
        .bind(sources)
        .fetch_optional(self.pool())
        .await?;
        row.map(JobRow::try_into_record).transpose()
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(id.0)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn count_by_status(&self, owner: &OwnerId) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE owner_id = $1 GROUP BY status",
        )
        .bind(owner.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|(status, n)| -> Result<(JobStatus, u64)> { Ok((status.parse()?, n as u64)) })
            .collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    job_type: String,
    status: String,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<String>,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    idempotency_key: Option<String>,
    owner_id: String,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl JobRow {
    fn try_into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            job_id: JobId(self.job_id),
            job_type: JobType(self.job_type),
            status: self.status.parse()?,
            payload: self.payload,
            result: self.result,
            error: self.error,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            priority: self.priority,
            idempotency_key: self.idempotency_key,
            owner_id: OwnerId(self.owner_id),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
