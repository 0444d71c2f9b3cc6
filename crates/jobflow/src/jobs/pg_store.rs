// crates/jobflow/src/jobs/pg_store.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::jobs::model::{Job, JobResult, JobStatus, UnknownStatus};
use crate::jobs::store::{JobStore, StoreError};

fn parse_status(s: &str) -> Result<JobStatus, StoreError> {
    s.parse().map_err(|e: UnknownStatus| StoreError::Corrupt(e.to_string()))
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = parse_status(&row.status)?;
        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            payload: row.payload,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ResultRow {
    job_id: Uuid,
    status: String,
    result: Option<Value>,
    error: Option<String>,
    completed_at: DateTime<Utc>,
}

impl TryFrom<ResultRow> for JobResult {
    type Error = StoreError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let status = parse_status(&row.status)?;
        Ok(JobResult {
            job_id: row.job_id,
            status,
            result: row.result,
            error: row.error,
            completed_at: row.completed_at,
        })
    }
}

/// Postgres-backed job store.
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
impl JobStore for PgStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO jobflow_jobs
                (id, job_type, payload, status, attempts, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::Duplicate(job.id));
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobflow_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE jobflow_jobs
            SET status = $2,
                attempts = $3,
                max_attempts = $4,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::UnknownJob(job.id));
        }
        Ok(())
    }

    async fn put_result(&self, result: &JobResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobflow_results (job_id, status, result, error, completed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO UPDATE
            SET status = EXCLUDED.status,
                result = EXCLUDED.result,
                error = EXCLUDED.error,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(result.job_id)
        .bind(result.status.as_str())
        .bind(&result.result)
        .bind(&result.error)
        .bind(result.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<JobResult>, StoreError> {
        let row = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT job_id, status, result, error, completed_at
            FROM jobflow_results
            WHERE job_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobResult::try_from).transpose()
    }

    async fn list_by_type(
        &self,
        job_type: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = match status {
            Some(st) => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT *
                    FROM jobflow_jobs
                    WHERE job_type = $1 AND status = $2
                    ORDER BY created_at ASC, id ASC
                    "#,
                )
                .bind(job_type)
                .bind(st.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT *
                    FROM jobflow_jobs
                    WHERE job_type = $1
                    ORDER BY created_at ASC, id ASC
                    "#,
                )
                .bind(job_type)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobflow_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out: Vec<(JobStatus, i64)> = JobStatus::ALL.iter().map(|st| (*st, 0)).collect();
        for (status, n) in rows {
            let st = parse_status(&status)?;
            if let Some(slot) = out.iter_mut().find(|(s, _)| *s == st) {
                slot.1 = n;
            }
        }
        Ok(out)
    }
}
