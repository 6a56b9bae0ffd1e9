//! Postgres-backed job store.
//!
//! The compare-and-swap guard is pushed into single-statement conditional
//! writes: `UPDATE ... WHERE id = $1 AND state NOT IN ('success','failed')`.
//! The statement is atomic at READ COMMITTED, so whichever observer's update
//! matches first wins and every other one affects zero rows; no SERIALIZABLE
//! isolation or advisory locking is required.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use lumagen_core::{
    GenerationError, GenerationResult, JobId, JobKind, JobState, ProviderTaskId, UserId,
};

use crate::store::{FinalizeOutcome, JobStore};
use crate::types::GenerationJob;

/// Durable job store over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

const JOB_COLUMNS: &str = "id, user_id, kind, model, request_params, provider_task_id, state, \
                           result_assets, failure_reason, credits_charged, created_at, updated_at, \
                           finalized_at";

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the job table when it does not exist yet.
    pub async fn ensure_schema(&self) -> GenerationResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS generation_jobs (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                kind TEXT NOT NULL,
                model TEXT NOT NULL,
                request_params JSONB NOT NULL DEFAULT '{}'::jsonb,
                provider_task_id TEXT,
                state TEXT NOT NULL,
                result_assets JSONB NOT NULL DEFAULT '[]'::jsonb,
                failure_reason TEXT,
                credits_charged BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                finalized_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS generation_jobs_task_id ON generation_jobs (provider_task_id)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS generation_jobs_state_updated ON generation_jobs (state, updated_at)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }

    async fn finalize_with(
        &self,
        job_id: JobId,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> GenerationResult<FinalizeOutcome> {
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finalize", e))?;

        match row {
            Some(row) => Ok(FinalizeOutcome::Finalized(job_from_row(&row)?)),
            None => {
                // Zero rows: either already terminal or genuinely missing.
                if self.get(job_id).await?.is_some() {
                    Ok(FinalizeOutcome::AlreadyTerminal)
                } else {
                    Err(GenerationError::NotFound)
                }
            }
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert(&self, job: GenerationJob) -> GenerationResult<()> {
        sqlx::query(
            r#"
            INSERT INTO generation_jobs
                (id, user_id, kind, model, request_params, provider_task_id, state,
                 result_assets, failure_reason, credits_charged, created_at, updated_at, finalized_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.kind.as_str())
        .bind(&job.model)
        .bind(&job.request_params)
        .bind(job.provider_task_id.as_ref().map(|t| t.as_str().to_string()))
        .bind(job.state.as_str())
        .bind(serde_json::json!(job.result_assets))
        .bind(&job.failure_reason)
        .bind(job.credits_charged)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.finalized_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> GenerationResult<Option<GenerationJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn find_by_task_id(&self, task_id: &str) -> GenerationResult<Option<GenerationJob>> {
        // Retries can leave duplicate rows with one task id; take the newest.
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE provider_task_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_task_id", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn set_provider_task(
        &self,
        job_id: JobId,
        task_id: &ProviderTaskId,
    ) -> GenerationResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET provider_task_id = $2, updated_at = now()
            WHERE id = $1 AND state NOT IN ('success', 'failed')
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(task_id.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_provider_task", e))?;

        if result.rows_affected() == 0 {
            if self.get(job_id).await?.is_some() {
                return Err(GenerationError::conflict("job already finalized"));
            }
            return Err(GenerationError::NotFound);
        }
        Ok(())
    }

    async fn mark_processing(&self, job_id: JobId) -> GenerationResult<()> {
        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET state = 'processing', updated_at = now()
            WHERE id = $1 AND state NOT IN ('success', 'failed')
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processing", e))?;
        Ok(())
    }

    #[instrument(skip(self, result_assets), fields(job_id = %job_id))]
    async fn finalize_success(
        &self,
        job_id: JobId,
        result_assets: &[String],
    ) -> GenerationResult<FinalizeOutcome> {
        let sql = format!(
            r#"
            UPDATE generation_jobs
            SET state = 'success', result_assets = $2, failure_reason = NULL,
                updated_at = now(), finalized_at = now()
            WHERE id = $1 AND state NOT IN ('success', 'failed')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(serde_json::json!(result_assets));

        self.finalize_with(job_id, query).await
    }

    #[instrument(skip(self, reason), fields(job_id = %job_id))]
    async fn finalize_failed(
        &self,
        job_id: JobId,
        reason: &str,
    ) -> GenerationResult<FinalizeOutcome> {
        let sql = format!(
            r#"
            UPDATE generation_jobs
            SET state = 'failed', failure_reason = $2,
                updated_at = now(), finalized_at = now()
            WHERE id = $1 AND state NOT IN ('success', 'failed')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(reason);

        self.finalize_with(job_id, query).await
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> GenerationResult<Vec<GenerationJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_uuid())
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_for_user", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn list_unfinished(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> GenerationResult<Vec<GenerationJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs \
             WHERE state NOT IN ('success', 'failed') AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(stale_before)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_unfinished", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

fn job_from_row(row: &PgRow) -> GenerationResult<GenerationJob> {
    let kind_raw: String = row.get("kind");
    let state_raw: String = row.get("state");
    let assets: serde_json::Value = row.get("result_assets");
    let result_assets = assets
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(GenerationJob {
        id: JobId::from_uuid(row.get::<Uuid, _>("id")),
        user_id: UserId::from_uuid(row.get::<Uuid, _>("user_id")),
        kind: JobKind::from_str(&kind_raw)?,
        model: row.get("model"),
        request_params: row.get("request_params"),
        provider_task_id: row
            .get::<Option<String>, _>("provider_task_id")
            .map(ProviderTaskId::new),
        state: parse_state(&state_raw)?,
        result_assets,
        failure_reason: row.get("failure_reason"),
        credits_charged: row.get("credits_charged"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        finalized_at: row.get::<Option<DateTime<Utc>>, _>("finalized_at"),
    })
}

fn parse_state(raw: &str) -> GenerationResult<JobState> {
    match raw {
        "queued" => Ok(JobState::Queued),
        "processing" => Ok(JobState::Processing),
        "success" => Ok(JobState::Success),
        "failed" => Ok(JobState::Failed),
        other => Err(GenerationError::storage(format!(
            "unknown job state in store: {other}"
        ))),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> GenerationError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            GenerationError::conflict(format!("{operation}: duplicate key"))
        }
        _ => GenerationError::storage(format!("{operation}: {err}")),
    }
}
