//! Job queue persistence
//!
//! Jobs live in the `jobs` table next to the records they act on. A job is
//! claimed with a single `UPDATE ... RETURNING`, so two workers can never
//! receive the same row. Completed jobs are deleted.

use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;
use xplat_common::{Error, Result};

use crate::models::{ClaimedJob, JobState, PredictionJob};

/// Queue depth per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobCounts {
    pub waiting: i64,
    pub active: i64,
    pub delayed: i64,
    pub failed: i64,
}

/// Insert a waiting job
///
/// Takes a connection so it can join the caller's transaction.
pub async fn insert_job(
    conn: &mut SqliteConnection,
    job: &PredictionJob,
    max_attempts: u32,
    now_ms: i64,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let payload = job.to_payload()?;

    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, kind, prediction_id, record_id, payload,
            state, attempts, max_attempts, run_at, created_at
        ) VALUES (?, ?, ?, ?, ?, 'waiting', 0, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(job.kind())
    .bind(job.prediction_id().to_string())
    .bind(job.record_id().map(|r| r.to_string()))
    .bind(&payload)
    .bind(max_attempts as i64)
    .bind(now_ms)
    .bind(now_ms)
    .execute(conn)
    .await?;

    Ok(id)
}

/// Claim the next runnable job, oldest `run_at` first
pub async fn claim_next(pool: &SqlitePool, now_ms: i64) -> Result<Option<ClaimedJob>> {
    let row = sqlx::query(
        r#"
        UPDATE jobs
        SET state = 'active', attempts = attempts + 1, claimed_at = ?
        WHERE id = (
            SELECT id FROM jobs
            WHERE state IN ('waiting', 'delayed') AND run_at <= ?
            ORDER BY run_at, rowid
            LIMIT 1
        )
        RETURNING id, payload, attempts, max_attempts
        "#,
    )
    .bind(now_ms)
    .bind(now_ms)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let id: String = row.get("id");
    let attempts: i64 = row.get("attempts");
    let max_attempts: i64 = row.get("max_attempts");

    Ok(Some(ClaimedJob {
        id: parse_uuid(&id)?,
        payload: row.get("payload"),
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
    }))
}

/// Delete a finished job. Returns false if it was already removed (canceled).
pub async fn complete(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND state = 'active'")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Put an active job back as `delayed` until `run_at_ms`
pub async fn schedule_retry(pool: &SqlitePool, id: Uuid, run_at_ms: i64, error: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET state = 'delayed', run_at = ?, claimed_at = NULL, last_error = ?
        WHERE id = ? AND state = 'active'
        "#,
    )
    .bind(run_at_ms)
    .bind(error)
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Move a job to `failed`; it stays in the table for inspection
pub async fn mark_failed(pool: &SqlitePool, id: Uuid, error: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'failed', claimed_at = NULL, last_error = ? WHERE id = ?",
    )
    .bind(error)
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Remove waiting, active and delayed jobs of a batch
pub async fn remove_for_prediction(pool: &SqlitePool, prediction_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM jobs
        WHERE prediction_id = ? AND state IN ('waiting', 'active', 'delayed')
        "#,
    )
    .bind(prediction_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Return jobs left `active` by a previous process to `waiting`
pub async fn requeue_stale(pool: &SqlitePool, now_ms: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'waiting', claimed_at = NULL, run_at = ? WHERE state = 'active'",
    )
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Count jobs per state
pub async fn count_by_state(pool: &SqlitePool) -> Result<JobCounts> {
    let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
        .fetch_all(pool)
        .await?;

    let by_state: HashMap<String, i64> = rows
        .iter()
        .map(|row| (row.get::<String, _>("state"), row.get::<i64, _>("n")))
        .collect();
    let count = |state: JobState| by_state.get(state.as_str()).copied().unwrap_or(0);

    Ok(JobCounts {
        waiting: count(JobState::Waiting),
        active: count(JobState::Active),
        delayed: count(JobState::Delayed),
        failed: count(JobState::Failed),
    })
}

/// Earliest `run_at` among runnable jobs
pub async fn next_run_at(pool: &SqlitePool) -> Result<Option<i64>> {
    let next: Option<i64> =
        sqlx::query_scalar("SELECT MIN(run_at) FROM jobs WHERE state IN ('waiting', 'delayed')")
            .fetch_one(pool)
            .await?;

    Ok(next)
}

/// State of one job, `None` once it has been deleted
pub async fn get_job_state(pool: &SqlitePool, id: Uuid) -> Result<Option<JobState>> {
    let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    state
        .map(|s| s.parse::<JobState>().map_err(Error::Internal))
        .transpose()
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Invalid UUID '{}': {}", value, e)))
}
