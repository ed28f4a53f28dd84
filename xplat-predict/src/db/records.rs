//! Prediction record database operations
//!
//! Writes made on behalf of a worker are fenced on the record `version`:
//! claiming bumps it, cancellation bumps it, and the worker's final write only
//! lands if the version it claimed is still current.

use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;
use xplat_common::time::{from_db_string, now, to_db_string};
use xplat_common::{Error, Result};

use super::jobs::parse_uuid;
use crate::models::{PredictionRecord, RecordStatus, CANCELED_BY_USER};

const RECORD_COLUMNS: &str = "id, record_number, prediction_id, df_data, proba, class, waterfall, \
                              status, error_message, version, created_at, updated_at";

/// Final state written by a worker
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub status: RecordStatus,
    pub proba: Option<f64>,
    pub class: Option<i64>,
    pub waterfall: Option<String>,
    pub error_message: Option<String>,
}

impl RecordOutcome {
    pub fn success(proba: f64, class: i64, waterfall: Option<String>) -> Self {
        Self {
            status: RecordStatus::Success,
            proba: Some(proba),
            class: Some(class),
            waterfall,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Error,
            proba: None,
            class: None,
            waterfall: None,
            error_message: Some(message.into()),
        }
    }

    /// Error after a successful predict call; keeps proba and class
    pub fn error_with_prediction(proba: f64, class: i64, message: impl Into<String>) -> Self {
        Self {
            proba: Some(proba),
            class: Some(class),
            ..Self::error(message)
        }
    }
}

/// Load one record
pub async fn get_record(pool: &SqlitePool, id: Uuid) -> Result<Option<PredictionRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM prediction_records WHERE id = ?",
        RECORD_COLUMNS
    ))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_record).transpose()
}

/// Page of a batch's records ordered by record number
///
/// `class` and `status` are equality filters; `None` matches everything.
pub async fn list_records(
    pool: &SqlitePool,
    prediction_id: Uuid,
    class: Option<i64>,
    status: Option<RecordStatus>,
    limit: i64,
    offset: i64,
) -> Result<(Vec<PredictionRecord>, i64)> {
    let prediction_id = prediction_id.to_string();
    let status = status.map(|s| s.as_str());

    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM prediction_records
        WHERE prediction_id = ?
          AND (? IS NULL OR class = ?)
          AND (? IS NULL OR status = ?)
        "#,
    )
    .bind(&prediction_id)
    .bind(class)
    .bind(class)
    .bind(status)
    .bind(status)
    .fetch_one(pool)
    .await?;

    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM prediction_records
        WHERE prediction_id = ?
          AND (? IS NULL OR class = ?)
          AND (? IS NULL OR status = ?)
        ORDER BY record_number
        LIMIT ? OFFSET ?
        "#,
        RECORD_COLUMNS
    ))
    .bind(&prediction_id)
    .bind(class)
    .bind(class)
    .bind(status)
    .bind(status)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let records = rows.iter().map(row_to_record).collect::<Result<Vec<_>>>()?;
    Ok((records, total))
}

/// Every record of a batch, ordered by record number
pub async fn records_for_prediction(
    pool: &SqlitePool,
    prediction_id: Uuid,
) -> Result<Vec<PredictionRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM prediction_records WHERE prediction_id = ? ORDER BY record_number",
        RECORD_COLUMNS
    ))
    .bind(prediction_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_record).collect()
}

/// Ids of a batch's ERROR records
pub async fn error_record_ids(pool: &SqlitePool, prediction_id: Uuid) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM prediction_records
        WHERE prediction_id = ? AND status = 'ERROR'
        ORDER BY record_number
        "#,
    )
    .bind(prediction_id.to_string())
    .fetch_all(pool)
    .await?;

    ids.iter().map(|id| parse_uuid(id)).collect()
}

/// Take ownership of a record for processing
///
/// Succeeds for PENDING, IN_PROGRESS (redelivered job) and ERROR (re-predict)
/// records and returns the new fencing version. SUCCESS and CANCELED records
/// are left alone and `None` is returned.
pub async fn claim_record(pool: &SqlitePool, id: Uuid) -> Result<Option<i64>> {
    let version: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE prediction_records
        SET status = 'IN_PROGRESS', version = version + 1, error_message = NULL, updated_at = ?
        WHERE id = ? AND status IN ('PENDING', 'IN_PROGRESS', 'ERROR')
        RETURNING version
        "#,
    )
    .bind(to_db_string(&now()))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(version)
}

/// Write a worker's final result if `version` is still current
///
/// Returns false when the write was fenced off (the record was canceled or
/// reclaimed since).
pub async fn complete_record(
    pool: &SqlitePool,
    id: Uuid,
    version: i64,
    outcome: &RecordOutcome,
) -> Result<bool> {
    if !matches!(outcome.status, RecordStatus::Success | RecordStatus::Error) {
        return Err(Error::Internal(format!(
            "Worker cannot finish a record as {}",
            outcome.status
        )));
    }

    let result = sqlx::query(
        r#"
        UPDATE prediction_records
        SET status = ?, proba = ?, class = ?, waterfall = ?, error_message = ?, updated_at = ?
        WHERE id = ? AND version = ? AND status = 'IN_PROGRESS'
        "#,
    )
    .bind(outcome.status.as_str())
    .bind(outcome.proba)
    .bind(outcome.class)
    .bind(&outcome.waterfall)
    .bind(&outcome.error_message)
    .bind(to_db_string(&now()))
    .bind(id.to_string())
    .bind(version)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Mark an IN_PROGRESS record as ERROR after its job was given up on
///
/// Bumps the version so a late worker write is fenced off. Returns false when
/// the record had already left IN_PROGRESS.
pub async fn fail_abandoned_record(pool: &SqlitePool, id: Uuid, message: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE prediction_records
        SET status = 'ERROR', error_message = ?, version = version + 1, updated_at = ?
        WHERE id = ? AND status = 'IN_PROGRESS'
        "#,
    )
    .bind(message)
    .bind(to_db_string(&now()))
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Cancel every PENDING or IN_PROGRESS record of a batch
pub async fn cancel_open_records(pool: &SqlitePool, prediction_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE prediction_records
        SET status = 'CANCELED', error_message = ?, version = version + 1, updated_at = ?
        WHERE prediction_id = ? AND status IN ('PENDING', 'IN_PROGRESS')
        "#,
    )
    .bind(CANCELED_BY_USER)
    .bind(to_db_string(&now()))
    .bind(prediction_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

fn row_to_record(row: &SqliteRow) -> Result<PredictionRecord> {
    let id: String = row.get("id");
    let prediction_id: String = row.get("prediction_id");
    let df_data: String = row.get("df_data");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(PredictionRecord {
        id: parse_uuid(&id)?,
        record_number: row.get("record_number"),
        prediction_id: parse_uuid(&prediction_id)?,
        df_data: serde_json::from_str(&df_data)?,
        proba: row.get("proba"),
        class: row.get("class"),
        waterfall: row.get("waterfall"),
        status: status.parse().map_err(Error::Internal)?,
        error_message: row.get("error_message"),
        version: row.get("version"),
        created_at: from_db_string(&created_at)?,
        updated_at: from_db_string(&updated_at)?,
    })
}
