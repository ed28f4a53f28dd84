//! Prediction batch database operations

use chrono::Utc;
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use uuid::Uuid;
use xplat_common::db::{PREDICTION_NUMBER_SEQUENCE, RECORD_NUMBER_SEQUENCE};
use xplat_common::time::{from_db_string, now_millis, to_db_string};
use xplat_common::{Error, Result};

use super::jobs::{insert_job, parse_uuid};
use crate::models::{Prediction, PredictionJob, RecordCounts};

/// Result of creating a batch
#[derive(Debug, Clone)]
pub struct CreatedPrediction {
    pub prediction: Prediction,
    pub record_ids: Vec<Uuid>,
}

/// Create a batch, its PENDING records and their jobs in one transaction
///
/// Enqueues one `ProcessPrediction` job and one `ProcessRecord` job per row.
/// Nothing is visible to workers until the transaction commits.
pub async fn create_prediction(
    pool: &SqlitePool,
    model_name: &str,
    columns: &[String],
    rows: &[Vec<Value>],
    max_attempts: u32,
) -> Result<CreatedPrediction> {
    let df_columns = serde_json::to_string(columns)?;
    let df_rows = rows
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut tx = pool.begin().await?;

    // Sequence bumps come first so the transaction holds the write lock early
    let prediction_number = next_sequence_block(&mut tx, PREDICTION_NUMBER_SEQUENCE, 1).await?;
    let last_record_number =
        next_sequence_block(&mut tx, RECORD_NUMBER_SEQUENCE, rows.len() as i64).await?;
    let first_record_number = last_record_number - rows.len() as i64 + 1;

    let now = Utc::now();
    let now_str = to_db_string(&now);
    let prediction_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO predictions (id, prediction_number, model_name, df_columns, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(prediction_id.to_string())
    .bind(prediction_number)
    .bind(model_name)
    .bind(&df_columns)
    .bind(&now_str)
    .execute(&mut *tx)
    .await?;

    let mut record_ids = Vec::with_capacity(rows.len());
    for (offset, df_data) in df_rows.iter().enumerate() {
        let record_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO prediction_records (
                id, record_number, prediction_id, df_data, status, version, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'PENDING', 0, ?, ?)
            "#,
        )
        .bind(record_id.to_string())
        .bind(first_record_number + offset as i64)
        .bind(prediction_id.to_string())
        .bind(df_data)
        .bind(&now_str)
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;
        record_ids.push(record_id);
    }

    let now_ms = now_millis();
    insert_job(
        &mut tx,
        &PredictionJob::ProcessPrediction { prediction_id },
        max_attempts,
        now_ms,
    )
    .await?;
    for record_id in &record_ids {
        insert_job(
            &mut tx,
            &PredictionJob::ProcessRecord {
                prediction_id,
                record_id: *record_id,
            },
            max_attempts,
            now_ms,
        )
        .await?;
    }

    tx.commit().await?;

    Ok(CreatedPrediction {
        prediction: Prediction {
            id: prediction_id,
            prediction_number,
            model_name: model_name.to_string(),
            df_columns: columns.to_vec(),
            heatmap: None,
            beeswarm: None,
            created_at: now,
        },
        record_ids,
    })
}

/// Advance a named sequence by `count`, returning the last value of the block
async fn next_sequence_block(conn: &mut SqliteConnection, name: &str, count: i64) -> Result<i64> {
    let value: Option<i64> =
        sqlx::query_scalar("UPDATE sequences SET value = value + ? WHERE name = ? RETURNING value")
            .bind(count)
            .bind(name)
            .fetch_optional(conn)
            .await?;

    value.ok_or_else(|| Error::Internal(format!("Sequence '{}' is not initialized", name)))
}

/// Load one batch
pub async fn get_prediction(pool: &SqlitePool, id: Uuid) -> Result<Option<Prediction>> {
    let row = sqlx::query(
        r#"
        SELECT id, prediction_number, model_name, df_columns, heatmap, beeswarm, created_at
        FROM predictions
        WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_prediction).transpose()
}

/// Newest-first page of batches with per-batch record counts
pub async fn list_predictions(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
) -> Result<(Vec<(Prediction, RecordCounts)>, i64)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM predictions")
        .fetch_one(pool)
        .await?;

    let rows = sqlx::query(
        r#"
        SELECT
            p.id, p.prediction_number, p.model_name, p.df_columns,
            p.heatmap, p.beeswarm, p.created_at,
            COUNT(r.id) AS total_records,
            COALESCE(SUM(CASE WHEN r.status = 'SUCCESS' THEN 1 ELSE 0 END), 0) AS success_records,
            COALESCE(SUM(CASE WHEN r.status = 'ERROR' THEN 1 ELSE 0 END), 0) AS error_records
        FROM predictions p
        LEFT JOIN prediction_records r ON r.prediction_id = p.id
        GROUP BY p.id
        ORDER BY p.created_at DESC, p.prediction_number DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        let counts = RecordCounts {
            total: row.get("total_records"),
            success: row.get("success_records"),
            error: row.get("error_records"),
        };
        items.push((row_to_prediction(row)?, counts));
    }

    Ok((items, total))
}

/// Attach summary artifact keys; `None` leaves the stored value alone
pub async fn set_summary_artifacts(
    pool: &SqlitePool,
    id: Uuid,
    heatmap: Option<&str>,
    beeswarm: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE predictions
        SET heatmap = COALESCE(?, heatmap), beeswarm = COALESCE(?, beeswarm)
        WHERE id = ?
        "#,
    )
    .bind(heatmap)
    .bind(beeswarm)
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

fn row_to_prediction(row: &SqliteRow) -> Result<Prediction> {
    let id: String = row.get("id");
    let df_columns: String = row.get("df_columns");
    let created_at: String = row.get("created_at");

    Ok(Prediction {
        id: parse_uuid(&id)?,
        prediction_number: row.get("prediction_number"),
        model_name: row.get("model_name"),
        df_columns: serde_json::from_str(&df_columns)?,
        heatmap: row.get("heatmap"),
        beeswarm: row.get("beeswarm"),
        created_at: from_db_string(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool) {
        let temp_dir = TempDir::new().unwrap();
        let pool = xplat_common::db::init_database(&temp_dir.path().join("predictions.db"))
            .await
            .unwrap();
        (temp_dir, pool)
    }

    fn columns() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[tokio::test]
    async fn test_create_allocates_sequential_numbers() {
        let (_dir, pool) = setup().await;
        let rows = vec![vec![json!(1), json!(2)], vec![json!(3), json!(4)]];

        let first = create_prediction(&pool, "m1", &columns(), &rows, 3).await.unwrap();
        let second = create_prediction(&pool, "m1", &columns(), &rows[..1], 3).await.unwrap();

        assert_eq!(first.prediction.prediction_number, 1);
        assert_eq!(second.prediction.prediction_number, 2);

        let numbers: Vec<i64> = sqlx::query_scalar(
            "SELECT record_number FROM prediction_records ORDER BY record_number",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_create_enqueues_batch_and_record_jobs() {
        let (_dir, pool) = setup().await;
        let rows = vec![vec![json!(1), json!(2)], vec![json!(3), json!(4)], vec![json!(5), json!(6)]];

        let created = create_prediction(&pool, "m1", &columns(), &rows, 3).await.unwrap();

        let kinds: Vec<String> = sqlx::query_scalar("SELECT kind FROM jobs WHERE prediction_id = ?")
            .bind(created.prediction.id.to_string())
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(kinds.len(), 4);
        assert_eq!(kinds.iter().filter(|k| *k == "PROCESS_PREDICTION").count(), 1);
        assert_eq!(kinds.iter().filter(|k| *k == "PROCESS_RECORD").count(), 3);
    }

    #[tokio::test]
    async fn test_get_prediction_round_trip() {
        let (_dir, pool) = setup().await;
        let created = create_prediction(&pool, "m1", &columns(), &[vec![json!(1), json!(2)]], 3)
            .await
            .unwrap();

        let loaded = get_prediction(&pool, created.prediction.id).await.unwrap().unwrap();
        assert_eq!(loaded.model_name, "m1");
        assert_eq!(loaded.df_columns, columns());
        assert!(loaded.heatmap.is_none());

        assert!(get_prediction(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_is_newest_first_with_counts() {
        let (_dir, pool) = setup().await;
        let older = create_prediction(&pool, "old", &columns(), &[vec![json!(1), json!(2)]], 3)
            .await
            .unwrap();
        let newer = create_prediction(
            &pool,
            "new",
            &columns(),
            &[vec![json!(1), json!(2)], vec![json!(3), json!(4)]],
            3,
        )
        .await
        .unwrap();

        sqlx::query("UPDATE prediction_records SET status = 'SUCCESS' WHERE record_number = 2")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE prediction_records SET status = 'ERROR' WHERE record_number = 3")
            .execute(&pool)
            .await
            .unwrap();

        let (items, total) = list_predictions(&pool, 10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(items[0].0.id, newer.prediction.id);
        assert_eq!(items[0].1, RecordCounts { total: 2, success: 1, error: 1 });
        assert_eq!(items[1].0.id, older.prediction.id);
        assert_eq!(items[1].1, RecordCounts { total: 1, success: 0, error: 0 });

        let (page_two, _) = list_predictions(&pool, 1, 1).await.unwrap();
        assert_eq!(page_two.len(), 1);
        assert_eq!(page_two[0].0.id, older.prediction.id);
    }

    #[tokio::test]
    async fn test_set_summary_artifacts_keeps_existing_keys() {
        let (_dir, pool) = setup().await;
        let created = create_prediction(&pool, "m1", &columns(), &[vec![json!(1), json!(2)]], 3)
            .await
            .unwrap();
        let id = created.prediction.id;

        set_summary_artifacts(&pool, id, Some("heat.png"), None).await.unwrap();
        set_summary_artifacts(&pool, id, None, Some("bee.png")).await.unwrap();

        let loaded = get_prediction(&pool, id).await.unwrap().unwrap();
        assert_eq!(loaded.heatmap.as_deref(), Some("heat.png"));
        assert_eq!(loaded.beeswarm.as_deref(), Some("bee.png"));
    }
}
