//! Prediction API service
//!
//! Ingests CSV uploads into a batch of PENDING records (plus their jobs) and
//! answers list, records, re-predict and cancel requests. Errors use
//! `xplat_common::Error`: `InvalidInput` for validation failures and
//! `NotFound` for unknown batches.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;
use xplat_common::{Error, Result};

use crate::db::{predictions, records};
use crate::models::{ClassFilter, PredictionJob, PredictionRecord, RecordCounts, RecordStatus, StatusFilter};
use crate::pagination::{PageRequest, Paginated};
use crate::services::artifact_store::ArtifactStore;
use crate::services::csv_parser::parse_csv;
use crate::services::queue::JobQueue;
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePredictionResponse {
    pub message: String,
    pub prediction_id: Uuid,
}

/// Batch row in the list view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionSummary {
    pub id: Uuid,
    pub prediction_number: i64,
    pub model_name: String,
    pub records: RecordCounts,
    pub created_at: DateTime<Utc>,
    /// Presigned heatmap URL
    pub heatmap: Option<String>,
    /// Presigned beeswarm URL
    pub beeswarm: Option<String>,
}

/// Record row with the batch's columns denormalized
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub id: Uuid,
    pub record_number: i64,
    pub prediction_id: Uuid,
    pub df_columns: Vec<String>,
    pub df_data: Vec<Value>,
    pub proba: Option<f64>,
    pub class: Option<i64>,
    /// Presigned waterfall URL
    pub waterfall: Option<String>,
    pub status: RecordStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RePredictResponse {
    pub message: String,
    pub prediction_id: Uuid,
    pub requeued: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub message: String,
    pub prediction_id: Uuid,
    pub removed_jobs: u64,
    pub canceled_records: u64,
}

pub struct PredictionService {
    pool: SqlitePool,
    queue: Arc<JobQueue>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl PredictionService {
    pub fn new(pool: SqlitePool, queue: Arc<JobQueue>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            pool,
            queue,
            artifacts,
        }
    }

    /// Create a batch from an uploaded CSV and enqueue its jobs
    ///
    /// Returns before any inference runs.
    pub async fn create(
        &self,
        file: Option<&[u8]>,
        model_name: Option<&str>,
    ) -> Result<CreatePredictionResponse> {
        let model_name = model_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::InvalidInput("modelName is required".to_string()))?;
        let file = file.ok_or_else(|| Error::InvalidInput("file is required".to_string()))?;

        let parsed = parse_csv(file)
            .map_err(|e| Error::InvalidInput(format!("Invalid CSV file: {}", e)))?;

        let pool = &self.pool;
        let columns = &parsed.columns;
        let rows = &parsed.rows;
        let max_attempts = self.queue.max_attempts();

        let created = retry_on_lock("create_prediction", DEFAULT_MAX_LOCK_WAIT_MS, move || async move {
            predictions::create_prediction(pool, model_name, columns, rows, max_attempts).await
        })
        .await?;

        self.queue.notify_enqueued();

        tracing::info!(
            prediction_id = %created.prediction.id,
            prediction_number = created.prediction.prediction_number,
            model_name = model_name,
            records = created.record_ids.len(),
            "Prediction created"
        );

        Ok(CreatePredictionResponse {
            message: "Prediction Created".to_string(),
            prediction_id: created.prediction.id,
        })
    }

    /// Newest-first page of batches
    pub async fn list(&self, page: PageRequest) -> Result<Paginated<PredictionSummary>> {
        let (rows, total) = predictions::list_predictions(&self.pool, page.limit, page.offset()).await?;

        let items = rows
            .into_iter()
            .map(|(prediction, counts)| PredictionSummary {
                id: prediction.id,
                prediction_number: prediction.prediction_number,
                model_name: prediction.model_name,
                records: counts,
                created_at: prediction.created_at,
                heatmap: prediction.heatmap.as_deref().map(|key| self.sign(key)),
                beeswarm: prediction.beeswarm.as_deref().map(|key| self.sign(key)),
            })
            .collect();

        Ok(Paginated::new(items, page, total))
    }

    /// Page of a batch's records with optional class/status equality filters
    pub async fn get_records(
        &self,
        prediction_id: Uuid,
        page: PageRequest,
        class: ClassFilter,
        status: StatusFilter,
    ) -> Result<Paginated<RecordView>> {
        let prediction = self.require_prediction(prediction_id).await?;

        let (rows, total) = records::list_records(
            &self.pool,
            prediction_id,
            class.class_value(),
            status.0,
            page.limit,
            page.offset(),
        )
        .await?;

        let items = rows
            .into_iter()
            .map(|record| self.record_view(record, &prediction.df_columns))
            .collect();

        Ok(Paginated::new(items, page, total))
    }

    /// Requeue every ERROR record of a batch
    ///
    /// Status is left as ERROR until a worker reclaims the record.
    pub async fn re_predict(&self, prediction_id: Uuid) -> Result<RePredictResponse> {
        self.require_prediction(prediction_id).await?;

        let error_ids = records::error_record_ids(&self.pool, prediction_id).await?;
        if error_ids.is_empty() {
            return Err(Error::NotFound(format!(
                "Prediction ID {} has no failed records",
                prediction_id
            )));
        }

        let jobs: Vec<PredictionJob> = error_ids
            .iter()
            .map(|record_id| PredictionJob::ProcessRecord {
                prediction_id,
                record_id: *record_id,
            })
            .collect();
        self.queue.enqueue_many(&jobs).await?;

        tracing::info!(
            prediction_id = %prediction_id,
            requeued = jobs.len(),
            "Failed records requeued"
        );

        Ok(RePredictResponse {
            message: "Prediction requeued".to_string(),
            prediction_id,
            requeued: jobs.len(),
        })
    }

    /// Remove a batch's queued jobs and cancel its open records
    pub async fn cancel(&self, prediction_id: Uuid) -> Result<CancelResponse> {
        self.require_prediction(prediction_id).await?;

        let removed_jobs = self.queue.remove_prediction_jobs(prediction_id).await?;
        let canceled_records = records::cancel_open_records(&self.pool, prediction_id).await?;

        tracing::info!(
            prediction_id = %prediction_id,
            removed_jobs,
            canceled_records,
            "Prediction canceled"
        );

        Ok(CancelResponse {
            message: "Prediction canceled".to_string(),
            prediction_id,
            removed_jobs,
            canceled_records,
        })
    }

    async fn require_prediction(&self, prediction_id: Uuid) -> Result<crate::models::Prediction> {
        predictions::get_prediction(&self.pool, prediction_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Prediction ID {} not found", prediction_id)))
    }

    fn record_view(&self, record: PredictionRecord, df_columns: &[String]) -> RecordView {
        RecordView {
            id: record.id,
            record_number: record.record_number,
            prediction_id: record.prediction_id,
            df_columns: df_columns.to_vec(),
            df_data: record.df_data,
            proba: record.proba,
            class: record.class,
            waterfall: record.waterfall.as_deref().map(|key| self.sign(key)),
            status: record.status,
            error_message: record.error_message,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn sign(&self, key: &str) -> String {
        self.artifacts.presigned_url(key, self.artifacts.default_ttl())
    }
}
