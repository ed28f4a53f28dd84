//! Prediction orchestrator
//!
//! Consumes decoded queue jobs and drives records through
//! predict → waterfall explanation → artifact upload, and batches through the
//! heatmap/beeswarm summary plots.
//!
//! Record outcomes:
//! - predict fails: ERROR, waterfall is not attempted
//! - waterfall fails: ERROR, proba/class kept
//! - upload fails: SUCCESS without a waterfall key
//!
//! The final record write is fenced on the version taken when the record was
//! claimed, so a cancel issued mid-flight always wins.

use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;
use xplat_common::Result;

use crate::db::{predictions, records, RecordOutcome};
use crate::models::{round_proba, Prediction, PredictionJob, PredictionRecord, RecordStatus};
use crate::services::artifact_store::ArtifactStore;
use crate::services::inference_client::{DataframeSplitRequest, InferenceApi, InferenceError};

/// Result of a record job, for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordJobOutcome {
    /// Batch or record no longer exists; job dropped
    Dropped,
    /// Record already SUCCESS or CANCELED
    Skipped,
    /// Final status written
    Completed(RecordStatus),
    /// Record was canceled or reclaimed while in flight; result discarded
    Fenced,
}

/// Result of a batch summary job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryOutcome {
    pub heatmap: Option<String>,
    pub beeswarm: Option<String>,
}

pub struct PredictionProcessor {
    pool: SqlitePool,
    inference: Arc<dyn InferenceApi>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl PredictionProcessor {
    pub fn new(
        pool: SqlitePool,
        inference: Arc<dyn InferenceApi>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            pool,
            inference,
            artifacts,
        }
    }

    /// Run one job. An `Err` means infrastructure failure; the queue retries it.
    pub async fn handle(&self, job: &PredictionJob) -> Result<()> {
        match job {
            PredictionJob::ProcessPrediction { prediction_id } => {
                self.process_prediction(*prediction_id).await?;
            }
            PredictionJob::ProcessRecord {
                prediction_id,
                record_id,
            } => {
                self.process_record(*prediction_id, *record_id).await?;
            }
        }
        Ok(())
    }

    /// Settle a job the queue gave up on
    ///
    /// A record left IN_PROGRESS ends as ERROR so re-predict can pick it up.
    /// Best effort: a failure here is only logged.
    pub async fn abandon(&self, job: &PredictionJob, error: &str) {
        let PredictionJob::ProcessRecord { record_id, .. } = job else {
            return;
        };

        let message = format!("Processing failed: {}", error);
        match records::fail_abandoned_record(&self.pool, *record_id, &message).await {
            Ok(true) => tracing::warn!(record_id = %record_id, "Abandoned record marked as ERROR"),
            Ok(false) => {}
            Err(e) => tracing::error!(record_id = %record_id, error = %e, "Failed to mark abandoned record"),
        }
    }

    /// Predict and explain one record
    pub async fn process_record(
        &self,
        prediction_id: Uuid,
        record_id: Uuid,
    ) -> Result<RecordJobOutcome> {
        let Some(batch) = predictions::get_prediction(&self.pool, prediction_id).await? else {
            tracing::error!(prediction_id = %prediction_id, record_id = %record_id, "Prediction not found; dropping record job");
            return Ok(RecordJobOutcome::Dropped);
        };

        let record = match records::get_record(&self.pool, record_id).await? {
            Some(record) if record.prediction_id == prediction_id => record,
            Some(_) => {
                tracing::error!(prediction_id = %prediction_id, record_id = %record_id, "Record belongs to another prediction; dropping job");
                return Ok(RecordJobOutcome::Dropped);
            }
            None => {
                tracing::error!(prediction_id = %prediction_id, record_id = %record_id, "Record not found; dropping job");
                return Ok(RecordJobOutcome::Dropped);
            }
        };

        let Some(version) = records::claim_record(&self.pool, record_id).await? else {
            tracing::info!(record_id = %record_id, status = %record.status, "Record already finished; skipping");
            return Ok(RecordJobOutcome::Skipped);
        };

        tracing::info!(prediction_id = %prediction_id, record_id = %record_id, "Processing record");

        let outcome = self.evaluate_record(&batch, &record).await;
        let status = outcome.status;

        let written = match records::complete_record(&self.pool, record_id, version, &outcome).await {
            Ok(written) => written,
            Err(e) => {
                tracing::error!(record_id = %record_id, error = %e, "Failed to save record result");
                let fallback = RecordOutcome::error(format!("Failed to save result: {}", e));
                // If this write fails too the job goes back to the queue
                records::complete_record(&self.pool, record_id, version, &fallback).await?
            }
        };

        if !written {
            tracing::warn!(record_id = %record_id, version, "Record changed while in flight (canceled?); result discarded");
            return Ok(RecordJobOutcome::Fenced);
        }

        match status {
            RecordStatus::Success => tracing::info!(record_id = %record_id, "Record processed"),
            _ => tracing::warn!(
                record_id = %record_id,
                error = outcome.error_message.as_deref().unwrap_or(""),
                "Record finished with error"
            ),
        }

        Ok(RecordJobOutcome::Completed(status))
    }

    /// Inference and explanation for one record, every failure folded into the outcome
    async fn evaluate_record(&self, batch: &Prediction, record: &PredictionRecord) -> RecordOutcome {
        if record.df_data.len() != batch.df_columns.len() {
            return RecordOutcome::error(format!(
                "Record has {} values but prediction has {} columns",
                record.df_data.len(),
                batch.df_columns.len()
            ));
        }

        let request = DataframeSplitRequest::new(batch.df_columns.clone(), vec![record.df_data.clone()]);

        let (proba, class) = match self.predict_one(&batch.model_name, &request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(record_id = %record.id, error = %e, "Prediction API failed");
                return RecordOutcome::error(format!("Prediction failed: {}", e));
            }
        };

        let waterfall_image = match self.inference.explain_waterfall(&batch.model_name, &request).await {
            Ok(mut explanations) if !explanations.is_empty() => explanations.swap_remove(0).waterfall,
            Ok(_) => {
                return RecordOutcome::error_with_prediction(
                    proba,
                    class,
                    format!("Waterfall explanation failed: {}", InferenceError::EmptyResult),
                )
            }
            Err(e) => {
                tracing::error!(record_id = %record.id, error = %e, "Waterfall API failed");
                return RecordOutcome::error_with_prediction(
                    proba,
                    class,
                    format!("Waterfall explanation failed: {}", e),
                );
            }
        };

        let waterfall = self
            .artifacts
            .upload(
                &waterfall_image,
                &batch.id.to_string(),
                &format!("waterfall_{}.png", record.id),
            )
            .await;

        RecordOutcome::success(proba, class, waterfall)
    }

    async fn predict_one(
        &self,
        model: &str,
        request: &DataframeSplitRequest,
    ) -> std::result::Result<(f64, i64), InferenceError> {
        let outputs = self.inference.predict(model, request).await?;
        let first = outputs.first().ok_or(InferenceError::EmptyResult)?;

        if !first.proba.is_finite() {
            return Err(InferenceError::InvalidResponse(format!(
                "probability {} is not a number",
                first.proba
            )));
        }
        if first.class != 0 && first.class != 1 {
            return Err(InferenceError::InvalidResponse(format!(
                "class {} is not 0 or 1",
                first.class
            )));
        }

        Ok((round_proba(first.proba), first.class))
    }

    /// Generate and store the batch's heatmap and beeswarm plots
    ///
    /// Inference and upload failures are logged only; each plot is attempted
    /// independently.
    pub async fn process_prediction(&self, prediction_id: Uuid) -> Result<SummaryOutcome> {
        let Some(batch) = predictions::get_prediction(&self.pool, prediction_id).await? else {
            tracing::error!(prediction_id = %prediction_id, "Prediction not found; dropping summary job");
            return Ok(SummaryOutcome::default());
        };

        let batch_records = records::records_for_prediction(&self.pool, prediction_id).await?;
        if batch_records.is_empty() {
            tracing::warn!(prediction_id = %prediction_id, "Prediction has no records; skipping summary plots");
            return Ok(SummaryOutcome::default());
        }

        tracing::info!(
            prediction_id = %prediction_id,
            records = batch_records.len(),
            "Generating summary plots"
        );

        let request = DataframeSplitRequest::new(
            batch.df_columns.clone(),
            batch_records.into_iter().map(|r| r.df_data).collect(),
        );
        let namespace = prediction_id.to_string();

        let heatmap = match self.inference.explain_heatmap(&batch.model_name, &request).await {
            Ok(image) => {
                self.artifacts
                    .upload(&image, &namespace, &format!("heatmap_{}.png", prediction_id))
                    .await
            }
            Err(e) => {
                tracing::error!(prediction_id = %prediction_id, error = %e, "Heatmap API failed");
                None
            }
        };

        let beeswarm = match self.inference.explain_beeswarm(&batch.model_name, &request).await {
            Ok(image) => {
                self.artifacts
                    .upload(&image, &namespace, &format!("beeswarm_{}.png", prediction_id))
                    .await
            }
            Err(e) => {
                tracing::error!(prediction_id = %prediction_id, error = %e, "Beeswarm API failed");
                None
            }
        };

        if heatmap.is_some() || beeswarm.is_some() {
            predictions::set_summary_artifacts(
                &self.pool,
                prediction_id,
                heatmap.as_deref(),
                beeswarm.as_deref(),
            )
            .await?;
        }

        tracing::info!(
            prediction_id = %prediction_id,
            heatmap = heatmap.is_some(),
            beeswarm = beeswarm.is_some(),
            "Summary plots finished"
        );

        Ok(SummaryOutcome { heatmap, beeswarm })
    }
}
