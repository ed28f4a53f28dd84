//! Queue job payloads
//!
//! Payloads are stored as JSON in the `jobs` table. The `type` tag keeps the
//! set of job kinds closed: anything else fails to decode and the job is
//! moved to `failed` without running.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Work item consumed by the prediction workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionJob {
    /// Batch-level summary plots (heatmap, beeswarm)
    ProcessPrediction {
        #[serde(rename = "predictionId")]
        prediction_id: Uuid,
    },
    /// One record: predict, explain, upload
    ProcessRecord {
        #[serde(rename = "predictionId")]
        prediction_id: Uuid,
        #[serde(rename = "recordId")]
        record_id: Uuid,
    },
}

impl PredictionJob {
    pub fn prediction_id(&self) -> Uuid {
        match self {
            PredictionJob::ProcessPrediction { prediction_id }
            | PredictionJob::ProcessRecord { prediction_id, .. } => *prediction_id,
        }
    }

    pub fn record_id(&self) -> Option<Uuid> {
        match self {
            PredictionJob::ProcessPrediction { .. } => None,
            PredictionJob::ProcessRecord { record_id, .. } => Some(*record_id),
        }
    }

    /// Value of the `kind` column
    pub fn kind(&self) -> &'static str {
        match self {
            PredictionJob::ProcessPrediction { .. } => "PROCESS_PREDICTION",
            PredictionJob::ProcessRecord { .. } => "PROCESS_RECORD",
        }
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> Result<Self, JobPayloadError> {
        serde_json::from_str(payload).map_err(|e| JobPayloadError(e.to_string()))
    }
}

/// Stored payload does not describe a known job
#[derive(Debug, Error)]
#[error("Malformed job payload: {0}")]
pub struct JobPayloadError(pub String);

/// Queue row state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("Unknown job state: {}", other)),
        }
    }
}

/// A job row handed to a worker by the queue
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    /// Raw payload; decoded by the worker so bad rows can be failed
    pub payload: String,
    /// Attempt number of this delivery, starting at 1
    pub attempts: u32,
    pub max_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_tagging() {
        let prediction_id = Uuid::new_v4();
        let record_id = Uuid::new_v4();
        let job = PredictionJob::ProcessRecord { prediction_id, record_id };

        let value: serde_json::Value = serde_json::from_str(&job.to_payload().unwrap()).unwrap();
        assert_eq!(value["type"], "PROCESS_RECORD");
        assert_eq!(value["predictionId"], prediction_id.to_string());
        assert_eq!(value["recordId"], record_id.to_string());

        assert_eq!(PredictionJob::from_payload(&job.to_payload().unwrap()).unwrap(), job);
    }

    #[test]
    fn test_unknown_job_type_rejected() {
        let payload = r#"{"type":"DELETE_EVERYTHING","predictionId":"00000000-0000-0000-0000-000000000000"}"#;
        assert!(PredictionJob::from_payload(payload).is_err());
    }

    #[test]
    fn test_record_job_without_record_id_rejected() {
        let payload = format!(r#"{{"type":"PROCESS_RECORD","predictionId":"{}"}}"#, Uuid::new_v4());
        assert!(PredictionJob::from_payload(&payload).is_err());
    }

    #[test]
    fn test_bad_uuid_rejected() {
        let payload = r#"{"type":"PROCESS_PREDICTION","predictionId":"not-a-uuid"}"#;
        assert!(PredictionJob::from_payload(payload).is_err());
    }

    #[test]
    fn test_accessors() {
        let prediction_id = Uuid::new_v4();
        let job = PredictionJob::ProcessPrediction { prediction_id };
        assert_eq!(job.prediction_id(), prediction_id);
        assert_eq!(job.record_id(), None);
        assert_eq!(job.kind(), "PROCESS_PREDICTION");
    }
}
