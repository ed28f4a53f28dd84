//! Prediction batches and per-row records
//!
//! A record moves through a small state machine:
//! PENDING → IN_PROGRESS → SUCCESS | ERROR | CANCELED

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Message stored on records canceled through the API
pub const CANCELED_BY_USER: &str = "Prediction canceled by user";

/// Record lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Created, waiting for a worker
    Pending,
    /// Owned by a worker
    InProgress,
    /// Inference and explanation completed
    Success,
    /// Inference or explanation failed; eligible for re-predict
    Error,
    /// Canceled through the API
    Canceled,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::InProgress => "IN_PROGRESS",
            RecordStatus::Success => "SUCCESS",
            RecordStatus::Error => "ERROR",
            RecordStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RecordStatus::Pending),
            "IN_PROGRESS" => Ok(RecordStatus::InProgress),
            "SUCCESS" => Ok(RecordStatus::Success),
            "ERROR" => Ok(RecordStatus::Error),
            "CANCELED" => Ok(RecordStatus::Canceled),
            other => Err(format!("Unknown record status: {}", other)),
        }
    }
}

/// Filter on the predicted class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassFilter {
    #[default]
    All,
    /// class = 1
    Positive,
    /// class = 0
    Negative,
}

impl ClassFilter {
    /// Class value to match, `None` for no filter
    pub fn class_value(&self) -> Option<i64> {
        match self {
            ClassFilter::All => None,
            ClassFilter::Positive => Some(1),
            ClassFilter::Negative => Some(0),
        }
    }
}

impl FromStr for ClassFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(ClassFilter::All),
            "POSITIVE" => Ok(ClassFilter::Positive),
            "NEGATIVE" => Ok(ClassFilter::Negative),
            other => Err(format!(
                "Invalid class filter '{}' (expected ALL, POSITIVE or NEGATIVE)",
                other
            )),
        }
    }
}

/// Filter on the record status; `ALL` disables it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFilter(pub Option<RecordStatus>);

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ALL") {
            return Ok(StatusFilter(None));
        }
        s.parse::<RecordStatus>()
            .map(|status| StatusFilter(Some(status)))
            .map_err(|_| {
                format!(
                    "Invalid status filter '{}' (expected ALL, PENDING, IN_PROGRESS, SUCCESS, ERROR or CANCELED)",
                    s
                )
            })
    }
}

/// One uploaded dataset submitted under one model
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub id: Uuid,
    pub prediction_number: i64,
    pub model_name: String,
    pub df_columns: Vec<String>,
    /// Artifact key of the heatmap summary plot
    pub heatmap: Option<String>,
    /// Artifact key of the beeswarm summary plot
    pub beeswarm: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of a prediction batch
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub id: Uuid,
    pub record_number: i64,
    pub prediction_id: Uuid,
    /// Feature values aligned with the batch's `df_columns`
    pub df_data: Vec<serde_json::Value>,
    pub proba: Option<f64>,
    pub class: Option<i64>,
    /// Artifact key of the waterfall plot
    pub waterfall: Option<String>,
    pub status: RecordStatus,
    pub error_message: Option<String>,
    /// Fencing token; bumped on every claim and cancel
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-batch record counts shown in listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub total: i64,
    pub success: i64,
    pub error: i64,
}

/// Round a probability to 4 decimal places
pub fn round_proba(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
