//! Data models for xplat-predict
//!
//! - Prediction batches, records and their status state machine
//! - Queue job payloads

pub mod job;
pub mod prediction;

pub use job::{ClaimedJob, JobPayloadError, JobState, PredictionJob};
pub use prediction::{
    round_proba, ClassFilter, Prediction, PredictionRecord, RecordCounts, RecordStatus,
    StatusFilter, CANCELED_BY_USER,
};
