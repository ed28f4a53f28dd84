//! Business logic services for xplat-predict

pub mod artifact_store;
pub mod csv_parser;
pub mod inference_client;
pub mod orchestrator;
pub mod predictions;
pub mod queue;
pub mod worker;

pub use artifact_store::{ArtifactError, ArtifactStore, LocalArtifactStore};
pub use csv_parser::{parse_csv, CsvError, ParsedCsv};
pub use inference_client::{
    DataframeSplitRequest, InferenceApi, InferenceClient, InferenceError, ModelInfo, PredictOutput,
    WaterfallOutput,
};
pub use orchestrator::{PredictionProcessor, RecordJobOutcome, SummaryOutcome};
pub use predictions::PredictionService;
pub use queue::{FailureOutcome, JobQueue};
pub use worker::{WorkerPool, WorkerPoolHandle};
