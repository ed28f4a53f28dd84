//! Database access for xplat-predict
//!
//! Schema creation and migrations live in `xplat_common::db`; this module holds
//! the queries the prediction service runs against that schema.

pub mod jobs;
pub mod predictions;
pub mod records;

pub use jobs::JobCounts;
pub use predictions::CreatedPrediction;
pub use records::RecordOutcome;
