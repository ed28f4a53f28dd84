//! HTTP API handlers for xplat-predict

pub mod artifacts;
pub mod health;
pub mod models;
pub mod predict;

pub use artifacts::artifact_routes;
pub use health::health_routes;
pub use models::model_routes;
pub use predict::predict_routes;
