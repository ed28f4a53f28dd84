//! xplat-predict library interface
//!
//! Asynchronous prediction pipeline: CSV uploads become batches of records,
//! queue workers run each record through the inference service, and plot
//! images land in the artifact store. Exposed as a library so integration
//! tests can build the router and workers in-process.

pub mod api;
pub mod db;
pub mod error;
pub mod models;
pub mod pagination;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use xplat_common::config::ServiceConfig;

use crate::services::{
    ArtifactError, ArtifactStore, InferenceApi, JobQueue, LocalArtifactStore, PredictionProcessor,
    PredictionService, WorkerPool,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Durable job queue
    pub queue: Arc<JobQueue>,
    /// Prediction API operations
    pub predictions: Arc<PredictionService>,
    /// Inference service client
    pub inference: Arc<dyn InferenceApi>,
    /// Artifact store, concrete so signed URLs can be served locally
    pub artifact_files: Arc<LocalArtifactStore>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        queue: Arc<JobQueue>,
        inference: Arc<dyn InferenceApi>,
        artifact_files: Arc<LocalArtifactStore>,
    ) -> Self {
        let artifacts: Arc<dyn ArtifactStore> = artifact_files.clone();
        let predictions = Arc::new(PredictionService::new(db.clone(), queue.clone(), artifacts));

        Self {
            db,
            queue,
            predictions,
            inference,
            artifact_files,
            startup_time: Utc::now(),
        }
    }

    /// Wire queue and artifact store from resolved configuration
    pub fn from_config(
        db: SqlitePool,
        config: &ServiceConfig,
        inference: Arc<dyn InferenceApi>,
    ) -> Result<Self, ArtifactError> {
        let queue = Arc::new(JobQueue::new(db.clone(), &config.queue));
        let artifact_files = Arc::new(LocalArtifactStore::new(&config.storage)?);
        Ok(Self::new(db, queue, inference, artifact_files))
    }

    /// Worker pool sharing this state's queue, inference client and store
    pub fn worker_pool(&self, worker_count: usize) -> WorkerPool {
        let artifacts: Arc<dyn ArtifactStore> = self.artifact_files.clone();
        let processor = Arc::new(PredictionProcessor::new(
            self.db.clone(),
            self.inference.clone(),
            artifacts,
        ));
        WorkerPool::new(self.queue.clone(), processor, worker_count)
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::predict_routes())
        .merge(api::model_routes())
        .merge(api::artifact_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
