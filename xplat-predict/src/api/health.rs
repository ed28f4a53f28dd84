//! Health check endpoint
//!
//! Reports uptime and queue depth. A database failure while counting jobs
//! degrades the status instead of failing the request.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::db::JobCounts;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "degraded"
    pub status: String,
    /// Module name ("xplat-predict")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Jobs per queue state; absent when the database is unreachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<JobCounts>,
    /// Diagnostic message when degraded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let (status, queue, last_error) = match state.queue.counts().await {
        Ok(counts) => ("ok", Some(counts), None),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read queue depth");
            ("degraded", None, Some(e.to_string()))
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        module: "xplat-predict".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        queue,
        last_error,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
