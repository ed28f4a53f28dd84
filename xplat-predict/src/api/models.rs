//! GET /models: production models reported by the inference service

use axum::{extract::State, routing::get, Json, Router};

use crate::error::ApiResult;
use crate::services::inference_client::ModelInfo;
use crate::AppState;

/// GET /models
///
/// Inference failures surface as 502.
pub async fn list_models(State(state): State<AppState>) -> ApiResult<Json<Vec<ModelInfo>>> {
    let models = state.inference.list_models().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to fetch models");
        e
    })?;
    Ok(Json(models))
}

pub fn model_routes() -> Router<AppState> {
    Router::new().route("/models", get(list_models))
}
