//! Prediction API handlers
//!
//! POST /predict, GET /predict, GET /predict/:id/records,
//! POST /predict/:id/re-predict, POST /predict/:id/cancel

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{ClassFilter, StatusFilter};
use crate::pagination::{PageRequest, Paginated};
use crate::services::predictions::{
    CancelResponse, CreatePredictionResponse, PredictionSummary, RePredictResponse, RecordView,
};
use crate::AppState;

/// Largest accepted upload
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// GET /predict query
///
/// Values arrive as strings so malformed numbers produce the JSON error body.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
}

/// GET /predict/:id/records query
#[derive(Debug, Default, Deserialize)]
pub struct RecordsQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub class: Option<String>,
    pub status: Option<String>,
}

/// POST /predict
///
/// Multipart form with a `file` part (CSV) and a `modelName` field. Returns
/// 201 once the batch and its jobs are stored; inference runs later.
pub async fn create_prediction(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<CreatePredictionResponse>)> {
    let mut multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let mut file: Option<Vec<u8>> = None;
    let mut model_name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {}", e)))?;
                file = Some(bytes.to_vec());
            }
            Some("modelName") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read modelName: {}", e)))?;
                model_name = Some(text);
            }
            other => {
                tracing::debug!(field = ?other, "Ignoring unknown multipart field");
            }
        }
    }

    let response = state
        .predictions
        .create(file.as_deref(), model_name.as_deref())
        .await?;

    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /predict
pub async fn list_predictions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Paginated<PredictionSummary>>> {
    let page = parse_page(query.page.as_deref(), query.limit.as_deref())?;
    Ok(Json(state.predictions.list(page).await?))
}

/// GET /predict/:id/records
pub async fn list_records(
    State(state): State<AppState>,
    Path(prediction_id): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> ApiResult<Json<Paginated<RecordView>>> {
    let prediction_id = parse_prediction_id(&prediction_id)?;
    let page = parse_page(query.page.as_deref(), query.limit.as_deref())?;

    let class = match query.class.as_deref() {
        Some(value) => value.parse::<ClassFilter>().map_err(ApiError::BadRequest)?,
        None => ClassFilter::All,
    };
    let status = match query.status.as_deref() {
        Some(value) => value.parse::<StatusFilter>().map_err(ApiError::BadRequest)?,
        None => StatusFilter::default(),
    };

    Ok(Json(
        state
            .predictions
            .get_records(prediction_id, page, class, status)
            .await?,
    ))
}

/// POST /predict/:id/re-predict
pub async fn re_predict(
    State(state): State<AppState>,
    Path(prediction_id): Path<String>,
) -> ApiResult<Json<RePredictResponse>> {
    let prediction_id = parse_prediction_id(&prediction_id)?;
    Ok(Json(state.predictions.re_predict(prediction_id).await?))
}

/// POST /predict/:id/cancel
pub async fn cancel_prediction(
    State(state): State<AppState>,
    Path(prediction_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let prediction_id = parse_prediction_id(&prediction_id)?;
    Ok(Json(state.predictions.cancel(prediction_id).await?))
}

fn parse_prediction_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid prediction ID: {}", raw)))
}

fn parse_page(page: Option<&str>, limit: Option<&str>) -> ApiResult<PageRequest> {
    let page = parse_int("page", page)?;
    let limit = parse_int("limit", limit)?;
    PageRequest::new(page, limit).map_err(ApiError::BadRequest)
}

fn parse_int(name: &str, value: Option<&str>) -> ApiResult<Option<i64>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("{} must be an integer (got '{}')", name, text))),
    }
}

/// Build prediction routes
pub fn predict_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/predict",
            post(create_prediction)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
                .get(list_predictions),
        )
        .route("/predict/:id/records", get(list_records))
        .route("/predict/:id/re-predict", post(re_predict))
        .route("/predict/:id/cancel", post(cancel_prediction))
}
