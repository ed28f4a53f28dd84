//! GET /artifacts/*key: serves stored plot images behind signed URLs

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: Option<i64>,
    pub signature: Option<String>,
}

/// GET /artifacts/*key?expires=&signature=
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> ApiResult<impl IntoResponse> {
    let (Some(expires), Some(signature)) = (query.expires, query.signature) else {
        return Err(ApiError::Forbidden("Missing expires or signature".to_string()));
    };

    let now = chrono::Utc::now().timestamp();
    let bytes = state
        .artifact_files
        .read_signed(&key, expires, &signature, now)
        .await?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "private, max-age=300"),
        ],
        bytes,
    ))
}

pub fn artifact_routes() -> Router<AppState> {
    Router::new().route("/artifacts/*key", get(get_artifact))
}
