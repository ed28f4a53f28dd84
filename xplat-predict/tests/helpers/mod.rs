//! Test Helper Utilities
//!
//! Shared utilities for testing xplat-predict

#![allow(dead_code)]

pub mod fake_inference;

pub use fake_inference::{FakeBehavior, FakeInference, PredictGate, PNG_B64};

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::util::ServiceExt;
use uuid::Uuid;
use xplat_common::config::{QueueConfig, StorageConfig};
use xplat_predict::services::{
    InferenceApi, JobQueue, LocalArtifactStore, PredictionProcessor, WorkerPool,
};
use xplat_predict::{build_router, AppState};

pub const TEST_SECRET: &str = "test-secret";
pub const TEST_PUBLIC_URL: &str = "http://localhost:5730";
pub const MULTIPART_BOUNDARY: &str = "XPLATTESTBOUNDARY";

/// Service wired against a temporary database and artifact folder
///
/// The TempDir must stay alive for the duration of the test.
pub struct TestApp {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub state: AppState,
    pub inference: Arc<FakeInference>,
    pub workers: WorkerPool,
}

impl TestApp {
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn processor(&self) -> PredictionProcessor {
        let artifacts: Arc<dyn xplat_predict::services::ArtifactStore> =
            self.state.artifact_files.clone();
        PredictionProcessor::new(self.pool.clone(), self.inference.clone(), artifacts)
    }

    /// Run queued jobs until the queue has nothing runnable
    pub async fn drain(&self) -> usize {
        self.workers.drain().await.unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.unwrap()
    }

    /// POST /predict and return the new prediction id
    pub async fn create_prediction(&self, csv: &str, model_name: &str) -> Uuid {
        let response = self
            .send(multipart_request(Some(csv), Some(model_name)))
            .await;
        assert_eq!(response.status(), axum::http::StatusCode::CREATED);
        let json = body_json(response).await;
        json["predictionId"].as_str().unwrap().parse().unwrap()
    }

    pub async fn job_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    pub async fn record_statuses(&self, prediction_id: Uuid) -> Vec<String> {
        sqlx::query_scalar(
            "SELECT status FROM prediction_records WHERE prediction_id = ? ORDER BY record_number",
        )
        .bind(prediction_id.to_string())
        .fetch_all(&self.pool)
        .await
        .unwrap()
    }
}

pub fn queue_config() -> QueueConfig {
    QueueConfig {
        worker_count: 2,
        max_attempts: 3,
        retry_backoff: Duration::from_millis(20),
        poll_interval: Duration::from_millis(50),
    }
}

pub async fn create_test_app() -> TestApp {
    create_test_app_with(queue_config()).await
}

pub async fn create_test_app_with(queue: QueueConfig) -> TestApp {
    let dir = TempDir::new().unwrap();
    let pool = xplat_common::db::init_database(&dir.path().join("predict.db"))
        .await
        .unwrap();

    let inference = Arc::new(FakeInference::new());
    let artifact_files = Arc::new(LocalArtifactStore::new(&StorageConfig {
        artifact_folder: dir.path().join("artifacts"),
        public_base_url: TEST_PUBLIC_URL.to_string(),
        signing_secret: TEST_SECRET.to_string(),
        presign_ttl: Duration::from_secs(3600),
    })
    .unwrap());
    let job_queue = Arc::new(JobQueue::new(pool.clone(), &queue));

    let api: Arc<dyn InferenceApi> = inference.clone();
    let state = AppState::new(pool.clone(), job_queue, api, artifact_files);
    let workers = state.worker_pool(queue.worker_count);

    TestApp {
        dir,
        pool,
        state,
        inference,
        workers,
    }
}

/// Build a POST /predict multipart request; `None` omits the part
pub fn multipart_request(csv: Option<&str>, model_name: Option<&str>) -> Request<Body> {
    let mut body = String::new();
    if let Some(model_name) = model_name {
        body.push_str(&format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"modelName\"\r\n\r\n{v}\r\n",
            b = MULTIPART_BOUNDARY,
            v = model_name
        ));
    }
    if let Some(csv) = csv {
        body.push_str(&format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"data.csv\"\r\nContent-Type: text/csv\r\n\r\n{v}\r\n",
            b = MULTIPART_BOUNDARY,
            v = csv
        ));
    }
    body.push_str(&format!("--{}--\r\n", MULTIPART_BOUNDARY));

    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
