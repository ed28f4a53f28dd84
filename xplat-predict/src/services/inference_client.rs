//! Inference service client
//!
//! Talks to the model-serving ingress: predictions, SHAP explanations and the
//! list of production models. Every request carries a fixed `Host` header,
//! which the ingress uses to route to the inference service.
//!
//! The orchestrator depends on the [`InferenceApi`] trait rather than the HTTP
//! client so tests can substitute an in-process fake.

use async_trait::async_trait;
use reqwest::header::HOST;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use xplat_common::config::InferenceConfig;

/// Inference client errors
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Inference API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Inference API returned no results")]
    EmptyResult,

    #[error("Invalid inference response: {0}")]
    InvalidResponse(String),

    #[error("Invalid inference URL: {0}")]
    InvalidUrl(String),
}

/// Request body shared by all predict/explain endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataframeSplitRequest {
    pub dataframe_split: DataframeSplit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataframeSplit {
    pub columns: Vec<String>,
    pub data: Vec<Vec<Value>>,
}

impl DataframeSplitRequest {
    pub fn new(columns: Vec<String>, data: Vec<Vec<Value>>) -> Self {
        Self {
            dataframe_split: DataframeSplit { columns, data },
        }
    }
}

/// One row of a predict response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictOutput {
    #[serde(default)]
    pub id: Option<Value>,
    pub proba: f64,
    #[serde(deserialize_with = "deserialize_class")]
    pub class: i64,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predict: Vec<PredictOutput>,
}

/// One row of a waterfall response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterfallOutput {
    #[serde(default)]
    pub id: Option<Value>,
    /// Base64-encoded PNG
    pub waterfall: String,
}

#[derive(Debug, Deserialize)]
struct WaterfallResponse {
    explain: Vec<WaterfallOutput>,
}

/// Heatmap and beeswarm responses carry a single base64 image
#[derive(Debug, Deserialize)]
struct SummaryPlotResponse {
    explain: String,
}

/// Production model as reported by the inference service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

/// Classes may arrive as `1` or `1.0`
fn deserialize_class<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value.fract() != 0.0 {
        return Err(serde::de::Error::custom(format!("class {} is not an integer", value)));
    }
    Ok(value as i64)
}

/// Operations the prediction pipeline needs from the inference service
#[async_trait]
pub trait InferenceApi: Send + Sync {
    /// `POST /v1/predict/{model}`
    async fn predict(
        &self,
        model: &str,
        request: &DataframeSplitRequest,
    ) -> Result<Vec<PredictOutput>, InferenceError>;

    /// `POST /v1/explain/waterfall/{model}`
    async fn explain_waterfall(
        &self,
        model: &str,
        request: &DataframeSplitRequest,
    ) -> Result<Vec<WaterfallOutput>, InferenceError>;

    /// `POST /v1/explain/heatmap/{model}`, base64 PNG
    async fn explain_heatmap(
        &self,
        model: &str,
        request: &DataframeSplitRequest,
    ) -> Result<String, InferenceError>;

    /// `POST /v1/explain/beeswarm/{model}`, base64 PNG
    async fn explain_beeswarm(
        &self,
        model: &str,
        request: &DataframeSplitRequest,
    ) -> Result<String, InferenceError>;

    /// `GET /v1/models`
    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError>;
}

/// HTTP implementation of [`InferenceApi`]
pub struct InferenceClient {
    http_client: reqwest::Client,
    base_url: reqwest::Url,
    host_header: String,
}

impl InferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| InferenceError::NetworkError(e.to_string()))?;

        let base_url = reqwest::Url::parse(&config.base_url)
            .map_err(|e| InferenceError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(InferenceError::InvalidUrl(config.base_url.clone()));
        }

        Ok(Self {
            http_client,
            base_url,
            host_header: config.host_header.clone(),
        })
    }

    /// Base URL plus path segments; each segment is escaped on its own
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, InferenceError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| InferenceError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        segments: &[&str],
        request: &DataframeSplitRequest,
    ) -> Result<T, InferenceError> {
        let url = self.endpoint(segments)?;
        tracing::debug!(url = %url, rows = request.dataframe_split.data.len(), "Calling inference API");

        let response = self
            .http_client
            .post(url)
            .header(HOST, &self.host_header)
            .json(request)
            .send()
            .await
            .map_err(|e| InferenceError::NetworkError(e.to_string()))?;

        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, InferenceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::ApiError(status.as_u16(), truncate(&body, 500)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| InferenceError::NetworkError(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| InferenceError::ParseError(e.to_string()))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl InferenceApi for InferenceClient {
    async fn predict(
        &self,
        model: &str,
        request: &DataframeSplitRequest,
    ) -> Result<Vec<PredictOutput>, InferenceError> {
        let response: PredictResponse = self.post_json(&["v1", "predict", model], request).await?;
        if response.predict.is_empty() {
            return Err(InferenceError::EmptyResult);
        }
        Ok(response.predict)
    }

    async fn explain_waterfall(
        &self,
        model: &str,
        request: &DataframeSplitRequest,
    ) -> Result<Vec<WaterfallOutput>, InferenceError> {
        let response: WaterfallResponse = self
            .post_json(&["v1", "explain", "waterfall", model], request)
            .await?;
        if response.explain.is_empty() {
            return Err(InferenceError::EmptyResult);
        }
        Ok(response.explain)
    }

    async fn explain_heatmap(
        &self,
        model: &str,
        request: &DataframeSplitRequest,
    ) -> Result<String, InferenceError> {
        let response: SummaryPlotResponse = self
            .post_json(&["v1", "explain", "heatmap", model], request)
            .await?;
        non_empty(response.explain)
    }

    async fn explain_beeswarm(
        &self,
        model: &str,
        request: &DataframeSplitRequest,
    ) -> Result<String, InferenceError> {
        let response: SummaryPlotResponse = self
            .post_json(&["v1", "explain", "beeswarm", model], request)
            .await?;
        non_empty(response.explain)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let url = self.endpoint(&["v1", "models"])?;
        tracing::debug!(url = %url, "Fetching production models");

        let response = self
            .http_client
            .get(url)
            .header(HOST, &self.host_header)
            .send()
            .await
            .map_err(|e| InferenceError::NetworkError(e.to_string()))?;

        Self::decode(response).await
    }
}

fn non_empty(image: String) -> Result<String, InferenceError> {
    if image.trim().is_empty() {
        Err(InferenceError::EmptyResult)
    } else {
        Ok(image)
    }
}
