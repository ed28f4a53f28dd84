//! In-process stand-in for the inference service
//!
//! Deterministic per-row results: `proba = first value / 10` (capped at 1),
//! class 1 when `proba >= 0.5`. Rows whose first value is negative are
//! rejected with a 500 while `reject_negative` is set.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use xplat_predict::services::{
    DataframeSplitRequest, InferenceApi, InferenceError, ModelInfo, PredictOutput, WaterfallOutput,
};

/// 1x1 transparent PNG
pub const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

/// Switches controlling which calls fail
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub reject_negative: bool,
    pub fail_predict: bool,
    pub fail_waterfall: bool,
    /// Waterfall returns a payload that is not valid base64
    pub corrupt_waterfall_image: bool,
    pub fail_heatmap: bool,
    pub fail_beeswarm: bool,
    pub fail_models: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            reject_negative: true,
            fail_predict: false,
            fail_waterfall: false,
            corrupt_waterfall_image: false,
            fail_heatmap: false,
            fail_beeswarm: false,
            fail_models: false,
        }
    }
}

/// Pauses `predict` until released, for cancel-while-in-flight tests
#[derive(Default)]
pub struct PredictGate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
pub struct FakeInference {
    behavior: Mutex<FakeBehavior>,
    gate: Mutex<Option<Arc<PredictGate>>>,
    pub predict_calls: AtomicUsize,
    pub waterfall_calls: AtomicUsize,
    pub heatmap_calls: AtomicUsize,
    pub beeswarm_calls: AtomicUsize,
    /// Row count of the last heatmap request
    pub last_summary_rows: AtomicUsize,
}

impl FakeInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, update: impl FnOnce(&mut FakeBehavior)) {
        let mut behavior = self.behavior.lock().unwrap();
        update(&mut *behavior);
    }

    /// Install a gate that every subsequent predict call waits on
    pub fn gate_predict(&self) -> Arc<PredictGate> {
        let gate = Arc::new(PredictGate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn predict_count(&self) -> usize {
        self.predict_calls.load(Ordering::SeqCst)
    }

    pub fn waterfall_count(&self) -> usize {
        self.waterfall_calls.load(Ordering::SeqCst)
    }

    fn behavior(&self) -> FakeBehavior {
        self.behavior.lock().unwrap().clone()
    }
}

fn first_value(request: &DataframeSplitRequest) -> f64 {
    request
        .dataframe_split
        .data
        .first()
        .and_then(|row| row.first())
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

#[async_trait]
impl InferenceApi for FakeInference {
    async fn predict(
        &self,
        _model: &str,
        request: &DataframeSplitRequest,
    ) -> Result<Vec<PredictOutput>, InferenceError> {
        self.predict_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let behavior = self.behavior();
        let x = first_value(request);
        if behavior.fail_predict || (behavior.reject_negative && x < 0.0) {
            return Err(InferenceError::ApiError(500, "model rejected row".to_string()));
        }

        let proba = (x / 10.0).min(1.0);
        Ok(vec![PredictOutput {
            id: None,
            proba,
            class: if proba >= 0.5 { 1 } else { 0 },
        }])
    }

    async fn explain_waterfall(
        &self,
        _model: &str,
        _request: &DataframeSplitRequest,
    ) -> Result<Vec<WaterfallOutput>, InferenceError> {
        self.waterfall_calls.fetch_add(1, Ordering::SeqCst);

        let behavior = self.behavior();
        if behavior.fail_waterfall {
            return Err(InferenceError::ApiError(503, "explainer unavailable".to_string()));
        }

        let image = if behavior.corrupt_waterfall_image {
            "%%% not an image %%%".to_string()
        } else {
            PNG_B64.to_string()
        };
        Ok(vec![WaterfallOutput {
            id: None,
            waterfall: image,
        }])
    }

    async fn explain_heatmap(
        &self,
        _model: &str,
        request: &DataframeSplitRequest,
    ) -> Result<String, InferenceError> {
        self.heatmap_calls.fetch_add(1, Ordering::SeqCst);
        self.last_summary_rows
            .store(request.dataframe_split.data.len(), Ordering::SeqCst);

        if self.behavior().fail_heatmap {
            return Err(InferenceError::ApiError(500, "heatmap failed".to_string()));
        }
        Ok(PNG_B64.to_string())
    }

    async fn explain_beeswarm(
        &self,
        _model: &str,
        _request: &DataframeSplitRequest,
    ) -> Result<String, InferenceError> {
        self.beeswarm_calls.fetch_add(1, Ordering::SeqCst);

        if self.behavior().fail_beeswarm {
            return Err(InferenceError::ApiError(500, "beeswarm failed".to_string()));
        }
        Ok(PNG_B64.to_string())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        if self.behavior().fail_models {
            return Err(InferenceError::NetworkError("connection refused".to_string()));
        }

        Ok(vec![ModelInfo {
            model_name: "churn-xgb".to_string(),
            run_id: Some("run-42".to_string()),
            version: Some("3".to_string()),
            metrics: [("auc".to_string(), 0.91)].into_iter().collect(),
        }])
    }
}
