use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::config::InferenceConfig;

/// Errors that can occur while bridging a prediction request
#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Inference service unreachable: {0}")]
    Unreachable(String),

    #[error("Inference service returned status {0}")]
    UpstreamStatus(u16),

    #[error("Failed to decode inference response: {0}")]
    Decode(String),
}

/// Canonical vehicle feature set accepted by the prediction endpoint.
///
/// Missing fields take their zero values; fields outside this schema
/// are dropped when the body is re-encoded for the inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VehicleFeatures {
    pub brand: String,
    pub year: i32,
    pub engine_size: f64,
    pub fuel_type: String,
    pub transmission: String,
    pub mileage: i64,
    pub condition: String,
    pub model: String,
}

/// HTTP client for the inference service
pub struct InferenceClient {
    http: reqwest::Client,
    url: String,
}

impl InferenceClient {
    pub fn new(config: &InferenceConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build inference HTTP client")?;

        Ok(Self {
            http,
            url: config.url.clone(),
        })
    }

    /// Decode the raw body into the canonical schema, then forward it.
    /// Bodies that do not decode are rejected without an upstream call.
    pub async fn predict(&self, body: &[u8]) -> Result<serde_json::Map<String, Value>, PredictError> {
        let features: VehicleFeatures =
            serde_json::from_slice(body).map_err(|e| PredictError::InvalidBody(e.to_string()))?;

        self.forward(&features).await
    }

    /// POST the canonical features to the inference service and decode
    /// the JSON object it returns. Upstream error bodies are discarded.
    #[instrument(skip(self, features), fields(url = %self.url))]
    pub async fn forward(
        &self,
        features: &VehicleFeatures,
    ) -> Result<serde_json::Map<String, Value>, PredictError> {
        let response = self
            .http
            .post(&self.url)
            .json(features)
            .send()
            .await
            .map_err(|e| PredictError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PredictError::UpstreamStatus(status.as_u16()));
        }

        response
            .json::<serde_json::Map<String, Value>>()
            .await
            .map_err(|e| PredictError::Decode(e.to_string()))
    }
}
