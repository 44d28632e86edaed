//! HTTP-backed text generation provider.
//!
//! Speaks a minimal JSON contract: POST `{model, prompt}` to the endpoint,
//! read `{text}` back. Server-side and transport trouble is classified as
//! retryable; client errors mean the request itself is wrong and retrying
//! cannot help.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{ServiceError, TextGenerator};

const SERVICE: &str = "text-generation";

pub struct HttpTextGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

impl HttpTextGenerator {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }

    fn classify_transport(e: reqwest::Error) -> ServiceError {
        if e.is_builder() {
            ServiceError::fatal(SERVICE, e.to_string())
        } else {
            // Timeouts, connect failures and mid-body drops are transient.
            ServiceError::retryable(SERVICE, e.to_string())
        }
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ServiceError::retryable(
                SERVICE,
                format!("endpoint returned {status}"),
            ));
        }
        if !status.is_success() {
            return Err(ServiceError::fatal(
                SERVICE,
                format!("endpoint rejected request with {status}"),
            ));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::fatal(SERVICE, format!("malformed response: {e}")))?;

        if parsed.text.trim().is_empty() {
            return Err(ServiceError::retryable(SERVICE, "empty completion"));
        }
        Ok(parsed.text)
    }
}
