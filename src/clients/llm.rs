use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::util::error::PipelineError;

use super::{check_status, map_send_error};

const SERVICE: &str = "language-model";

/// One completion call. `seed` pins sampling so identical requests reproduce identical text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct LlmClient {
    client: Client,
    base_url: Url,
    model: String,
}

#[derive(Debug, Serialize)]
struct CompletionPayload<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a CompletionRequest,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    text: String,
}

impl LlmClient {
    /// # Errors
    /// HTTPクライアントの構築やURLの解釈に失敗した場合。
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build language-model client")?;
        let base_url = Url::parse(&base_url.into()).context("invalid language-model base URL")?;

        Ok(Self {
            client,
            base_url,
            model: model.into(),
        })
    }

    /// # Errors
    /// ヘルスエンドポイントが応答しない、またはエラーステータスを返した場合。
    pub async fn health_check(&self) -> Result<()> {
        let url = self
            .base_url
            .join("health")
            .context("failed to build language-model health URL")?;

        self.client
            .get(url)
            .send()
            .await
            .context("language-model health request failed")?
            .error_for_status()
            .context("language-model health endpoint returned error status")?;

        Ok(())
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, PipelineError> {
        let url = self
            .base_url
            .join("v1/complete")
            .map_err(|error| PipelineError::Validation(format!("invalid completion URL: {error}")))?;

        debug!(
            model = %self.model,
            temperature = request.temperature,
            max_tokens = request.max_tokens,
            prompt_chars = request.prompt.len(),
            "sending completion request"
        );

        let response = self
            .client
            .post(url)
            .json(&CompletionPayload {
                model: &self.model,
                request,
            })
            .send()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        let response = check_status(SERVICE, response).await?;
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        Ok(body.text)
    }
}
