use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::util::error::PipelineError;

use super::{check_status, map_send_error};

const SERVICE: &str = "embedder";

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct EmbedderClient {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct EmbedPayload<'a> {
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

impl EmbedderClient {
    /// # Errors
    /// HTTPクライアントの構築やURLの解釈に失敗した場合。
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build embedder client")?;
        let base_url = Url::parse(&base_url.into()).context("invalid embedder base URL")?;

        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl Embedder for EmbedderClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let url = self
            .base_url
            .join("v1/embeddings")
            .map_err(|error| PipelineError::Validation(format!("invalid embedder URL: {error}")))?;

        let response = self
            .client
            .post(url)
            .json(&EmbedPayload { input: text })
            .send()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        let body: EmbedResponse = check_status(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        if body.embedding.is_empty() {
            return Err(PipelineError::transient(SERVICE, "empty embedding vector"));
        }

        Ok(body.embedding)
    }
}
