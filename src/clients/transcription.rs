use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::util::error::PipelineError;

use super::headers::build_idempotent_headers;
use super::{check_status, map_send_error};

const SERVICE: &str = "transcription";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_secs: f64,
    pub end_secs: f64,
    pub text: String,
}

/// ジョブのポーリング結果。`transcript` は `Completed` の時のみ設定される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionPoll {
    pub status: TranscriptionStatus,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub timestamps: Option<Vec<TranscriptSegment>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TranscriptionPoll {
    /// 最後のタイムスタンプの終了時刻を長さとする。
    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        self.timestamps
            .as_ref()?
            .iter()
            .map(|segment| segment.end_secs)
            .fold(None, |acc: Option<f64>, end| {
                Some(acc.map_or(end, |current| current.max(end)))
            })
    }
}

/// Asynchronous speech-to-text service. `start` is idempotent per key.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn start(
        &self,
        storage_locator: &str,
        media_format: &str,
        idempotency_key: &str,
    ) -> Result<String, PipelineError>;

    async fn poll(&self, job_id: &str) -> Result<TranscriptionPoll, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct TranscriptionClient {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct StartPayload<'a> {
    storage_locator: &'a str,
    media_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    job_id: String,
}

impl TranscriptionClient {
    /// # Errors
    /// HTTPクライアントの構築やURLの解釈に失敗した場合。
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build transcription client")?;
        let base_url = Url::parse(&base_url.into()).context("invalid transcription base URL")?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, PipelineError> {
        self.base_url
            .join(path)
            .map_err(|error| PipelineError::Validation(format!("invalid transcription URL: {error}")))
    }
}

#[async_trait]
impl Transcriber for TranscriptionClient {
    async fn start(
        &self,
        storage_locator: &str,
        media_format: &str,
        idempotency_key: &str,
    ) -> Result<String, PipelineError> {
        let url = self.endpoint("v1/transcriptions")?;

        debug!(
            storage_locator,
            media_format, idempotency_key, "starting transcription job"
        );

        let response = self
            .client
            .post(url)
            .headers(build_idempotent_headers(idempotency_key))
            .json(&StartPayload {
                storage_locator,
                media_format,
            })
            .send()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        let body: StartResponse = check_status(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        if body.job_id.trim().is_empty() {
            return Err(PipelineError::transient(SERVICE, "empty job id"));
        }

        Ok(body.job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<TranscriptionPoll, PipelineError> {
        let url = self.endpoint(&format!("v1/transcriptions/{job_id}"))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // 期限切れのジョブはサービス側の一時的な失敗として扱い、再開させる
            return Ok(TranscriptionPoll {
                status: TranscriptionStatus::Failed,
                transcript: None,
                timestamps: None,
                error: Some(format!("job {job_id} not found")),
            });
        }

        check_status(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))
    }
}
