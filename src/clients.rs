//! Collaborator seams. Each collaborator is a trait consumed by the pipeline, with a
//! `reqwest` implementation for the deployed worker.

pub mod embedder;
pub(crate) mod headers;
pub mod llm;
pub mod storage;
pub mod transcription;
pub mod vector_search;

use chrono::Utc;
use reqwest::{Response, StatusCode};

use crate::util::error::PipelineError;

pub use embedder::{Embedder, EmbedderClient};
pub use llm::{CompletionRequest, LanguageModel, LlmClient};
pub use storage::{HttpObjectStorage, MemoryObjectStorage, ObjectStorage};
pub use transcription::{
    TranscriptSegment, Transcriber, TranscriptionClient, TranscriptionPoll, TranscriptionStatus,
};
pub use vector_search::{
    ExemplarMetadata, MemoryVectorSearch, VectorMatch, VectorSearch, VectorSearchClient,
};

const MAX_ERROR_BODY_CHARS: usize = 500;

/// 送信時のreqwestエラーを分類する。タイムアウトや接続失敗は一時的な障害として扱う。
pub(crate) fn map_send_error(service: &'static str, error: &reqwest::Error) -> PipelineError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        return PipelineError::transient(service, error.to_string());
    }
    if error.is_decode() {
        return PipelineError::transient(service, format!("malformed response: {error}"));
    }
    PipelineError::transient(service, error.to_string())
}

/// ステータスコードからエラー種別を決める。
///
/// - 2xx: そのまま返す
/// - 429: レート制限（Retry-After を保持）
/// - 5xx / 408: 一時的な障害
/// - その他の4xx: リクエスト不正（リトライ不可）
pub(crate) async fn check_status(
    service: &'static str,
    response: Response,
) -> Result<Response, PipelineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers::parse_retry_after(response.headers(), Utc::now());
        return Err(PipelineError::RateLimited {
            service,
            retry_after,
        });
    }

    let body = response.text().await.unwrap_or_default();
    let body = crate::util::text::truncate_chars(&body, MAX_ERROR_BODY_CHARS);

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Err(PipelineError::transient(
            service,
            format!("status {status}: {body}"),
        ));
    }

    Err(PipelineError::Validation(format!(
        "{service} rejected request with status {status}: {body}"
    )))
}
