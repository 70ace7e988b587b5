//! エラー分類とリトライ判定ユーティリティ。
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::models::Platform;

/// エラーの種類。失敗記録にも保存される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 入力の形や制約が不正（リトライ不可）
    Validation,
    /// テキストが短すぎる（リトライ不可）
    InsufficientContent,
    /// スタイルプロファイルが未準備（リトライ不可）
    NoStyleProfile,
    /// 外部サービスの一時的な障害（ステージのポリシーに従いリトライ）
    TransientService,
    /// レート制限（バックオフ予算内でのみリトライ）
    RateLimited,
    /// 生成結果がプラットフォーム制約を満たさない
    ConstraintViolation,
    Timeout,
    NotFound,
    /// 条件付き書き込みの競合
    Conflict,
    Store,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::InsufficientContent => "insufficient_content",
            ErrorKind::NoStyleProfile => "no_style_profile",
            ErrorKind::TransientService => "transient_service",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Store => "store",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(ErrorKind::Validation),
            "insufficient_content" => Some(ErrorKind::InsufficientContent),
            "no_style_profile" => Some(ErrorKind::NoStyleProfile),
            "transient_service" => Some(ErrorKind::TransientService),
            "rate_limited" => Some(ErrorKind::RateLimited),
            "constraint_violation" => Some(ErrorKind::ConstraintViolation),
            "timeout" => Some(ErrorKind::Timeout),
            "not_found" => Some(ErrorKind::NotFound),
            "conflict" => Some(ErrorKind::Conflict),
            "store" => Some(ErrorKind::Store),
            _ => None,
        }
    }

    /// ステージのリトライ予算を消費して再試行してよい種類か。
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientService | ErrorKind::RateLimited)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient content: {words} words, at least {minimum} required")]
    InsufficientContent { words: usize, minimum: usize },

    #[error("style profile for user {user_id} is not ready ({exemplar_count} exemplars)")]
    NoStyleProfile { user_id: uuid::Uuid, exemplar_count: usize },

    #[error("{service} unavailable: {message}")]
    TransientService {
        service: &'static str,
        message: String,
    },

    #[error("{service} rate limited (retry after {retry_after:?})")]
    RateLimited {
        service: &'static str,
        retry_after: Option<Duration>,
    },

    #[error("{platform} output violates platform constraints: {}", errors.join("; "))]
    ConstraintViolation {
        platform: Platform,
        errors: Vec<String>,
    },

    #[error("{scope} timed out after {after:?}")]
    Timeout { scope: String, after: Duration },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("metadata store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::InsufficientContent { .. } => ErrorKind::InsufficientContent,
            PipelineError::NoStyleProfile { .. } => ErrorKind::NoStyleProfile,
            PipelineError::TransientService { .. } => ErrorKind::TransientService,
            PipelineError::RateLimited { .. } => ErrorKind::RateLimited,
            PipelineError::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::NotFound { .. } => ErrorKind::NotFound,
            PipelineError::Conflict(_) => ErrorKind::Conflict,
            PipelineError::Store(_) => ErrorKind::Store,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// レート制限時にサービスが示した待機時間。
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PipelineError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn store(error: anyhow::Error) -> Self {
        PipelineError::Store(error)
    }

    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        PipelineError::TransientService {
            service,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        PipelineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
