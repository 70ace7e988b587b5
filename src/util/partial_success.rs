//! 部分成功の集計。プラットフォームごとの成否をまとめる。
use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::store::models::{GeneratedContent, Platform};
use crate::util::error::{ErrorKind, PipelineError};

/// 1プラットフォーム分の失敗。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformFailure {
    pub platform: Platform,
    pub kind: ErrorKind,
    pub message: String,
}

impl PlatformFailure {
    #[must_use]
    pub fn from_error(platform: Platform, error: &PipelineError) -> Self {
        Self {
            platform,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// One fan-out request: a result per requested platform.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub content_id: Uuid,
    pub results: BTreeMap<Platform, Result<GeneratedContent, PlatformFailure>>,
}

impl GenerationOutcome {
    #[must_use]
    pub fn new(content_id: Uuid) -> Self {
        Self {
            content_id,
            results: BTreeMap::new(),
        }
    }

    pub fn record_success(&mut self, generated: GeneratedContent) {
        self.results.insert(generated.platform, Ok(generated));
    }

    pub fn record_failure(&mut self, failure: PlatformFailure) {
        self.results.insert(failure.platform, Err(failure));
    }

    #[must_use]
    pub fn get(&self, platform: Platform) -> Option<&Result<GeneratedContent, PlatformFailure>> {
        self.results.get(&platform)
    }

    pub fn successes(&self) -> impl Iterator<Item = &GeneratedContent> {
        self.results.values().filter_map(|result| result.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &PlatformFailure> {
        self.results.values().filter_map(|result| result.as_ref().err())
    }

    #[must_use]
    pub fn succeeded_platforms(&self) -> Vec<Platform> {
        self.successes().map(|generated| generated.platform).collect()
    }

    #[must_use]
    pub fn failed_platforms(&self) -> Vec<Platform> {
        self.failures().map(|failure| failure.platform).collect()
    }

    /// 要求されたが成功しなかったプラットフォーム（失敗・結果なしの両方）。
    #[must_use]
    pub fn missing_platforms(&self, requested: &[Platform]) -> Vec<Platform> {
        let mut missing: Vec<Platform> = requested
            .iter()
            .copied()
            .filter(|platform| !matches!(self.results.get(platform), Some(Ok(_))))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    /// すべて成功したかどうか。
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.results.values().all(Result::is_ok)
    }
}
