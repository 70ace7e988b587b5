//! 指数バックオフ付き再試行ロジック。
//!
//! ステージごとの予算（再試行回数）を超えた時点で最後のエラーを返す。
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::util::error::PipelineError;

/// 再試行戦略の設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// 初回を除く最大再試行回数
    pub max_retries: usize,
    /// ベースとなる遅延時間（ミリ秒）
    pub base_delay_ms: u64,
    /// 最大遅延時間（ミリ秒）
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn new(max_retries: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// 遅延なしの設定（テストや即時再試行用）。
    #[must_use]
    pub const fn immediate(max_retries: usize) -> Self {
        Self::new(max_retries, 0, 0)
    }

    /// 指定された再試行回数に対する遅延時間を計算する。
    ///
    /// `retry` は1から始まる。base=1s なら 1s, 2s, 4s, ... となる。
    #[must_use]
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let shift = u32::try_from(retry - 1).unwrap_or(u32::MAX).min(63);
        let exponential = self.base_delay_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(exponential.min(self.max_delay_ms))
    }

    #[must_use]
    pub const fn can_retry(&self, retries_done: usize) -> bool {
        retries_done < self.max_retries
    }

    /// 総試行回数（初回を含む）。
    #[must_use]
    pub const fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// `operation` を再試行可能なエラーの間だけ繰り返す。
///
/// レート制限の場合はバックオフとサービス指定の待機時間のうち長い方を待つ。
/// `on_retry` は再試行の直前に呼ばれる（メトリクスやログ用）。
///
/// # Errors
/// 再試行不可能なエラー、または予算を使い切った後の最後のエラーを返す。
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    stage: &str,
    mut operation: F,
    mut on_retry: impl FnMut(usize, &PipelineError),
) -> Result<T, PipelineError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut retries = 0;

    loop {
        match operation(retries).await {
            Ok(value) => {
                if retries > 0 {
                    info!(stage, retries, "stage succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retryable() {
                    warn!(stage, error = %error, "error is not retryable");
                    return Err(error);
                }

                if !config.can_retry(retries) {
                    warn!(
                        stage,
                        attempts = retries + 1,
                        error = %error,
                        "stage failed after exhausting retry budget"
                    );
                    return Err(error);
                }

                retries += 1;
                let backoff = config.delay_for_retry(retries);
                let delay = error
                    .retry_after()
                    .map_or(backoff, |hint| hint.max(backoff));

                warn!(
                    stage,
                    retry = retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "stage failed, retrying after delay"
                );
                on_retry(retries, &error);

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
