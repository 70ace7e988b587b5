//! Prometheusメトリクス定義。
use prometheus::{
    Counter, Gauge, Histogram, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // 処理ステートマシン
    pub content_processed: Counter,
    pub content_failed: Counter,
    pub transcription_retries: Counter,
    pub analysis_retries: Counter,

    // 生成
    pub generations_succeeded: Counter,
    pub generations_failed: Counter,
    pub generation_timeouts: Counter,
    pub regenerations: Counter,

    // スタイルキャッシュ
    pub style_cache_hits: Counter,
    pub style_cache_misses: Counter,

    // ヒストグラム
    pub transcription_duration: Histogram,
    pub analysis_duration: Histogram,
    pub platform_generation_duration: Histogram,
    pub generation_request_duration: Histogram,

    // ゲージ
    pub active_processing: Gauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成し、`registry` に登録する。
    ///
    /// # Errors
    /// 同名のメトリクスが既に登録されている場合。
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            content_processed: register_counter_with_registry!(
                "repurpose_content_processed_total",
                "Content items that reached the ready state",
                registry
            )?,
            content_failed: register_counter_with_registry!(
                "repurpose_content_failed_total",
                "Content items that reached the failed state",
                registry
            )?,
            transcription_retries: register_counter_with_registry!(
                "repurpose_transcription_retries_total",
                "Retries consumed by the transcription stage",
                registry
            )?,
            analysis_retries: register_counter_with_registry!(
                "repurpose_analysis_retries_total",
                "Retries consumed by the analysis stage",
                registry
            )?,
            generations_succeeded: register_counter_with_registry!(
                "repurpose_generations_succeeded_total",
                "Platform generations that passed validation and were persisted",
                registry
            )?,
            generations_failed: register_counter_with_registry!(
                "repurpose_generations_failed_total",
                "Platform generations that failed",
                registry
            )?,
            generation_timeouts: register_counter_with_registry!(
                "repurpose_generation_timeouts_total",
                "Platform generations cancelled by timeout",
                registry
            )?,
            regenerations: register_counter_with_registry!(
                "repurpose_regenerations_total",
                "Regeneration requests that produced a new version",
                registry
            )?,
            style_cache_hits: register_counter_with_registry!(
                "repurpose_style_cache_hits_total",
                "Style retrieval cache hits",
                registry
            )?,
            style_cache_misses: register_counter_with_registry!(
                "repurpose_style_cache_misses_total",
                "Style retrieval cache misses",
                registry
            )?,
            transcription_duration: register_histogram_with_registry!(
                "repurpose_transcription_duration_seconds",
                "Duration of the transcription stage",
                registry
            )?,
            analysis_duration: register_histogram_with_registry!(
                "repurpose_analysis_duration_seconds",
                "Duration of the analysis stage",
                registry
            )?,
            platform_generation_duration: register_histogram_with_registry!(
                "repurpose_platform_generation_duration_seconds",
                "Duration of a single platform dispatch",
                registry
            )?,
            generation_request_duration: register_histogram_with_registry!(
                "repurpose_generation_request_duration_seconds",
                "Duration of a whole fan-out generation request",
                registry
            )?,
            active_processing: register_gauge_with_registry!(
                "repurpose_active_processing",
                "Content items currently being processed by the worker",
                registry
            )?,
        })
    }
}
