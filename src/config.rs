use std::{env, net::SocketAddr, num::NonZeroUsize, time::Duration};

use thiserror::Error;

use crate::observability::tracing::TracingSettings;
use crate::pipeline::orchestrator::GenerationSettings;
use crate::pipeline::processing::ProcessingSettings;
use crate::util::retry::RetryConfig;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

const BACKOFF_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    repurpose_db_dsn: String,
    object_storage_base_url: String,
    transcription_base_url: String,
    llm_base_url: String,
    embedder_base_url: String,
    vector_search_base_url: String,
    http_client_timeout: Duration,
    llm_model: String,
    llm_max_tokens: u32,
    llm_timeout: Duration,
    generation_platform_timeout: Duration,
    generation_request_deadline: Duration,
    generation_max_concurrency: NonZeroUsize,
    transcription_max_retries: usize,
    transcription_backoff_base_ms: u64,
    transcription_poll_interval: Duration,
    transcription_poll_timeout: Duration,
    analysis_max_retries: usize,
    analysis_min_words: usize,
    style_cache_ttl: Duration,
    style_cache_capacity: NonZeroUsize,
    processing_worker_concurrency: NonZeroUsize,
    processing_worker_poll_interval: Duration,
    otel_exporter_endpoint: Option<String>,
    otel_sampling_ratio: f64,
    repurpose_db_max_connections: u32,
    repurpose_db_min_connections: u32,
    repurpose_db_acquire_timeout: Duration,
    repurpose_db_idle_timeout: Duration,
    repurpose_db_max_lifetime: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数から Repurpose Worker の設定値を読み込み、検証する。
    ///
    /// # Errors
    /// 必須の接続先（DB DSN と各コラボレーターのベースURL）が未設定、
    /// もしくは各種値のパースに失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let repurpose_db_dsn = env_var("REPURPOSE_DB_DSN")?;
        let object_storage_base_url = env_var("OBJECT_STORAGE_BASE_URL")?;
        let transcription_base_url = env_var("TRANSCRIPTION_BASE_URL")?;
        let llm_base_url = env_var("LLM_BASE_URL")?;
        let embedder_base_url = env_var("EMBEDDER_BASE_URL")?;
        let vector_search_base_url = env_var("VECTOR_SEARCH_BASE_URL")?;
        let http_bind = parse_socket_addr("REPURPOSE_WORKER_HTTP_BIND", "0.0.0.0:9010")?;
        let http_client_timeout = parse_duration_secs("HTTP_CLIENT_TIMEOUT_SECS", 30)?;

        // Language model
        let llm_model = env::var("LLM_MODEL").unwrap_or_else(|_| "writer-large".to_string());
        let llm_max_tokens = parse_u32("LLM_MAX_TOKENS", 1024)?;
        let llm_timeout = parse_duration_secs("LLM_TIMEOUT_SECS", 60)?;

        // Fan-out generation
        let generation_platform_timeout =
            parse_duration_secs("GENERATION_PLATFORM_TIMEOUT_SECS", 15)?;
        let generation_request_deadline =
            parse_duration_secs("GENERATION_REQUEST_DEADLINE_SECS", 45)?;
        let generation_max_concurrency = parse_non_zero_usize("GENERATION_MAX_CONCURRENCY", 4)?;

        // Processing stages
        let transcription_max_retries = parse_usize("TRANSCRIPTION_MAX_RETRIES", 3)?;
        let transcription_backoff_base_ms = parse_u64("TRANSCRIPTION_BACKOFF_BASE_MS", 1000)?;
        let transcription_poll_interval = parse_duration_ms("TRANSCRIPTION_POLL_INTERVAL_MS", 2000)?;
        let transcription_poll_timeout = parse_duration_secs("TRANSCRIPTION_POLL_TIMEOUT_SECS", 900)?;
        let analysis_max_retries = parse_usize("ANALYSIS_MAX_RETRIES", 2)?;
        let analysis_min_words = parse_usize("ANALYSIS_MIN_WORDS", 500)?;

        // Style cache
        let style_cache_ttl = parse_duration_secs("STYLE_CACHE_TTL_SECS", 300)?;
        let style_cache_capacity = parse_non_zero_usize("STYLE_CACHE_CAPACITY", 1024)?;

        // Background worker
        let processing_worker_concurrency =
            parse_non_zero_usize("PROCESSING_WORKER_CONCURRENCY", num_cpus::get())?;
        let processing_worker_poll_interval = parse_duration_ms("PROCESSING_WORKER_POLL_MS", 1000)?;

        // OpenTelemetry settings
        let otel_exporter_endpoint = env::var("OTEL_EXPORTER_ENDPOINT").ok();
        let otel_sampling_ratio = parse_f64("OTEL_SAMPLING_RATIO", 1.0)?;

        // Connection pool
        let repurpose_db_max_connections = parse_u32("REPURPOSE_DB_MAX_CONNECTIONS", 10)?;
        let repurpose_db_min_connections = parse_u32("REPURPOSE_DB_MIN_CONNECTIONS", 1)?;
        let repurpose_db_acquire_timeout =
            parse_duration_secs("REPURPOSE_DB_ACQUIRE_TIMEOUT_SECS", 5)?;
        let repurpose_db_idle_timeout = parse_duration_secs("REPURPOSE_DB_IDLE_TIMEOUT_SECS", 600)?;
        let repurpose_db_max_lifetime =
            parse_duration_secs("REPURPOSE_DB_MAX_LIFETIME_SECS", 1800)?;

        Ok(Self {
            http_bind,
            repurpose_db_dsn,
            object_storage_base_url,
            transcription_base_url,
            llm_base_url,
            embedder_base_url,
            vector_search_base_url,
            http_client_timeout,
            llm_model,
            llm_max_tokens,
            llm_timeout,
            generation_platform_timeout,
            generation_request_deadline,
            generation_max_concurrency,
            transcription_max_retries,
            transcription_backoff_base_ms,
            transcription_poll_interval,
            transcription_poll_timeout,
            analysis_max_retries,
            analysis_min_words,
            style_cache_ttl,
            style_cache_capacity,
            processing_worker_concurrency,
            processing_worker_poll_interval,
            otel_exporter_endpoint,
            otel_sampling_ratio,
            repurpose_db_max_connections,
            repurpose_db_min_connections,
            repurpose_db_acquire_timeout,
            repurpose_db_idle_timeout,
            repurpose_db_max_lifetime,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn repurpose_db_dsn(&self) -> &str {
        &self.repurpose_db_dsn
    }

    #[must_use]
    pub fn object_storage_base_url(&self) -> &str {
        &self.object_storage_base_url
    }

    #[must_use]
    pub fn transcription_base_url(&self) -> &str {
        &self.transcription_base_url
    }

    #[must_use]
    pub fn llm_base_url(&self) -> &str {
        &self.llm_base_url
    }

    #[must_use]
    pub fn embedder_base_url(&self) -> &str {
        &self.embedder_base_url
    }

    #[must_use]
    pub fn vector_search_base_url(&self) -> &str {
        &self.vector_search_base_url
    }

    #[must_use]
    pub fn http_client_timeout(&self) -> Duration {
        self.http_client_timeout
    }

    #[must_use]
    pub fn llm_model(&self) -> &str {
        &self.llm_model
    }

    #[must_use]
    pub fn llm_max_tokens(&self) -> u32 {
        self.llm_max_tokens
    }

    #[must_use]
    pub fn llm_timeout(&self) -> Duration {
        self.llm_timeout
    }

    #[must_use]
    pub fn analysis_min_words(&self) -> usize {
        self.analysis_min_words
    }

    #[must_use]
    pub fn style_cache_ttl(&self) -> Duration {
        self.style_cache_ttl
    }

    #[must_use]
    pub fn style_cache_capacity(&self) -> NonZeroUsize {
        self.style_cache_capacity
    }

    #[must_use]
    pub fn processing_worker_concurrency(&self) -> NonZeroUsize {
        self.processing_worker_concurrency
    }

    #[must_use]
    pub fn processing_worker_poll_interval(&self) -> Duration {
        self.processing_worker_poll_interval
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }

    #[must_use]
    pub fn repurpose_db_max_connections(&self) -> u32 {
        self.repurpose_db_max_connections
    }

    #[must_use]
    pub fn repurpose_db_min_connections(&self) -> u32 {
        self.repurpose_db_min_connections
    }

    #[must_use]
    pub fn repurpose_db_acquire_timeout(&self) -> Duration {
        self.repurpose_db_acquire_timeout
    }

    #[must_use]
    pub fn repurpose_db_idle_timeout(&self) -> Duration {
        self.repurpose_db_idle_timeout
    }

    #[must_use]
    pub fn repurpose_db_max_lifetime(&self) -> Duration {
        self.repurpose_db_max_lifetime
    }

    /// 処理ステートマシンのリトライ予算とポーリング設定。
    #[must_use]
    pub fn processing_settings(&self) -> ProcessingSettings {
        ProcessingSettings {
            transcription_retry: RetryConfig::new(
                self.transcription_max_retries,
                self.transcription_backoff_base_ms,
                BACKOFF_CAP_MS,
            ),
            poll_interval: self.transcription_poll_interval,
            poll_timeout: self.transcription_poll_timeout,
            analysis_retry: RetryConfig::new(
                self.analysis_max_retries,
                self.transcription_backoff_base_ms,
                BACKOFF_CAP_MS,
            ),
        }
    }

    #[must_use]
    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            platform_timeout: self.generation_platform_timeout,
            request_deadline: self.generation_request_deadline,
            max_concurrency: self.generation_max_concurrency.get(),
            max_tokens: self.llm_max_tokens,
        }
    }

    #[must_use]
    pub fn tracing_settings(&self) -> TracingSettings {
        TracingSettings {
            otlp_endpoint: self.otel_exporter_endpoint.clone(),
            sampling_ratio: self.otel_sampling_ratio,
        }
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let parsed = parse_usize(name, default)?;
    NonZeroUsize::new(parsed).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_ms)?;
    Ok(Duration::from_millis(value))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let value = raw.parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("value must be between 0.0 and 1.0"),
        });
    }
    Ok(value)
}
