use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;

use crate::{
    api,
    clients::{EmbedderClient, HttpObjectStorage, LlmClient, TranscriptionClient, VectorSearchClient},
    config::Config,
    observability::Telemetry,
    service::{Collaborators, RepurposeService, ServiceSettings},
    store::dao::PgRepurposeDao,
    util::time::SystemClock,
    worker::ProcessingWorker,
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    service: Arc<RepurposeService>,
    llm_client: Arc<LlmClient>,
    repurpose_dao: Arc<PgRepurposeDao>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn llm_client(&self) -> Arc<LlmClient> {
        Arc::clone(&self.registry.llm_client)
    }

    pub(crate) fn dao(&self) -> Arc<PgRepurposeDao> {
        Arc::clone(&self.registry.repurpose_dao)
    }
}

impl ComponentRegistry {
    /// 構成情報と依存をまとめて初期化し、アプリケーションの共有レジストリを構築する。
    ///
    /// # Errors
    /// Telemetry の初期化や HTTP クライアント構築が失敗した場合はエラーを返す。
    pub fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new(&config.tracing_settings())?;

        let storage = Arc::new(HttpObjectStorage::new(
            config.object_storage_base_url(),
            config.http_client_timeout(),
        )?);
        let transcriber = Arc::new(TranscriptionClient::new(
            config.transcription_base_url(),
            config.http_client_timeout(),
        )?);
        let llm_client = Arc::new(LlmClient::new(
            config.llm_base_url(),
            config.llm_model(),
            config.llm_timeout(),
        )?);
        let embedder = Arc::new(EmbedderClient::new(
            config.embedder_base_url(),
            config.http_client_timeout(),
        )?);
        let vector_search = Arc::new(VectorSearchClient::new(
            config.vector_search_base_url(),
            config.http_client_timeout(),
        )?);

        let repurpose_pool = PgPoolOptions::new()
            .max_connections(config.repurpose_db_max_connections())
            .min_connections(config.repurpose_db_min_connections())
            .acquire_timeout(config.repurpose_db_acquire_timeout())
            .idle_timeout(Some(config.repurpose_db_idle_timeout()))
            .max_lifetime(Some(config.repurpose_db_max_lifetime()))
            .test_before_acquire(true)
            .connect_lazy(config.repurpose_db_dsn())
            .context("failed to configure repurpose_db connection pool")?;
        let repurpose_dao = Arc::new(PgRepurposeDao::new(repurpose_pool));

        let service = Arc::new(RepurposeService::new(
            Collaborators {
                dao: repurpose_dao.clone(),
                storage,
                transcriber,
                model: llm_client.clone(),
                embedder,
                vector_search,
            },
            ServiceSettings::from_config(&config),
            telemetry.metrics_arc(),
            Arc::new(SystemClock),
        ));

        Ok(Self {
            config,
            telemetry,
            service,
            llm_client,
            repurpose_dao,
        })
    }

    #[must_use]
    pub fn service(&self) -> Arc<RepurposeService> {
        Arc::clone(&self.service)
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// 設定に従ってバックグラウンドの処理ワーカーを組み立てる。
    #[must_use]
    pub fn processing_worker(&self) -> ProcessingWorker {
        ProcessingWorker::new(
            self.service(),
            self.config.processing_worker_concurrency().get(),
            self.config.processing_worker_poll_interval(),
        )
    }
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
