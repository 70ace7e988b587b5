//! Caller-facing operations over the repurposing pipeline.
//!
//! `RepurposeService` wires the processing state machine, the style retriever and the
//! generation orchestrator onto one set of collaborators and exposes the operations
//! the surrounding platform calls.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::clients::{
    Embedder, ExemplarMetadata, LanguageModel, ObjectStorage, Transcriber, VectorSearch,
};
use crate::config::Config;
use crate::observability::metrics::Metrics;
use crate::pipeline::analysis::TopicExtractor;
use crate::pipeline::orchestrator::{GenerationOrchestrator, GenerationSettings};
use crate::pipeline::processing::{ProcessingSettings, ProcessingStateMachine};
use crate::pipeline::seo::SeoAnnotator;
use crate::pipeline::style::{ExemplarCharacteristics, StyleCache, StyleRetriever};
use crate::pipeline::validate::{ConstraintValidator, ValidationResult};
use crate::store::dao::RepurposeDao;
use crate::store::models::{
    ContentItem, EmbeddingStatus, FailureRecord, GeneratedContent, GenerationStatus,
    NewContentItem, Platform, ProcessingStatus, StyleExemplar, StyleProfile,
};
use crate::util::error::PipelineError;
use crate::util::partial_success::GenerationOutcome;
use crate::util::time::Clock;

const DEFAULT_STYLE_CACHE_CAPACITY: usize = 1024;

/// サービスが利用する外部コラボレーター一式。
#[derive(Clone)]
pub struct Collaborators {
    pub dao: Arc<dyn RepurposeDao>,
    pub storage: Arc<dyn ObjectStorage>,
    pub transcriber: Arc<dyn Transcriber>,
    pub model: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub vector_search: Arc<dyn VectorSearch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    pub processing: ProcessingSettings,
    pub generation: GenerationSettings,
    pub analysis_min_words: usize,
    pub style_cache_capacity: NonZeroUsize,
    pub style_cache_ttl: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            processing: ProcessingSettings::default(),
            generation: GenerationSettings::default(),
            analysis_min_words: 500,
            style_cache_capacity: NonZeroUsize::new(DEFAULT_STYLE_CACHE_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            style_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl ServiceSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            processing: config.processing_settings(),
            generation: config.generation_settings(),
            analysis_min_words: config.analysis_min_words(),
            style_cache_capacity: config.style_cache_capacity(),
            style_cache_ttl: config.style_cache_ttl(),
        }
    }
}

pub struct RepurposeService {
    dao: Arc<dyn RepurposeDao>,
    embedder: Arc<dyn Embedder>,
    vector_search: Arc<dyn VectorSearch>,
    retriever: Arc<StyleRetriever>,
    processor: ProcessingStateMachine,
    orchestrator: GenerationOrchestrator,
    clock: Arc<dyn Clock>,
}

impl RepurposeService {
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        settings: ServiceSettings,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let Collaborators {
            dao,
            storage,
            transcriber,
            model,
            embedder,
            vector_search,
        } = collaborators;

        let retriever = Arc::new(StyleRetriever::new(
            Arc::clone(&vector_search),
            StyleCache::new(
                settings.style_cache_capacity,
                settings.style_cache_ttl,
                Arc::clone(&clock),
            ),
            Arc::clone(&metrics),
        ));
        let extractor = TopicExtractor::new(
            Arc::clone(&model),
            settings.generation.max_tokens,
            settings.analysis_min_words,
        );
        let processor = ProcessingStateMachine::new(
            Arc::clone(&dao),
            Arc::clone(&storage),
            transcriber,
            extractor,
            Arc::clone(&metrics),
            Arc::clone(&clock),
            settings.processing,
        );
        let seo = Arc::new(SeoAnnotator::new(
            Arc::clone(&model),
            settings.generation.max_tokens,
        ));
        let orchestrator = GenerationOrchestrator::new(
            Arc::clone(&dao),
            storage,
            Arc::clone(&embedder),
            model,
            Arc::clone(&retriever),
            seo,
            metrics,
            Arc::clone(&clock),
            settings.generation,
        );

        Self {
            dao,
            embedder,
            vector_search,
            retriever,
            processor,
            orchestrator,
            clock,
        }
    }

    /// アップロード済みのメディアを `uploaded` 状態のコンテンツとして登録する。
    ///
    /// # Errors
    /// ロケータやフォーマットが空の場合は `Validation`、保存に失敗した場合は `Store`。
    pub async fn register_content(&self, new: NewContentItem) -> Result<ContentItem, PipelineError> {
        if new.storage_locator.trim().is_empty() {
            return Err(PipelineError::Validation(
                "storage locator must not be empty".to_string(),
            ));
        }
        if new.media_format.trim().is_empty() {
            return Err(PipelineError::Validation(
                "media format must not be empty".to_string(),
            ));
        }

        let item = ContentItem::new(new, self.clock.now());
        self.dao
            .insert_content(&item)
            .await
            .map_err(PipelineError::store)?;
        info!(
            content_id = %item.id,
            owner_id = %item.owner_id,
            media_kind = item.media_kind.as_str(),
            "content registered"
        );
        Ok(item)
    }

    /// Drive the item to `ready` or `failed`. Terminal items are returned unchanged.
    ///
    /// # Errors
    /// The failing stage's error once its retry budget is exhausted, `NotFound` for an
    /// unknown item, or a store error/conflict (which leaves the item resumable).
    pub async fn process_content(&self, content_id: Uuid) -> Result<ProcessingStatus, PipelineError> {
        self.processor.process(content_id).await
    }

    /// # Errors
    /// コンテンツが存在しない場合は `NotFound`。
    pub async fn get_processing_status(
        &self,
        content_id: Uuid,
    ) -> Result<ProcessingStatus, PipelineError> {
        let item = self
            .dao
            .get_content(content_id)
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| PipelineError::not_found("content", content_id))?;
        Ok(ProcessingStatus::from(&item))
    }

    /// # Errors
    /// See [`GenerationOrchestrator::generate`]. Per-platform failures are part of the outcome.
    pub async fn generate_for_platforms(
        &self,
        user_id: Uuid,
        content_id: Uuid,
        platforms: &[Platform],
    ) -> Result<GenerationOutcome, PipelineError> {
        self.orchestrator
            .generate(user_id, content_id, platforms)
            .await
    }

    /// # Errors
    /// See [`GenerationOrchestrator::regenerate`].
    pub async fn regenerate(
        &self,
        user_id: Uuid,
        content_id: Uuid,
        platform: Platform,
        seed: Option<u64>,
    ) -> Result<GeneratedContent, PipelineError> {
        self.orchestrator
            .regenerate(user_id, content_id, platform, seed)
            .await
    }

    /// # Errors
    /// ストアの読み出しに失敗した場合。
    pub async fn get_style_profile(&self, user_id: Uuid) -> Result<StyleProfile, PipelineError> {
        let exemplars = self
            .dao
            .list_exemplars(user_id)
            .await
            .map_err(PipelineError::store)?;
        Ok(StyleProfile::from_exemplars(user_id, &exemplars))
    }

    /// エグザンプラを解析・埋め込みしてベクトル索引とストアに登録する。
    ///
    /// 埋め込みか索引登録に失敗した場合も `failed` 状態で保存し（プロファイルは未準備のまま）、
    /// エラーを返す。同じ本文を再登録すると、`failed` のレコードをその場で埋め込み直す。
    /// 埋め込み済みの本文の再登録は既存のレコードを返す。
    ///
    /// # Errors
    /// 空のテキストは `Validation`。埋め込み・索引登録・保存の失敗はそのまま返す。
    #[instrument(skip(self, text), fields(user_id = %user_id))]
    pub async fn add_style_exemplar(
        &self,
        user_id: Uuid,
        text: &str,
    ) -> Result<StyleExemplar, PipelineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::Validation(
                "exemplar text must not be empty".to_string(),
            ));
        }

        let existing = self
            .dao
            .list_exemplars(user_id)
            .await
            .map_err(PipelineError::store)?
            .into_iter()
            .find(|exemplar| exemplar.text == text);
        if let Some(exemplar) = existing {
            return match exemplar.embedding_status {
                EmbeddingStatus::Embedded => Ok(exemplar),
                EmbeddingStatus::Failed => self.reindex_exemplar(exemplar).await,
            };
        }

        let mut exemplar = StyleExemplar {
            id: Uuid::new_v4(),
            owner_id: user_id,
            text: text.to_string(),
            embedding_status: EmbeddingStatus::Embedded,
            characteristics: ExemplarCharacteristics::analyze(text),
            created_at: self.clock.now(),
        };

        let indexed = self.index_exemplar(&exemplar).await;
        if indexed.is_err() {
            exemplar.embedding_status = EmbeddingStatus::Failed;
        }

        self.dao
            .insert_exemplar(&exemplar)
            .await
            .map_err(PipelineError::store)?;
        self.retriever.invalidate_user(user_id).await;

        match indexed {
            Ok(()) => {
                info!(exemplar_id = %exemplar.id, "style exemplar added");
                Ok(exemplar)
            }
            Err(error) => {
                warn!(
                    exemplar_id = %exemplar.id,
                    kind = error.kind().as_str(),
                    error = %error,
                    "style exemplar stored without embedding"
                );
                Err(error)
            }
        }
    }

    async fn reindex_exemplar(
        &self,
        exemplar: StyleExemplar,
    ) -> Result<StyleExemplar, PipelineError> {
        self.index_exemplar(&exemplar).await.inspect_err(|error| {
            warn!(
                exemplar_id = %exemplar.id,
                kind = error.kind().as_str(),
                error = %error,
                "style exemplar embedding retry failed"
            );
        })?;

        let embedded = self
            .dao
            .mark_exemplar_embedded(exemplar.id)
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| {
                PipelineError::Conflict(format!("exemplar {} is no longer failed", exemplar.id))
            })?;
        self.retriever.invalidate_user(exemplar.owner_id).await;
        info!(exemplar_id = %embedded.id, "style exemplar embedding recovered");
        Ok(embedded)
    }

    async fn index_exemplar(&self, exemplar: &StyleExemplar) -> Result<(), PipelineError> {
        let vector = self.embedder.embed(&exemplar.text).await?;
        self.vector_search
            .upsert(
                exemplar.owner_id,
                vector,
                ExemplarMetadata {
                    exemplar_id: exemplar.id,
                    text: exemplar.text.clone(),
                    characteristics: exemplar.characteristics,
                },
            )
            .await
    }

    /// バージョン昇順の一覧。
    ///
    /// # Errors
    /// ストアの読み出しに失敗した場合。
    pub async fn list_versions(
        &self,
        content_id: Uuid,
        platform: Platform,
    ) -> Result<Vec<GeneratedContent>, PipelineError> {
        self.dao
            .list_versions(content_id, platform)
            .await
            .map_err(PipelineError::store)
    }

    /// # Errors
    /// 該当バージョンがなければ `NotFound`。
    pub async fn get_version(
        &self,
        content_id: Uuid,
        platform: Platform,
        version: u32,
    ) -> Result<GeneratedContent, PipelineError> {
        self.dao
            .get_version(content_id, platform, version)
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| {
                PipelineError::not_found("generation", format!("{content_id}/{platform}/v{version}"))
            })
    }

    /// Move a generated version one step along `draft → approved → scheduled → published`.
    ///
    /// # Errors
    /// `Validation` for a non-adjacent or backward move, `NotFound` for an unknown
    /// generation, `Conflict` when another writer moved the status first.
    pub async fn advance_status(
        &self,
        generation_id: Uuid,
        next: GenerationStatus,
    ) -> Result<GeneratedContent, PipelineError> {
        let current = self
            .dao
            .get_generation(generation_id)
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| PipelineError::not_found("generation", generation_id))?;

        if !current.status.can_advance_to(next) {
            return Err(PipelineError::Validation(format!(
                "cannot move generation {generation_id} from {} to {}",
                current.status.as_str(),
                next.as_str()
            )));
        }

        let updated = self
            .dao
            .update_generation_status(generation_id, current.status, next)
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| {
                PipelineError::Conflict(format!(
                    "generation {generation_id} is no longer {}",
                    current.status.as_str()
                ))
            })?;

        info!(
            generation_id = %generation_id,
            from = current.status.as_str(),
            to = next.as_str(),
            "generation status advanced"
        );
        Ok(updated)
    }

    /// 手動編集の検証。警告は公開を妨げない。
    #[must_use]
    pub fn review_edit(&self, platform: Platform, text: &str) -> ValidationResult {
        let result = ConstraintValidator::validate(platform, text);
        if !result.is_valid() {
            info!(
                platform = %platform,
                errors = result.errors.len(),
                warnings = result.warnings.len(),
                "manual edit violates platform constraints"
            );
        }
        result
    }

    /// # Errors
    /// 所有者でない、または存在しない場合は `NotFound`。
    pub async fn archive_content(
        &self,
        user_id: Uuid,
        content_id: Uuid,
    ) -> Result<ContentItem, PipelineError> {
        let owned = self
            .dao
            .get_content(content_id)
            .await
            .map_err(PipelineError::store)?
            .is_some_and(|item| item.owner_id == user_id);
        if !owned {
            return Err(PipelineError::not_found("content", content_id));
        }

        let archived = self
            .dao
            .archive_content(content_id, self.clock.now())
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| PipelineError::not_found("content", content_id))?;
        info!(content_id = %content_id, "content archived");
        Ok(archived)
    }

    /// # Errors
    /// ストアの読み出しに失敗した場合。
    pub async fn list_failures(&self, content_id: Uuid) -> Result<Vec<FailureRecord>, PipelineError> {
        self.dao
            .list_failures(content_id)
            .await
            .map_err(PipelineError::store)
    }

    pub(crate) fn dao(&self) -> Arc<dyn RepurposeDao> {
        Arc::clone(&self.dao)
    }
}
