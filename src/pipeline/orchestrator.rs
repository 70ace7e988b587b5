//! Fan-out generation across platforms.
//!
//! One task per platform, each with its own timeout, all bounded by a shared semaphore
//! and an overall request deadline. A failing or slow platform never aborts its siblings.
//! Only validated output is persisted, after its task has finished.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::clients::{Embedder, LanguageModel, ObjectStorage};
use crate::observability::metrics::Metrics;
use crate::pipeline::platform::{GenerationInput, PlatformAgent};
use crate::pipeline::seo::SeoAnnotator;
use crate::pipeline::style::{StylePatterns, StyleRetriever};
use crate::store::dao::RepurposeDao;
use crate::store::models::{
    ContentItem, FailureRecord, FailureScope, GeneratedContent, NewGeneratedContent, Platform,
    ProcessingState, StyleProfile,
};
use crate::util::error::PipelineError;
use crate::util::partial_success::{GenerationOutcome, PlatformFailure};
use crate::util::text::{hash_text, truncate_chars};
use crate::util::time::Clock;

const EMBED_EXCERPT_CHARS: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSettings {
    pub platform_timeout: Duration,
    pub request_deadline: Duration,
    pub max_concurrency: usize,
    pub max_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            platform_timeout: Duration::from_secs(15),
            request_deadline: Duration::from_secs(45),
            max_concurrency: 4,
            max_tokens: 1024,
        }
    }
}

/// 1プラットフォーム分の生成要求。バージョン番号は永続化時に採番する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRequest {
    pub content_id: Uuid,
    pub owner_id: Uuid,
    pub platform: Platform,
    pub seed: u64,
}

/// 生成に使う元素材。リクエスト内の全タスクで共有する。
#[derive(Debug)]
struct SourceMaterial {
    text: String,
    topics: Vec<String>,
    image_description: Option<String>,
}

/// Writes, validates and annotates one piece. Shared by fan-out tasks and regeneration.
struct Producer {
    model: Arc<dyn LanguageModel>,
    seo: Arc<SeoAnnotator>,
    max_tokens: u32,
}

impl Producer {
    async fn write(
        &self,
        request: &GenerationRequest,
        material: &SourceMaterial,
        style: &StylePatterns,
    ) -> Result<String, PipelineError> {
        let input = GenerationInput {
            topics: &material.topics,
            style,
            source_text: &material.text,
        };
        PlatformAgent::for_platform(request.platform)
            .generate(self.model.as_ref(), &input, request.seed, self.max_tokens)
            .await
    }

    async fn finish(
        &self,
        request: &GenerationRequest,
        material: &SourceMaterial,
        style: &StylePatterns,
        text: String,
    ) -> NewGeneratedContent {
        let seo = self
            .seo
            .annotate(
                request.platform,
                &text,
                &material.topics,
                material.image_description.as_deref(),
                request.seed,
            )
            .await;

        NewGeneratedContent {
            content_id: request.content_id,
            owner_id: request.owner_id,
            platform: request.platform,
            text,
            seo,
            seed: request.seed,
            style_snapshot: style.clone(),
        }
    }

    async fn produce(
        &self,
        request: &GenerationRequest,
        material: &SourceMaterial,
        style: &StylePatterns,
    ) -> Result<NewGeneratedContent, PipelineError> {
        let text = self.write(request, material, style).await?;
        Ok(self.finish(request, material, style, text).await)
    }
}

pub struct GenerationOrchestrator {
    dao: Arc<dyn RepurposeDao>,
    storage: Arc<dyn ObjectStorage>,
    embedder: Arc<dyn Embedder>,
    retriever: Arc<StyleRetriever>,
    producer: Arc<Producer>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
    settings: GenerationSettings,
}

impl GenerationOrchestrator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        dao: Arc<dyn RepurposeDao>,
        storage: Arc<dyn ObjectStorage>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
        retriever: Arc<StyleRetriever>,
        seo: Arc<SeoAnnotator>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            dao,
            storage,
            embedder,
            retriever,
            producer: Arc::new(Producer {
                model,
                seo,
                max_tokens: settings.max_tokens,
            }),
            metrics,
            clock,
            semaphore: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            settings,
        }
    }

    /// 要求されたプラットフォームごとに生成し、成功分のみ保存する。
    ///
    /// # Errors
    /// リクエスト自体が不正な場合（空のプラットフォーム集合、存在しない・未準備のコンテンツ、
    /// スタイルプロファイル未準備）や、スタイル取得までの共通処理が失敗した場合。
    /// プラットフォーム単位の失敗は `GenerationOutcome` に含まれる。
    #[instrument(skip(self, platforms), fields(platform_count = platforms.len()))]
    pub async fn generate(
        &self,
        user_id: Uuid,
        content_id: Uuid,
        platforms: &[Platform],
    ) -> Result<GenerationOutcome, PipelineError> {
        let platforms: BTreeSet<Platform> = platforms.iter().copied().collect();
        if platforms.is_empty() {
            return Err(PipelineError::Validation(
                "at least one platform is required".to_string(),
            ));
        }

        let started = Instant::now();
        let item = self.load_ready_content(user_id, content_id).await?;
        self.ensure_style_profile(user_id).await?;

        let material = Arc::new(self.load_material(&item).await?);
        let embedding = self
            .embedder
            .embed(&truncate_chars(&material.text, EMBED_EXCERPT_CHARS))
            .await?;
        let style = Arc::new(self.retriever.retrieve(user_id, &embedding).await?);

        let deadline = started + self.settings.request_deadline;
        let handles: Vec<_> = platforms
            .iter()
            .map(|&platform| {
                let request = GenerationRequest {
                    content_id,
                    owner_id: user_id,
                    platform,
                    seed: rand::random::<u64>(),
                };
                (platform, self.spawn_dispatch(request, &material, &style, deadline))
            })
            .collect();

        let (dispatched, handles): (Vec<Platform>, Vec<_>) = handles.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;

        let mut outcome = GenerationOutcome::new(content_id);
        for (platform, joined) in dispatched.into_iter().zip(joined) {
            let result = match joined {
                Ok(result) => result,
                Err(join_error) => Err(PipelineError::transient(
                    "generation",
                    format!("{platform} task aborted: {join_error}"),
                )),
            };

            let persisted = match result {
                Ok(new) => self
                    .dao
                    .insert_generation(new, self.clock.now())
                    .await
                    .map_err(PipelineError::store),
                Err(error) => Err(error),
            };

            match persisted {
                Ok(generated) => {
                    self.metrics.generations_succeeded.inc();
                    info!(
                        content_id = %content_id,
                        platform = %platform,
                        version = generated.version,
                        "generated content persisted"
                    );
                    outcome.record_success(generated);
                }
                Err(error) => {
                    self.note_failure(content_id, platform, &error).await;
                    outcome.record_failure(PlatformFailure::from_error(platform, &error));
                }
            }
        }

        self.metrics
            .generation_request_duration
            .observe(started.elapsed().as_secs_f64());
        info!(
            content_id = %content_id,
            succeeded = outcome.succeeded_platforms().len(),
            failed = outcome.failed_platforms().len(),
            "generation request finished"
        );
        Ok(outcome)
    }

    fn spawn_dispatch(
        &self,
        request: GenerationRequest,
        material: &Arc<SourceMaterial>,
        style: &Arc<StylePatterns>,
        deadline: Instant,
    ) -> tokio::task::JoinHandle<Result<NewGeneratedContent, PipelineError>> {
        let producer = Arc::clone(&self.producer);
        let material = Arc::clone(material);
        let style = Arc::clone(style);
        let semaphore = Arc::clone(&self.semaphore);
        let metrics = Arc::clone(&self.metrics);
        let platform_timeout = self.settings.platform_timeout;
        let request_deadline = self.settings.request_deadline;

        tokio::spawn(async move {
            let platform = request.platform;
            let work = async {
                let _permit = semaphore.acquire_owned().await.map_err(|_| {
                    PipelineError::transient("generation", "dispatch semaphore closed")
                })?;
                let started = Instant::now();
                let result = within_platform_budget(
                    platform,
                    platform_timeout,
                    producer.produce(&request, &material, &style),
                )
                .await;
                metrics
                    .platform_generation_duration
                    .observe(started.elapsed().as_secs_f64());
                result
            };

            timeout_at(deadline, work).await.unwrap_or_else(|_| {
                Err(PipelineError::Timeout {
                    scope: "generation request".to_string(),
                    after: request_deadline,
                })
            })
        })
    }

    /// 最新バージョンのスタイルスナップショットを使って次のバージョンを生成する。
    ///
    /// 明示的なシードがない場合、既存バージョンと同一の本文になったら一度だけ別のシードで引き直す。
    ///
    /// # Errors
    /// コンテンツや既存バージョンがない場合、または生成・保存に失敗した場合。
    #[instrument(skip(self, platform), fields(platform = %platform))]
    pub async fn regenerate(
        &self,
        user_id: Uuid,
        content_id: Uuid,
        platform: Platform,
        seed: Option<u64>,
    ) -> Result<GeneratedContent, PipelineError> {
        let item = self.load_ready_content(user_id, content_id).await?;
        let latest = self
            .dao
            .latest_version(content_id, platform)
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| PipelineError::not_found("generation", format!("{content_id}/{platform}")))?;

        let material = self.load_material(&item).await?;
        let style = latest.style_snapshot;
        let mut request = GenerationRequest {
            content_id,
            owner_id: user_id,
            platform,
            seed: seed.unwrap_or_else(rand::random::<u64>),
        };

        let production = async {
            let mut text = self.producer.write(&request, &material, &style).await?;
            if seed.is_none() && self.duplicates_existing(content_id, platform, &text).await? {
                request.seed = rand::random::<u64>();
                info!(content_id = %content_id, "regenerated text matched an existing version, re-rolling seed");
                text = self.producer.write(&request, &material, &style).await?;
            }
            Ok(self.producer.finish(&request, &material, &style, text).await)
        };

        let result = async {
            let new =
                within_platform_budget(platform, self.settings.platform_timeout, production).await?;
            self.dao
                .insert_generation(new, self.clock.now())
                .await
                .map_err(PipelineError::store)
        }
        .await;

        match result {
            Ok(generated) => {
                self.metrics.regenerations.inc();
                info!(
                    content_id = %content_id,
                    version = generated.version,
                    seed = generated.seed,
                    "regenerated content persisted"
                );
                Ok(generated)
            }
            Err(error) => {
                self.note_failure(content_id, platform, &error).await;
                Err(error)
            }
        }
    }

    async fn duplicates_existing(
        &self,
        content_id: Uuid,
        platform: Platform,
        text: &str,
    ) -> Result<bool, PipelineError> {
        let digest = hash_text(text);
        let versions = self
            .dao
            .list_versions(content_id, platform)
            .await
            .map_err(PipelineError::store)?;
        Ok(versions
            .iter()
            .any(|version| hash_text(&version.text) == digest && version.text == text))
    }

    async fn load_ready_content(
        &self,
        user_id: Uuid,
        content_id: Uuid,
    ) -> Result<ContentItem, PipelineError> {
        let item = self
            .dao
            .get_content(content_id)
            .await
            .map_err(PipelineError::store)?
            .filter(|item| item.owner_id == user_id)
            .ok_or_else(|| PipelineError::not_found("content", content_id))?;

        if item.archived_at.is_some() {
            return Err(PipelineError::Validation(format!(
                "content {content_id} is archived"
            )));
        }
        if item.state != ProcessingState::Ready {
            return Err(PipelineError::Validation(format!(
                "content {content_id} is {}, not ready",
                item.state
            )));
        }
        Ok(item)
    }

    async fn ensure_style_profile(&self, user_id: Uuid) -> Result<(), PipelineError> {
        let exemplars = self
            .dao
            .list_exemplars(user_id)
            .await
            .map_err(PipelineError::store)?;
        let profile = StyleProfile::from_exemplars(user_id, &exemplars);
        if !profile.ready {
            return Err(PipelineError::NoStyleProfile {
                user_id,
                exemplar_count: profile.exemplar_count,
            });
        }
        Ok(())
    }

    async fn load_material(&self, item: &ContentItem) -> Result<SourceMaterial, PipelineError> {
        let locator = item.source_text_locator();
        let bytes = self.storage.get(locator).await?;
        let text = String::from_utf8(bytes).map_err(|_| {
            PipelineError::Validation(format!("source text at {locator} is not valid UTF-8"))
        })?;

        Ok(SourceMaterial {
            text,
            topics: item.topics.clone().unwrap_or_default(),
            image_description: item.image_description.clone(),
        })
    }

    /// 失敗を記録する。記録自体が失敗しても他のプラットフォームの結果は返す。
    async fn note_failure(&self, content_id: Uuid, platform: Platform, failure: &PipelineError) {
        self.metrics.generations_failed.inc();
        if matches!(failure, PipelineError::Timeout { .. }) {
            self.metrics.generation_timeouts.inc();
        }
        warn!(
            content_id = %content_id,
            platform = %platform,
            kind = failure.kind().as_str(),
            error = %failure,
            "platform generation failed"
        );

        let record = FailureRecord {
            content_id,
            scope: FailureScope::Generation(platform),
            kind: failure.kind(),
            message: failure.to_string(),
            occurred_at: self.clock.now(),
        };
        if let Err(store_error) = self.dao.record_failure(&record).await {
            error!(
                content_id = %content_id,
                platform = %platform,
                error = ?store_error,
                "failed to record generation failure"
            );
        }
    }
}

/// 1プラットフォーム分の生成（本文・再抽選・SEO）を `limit` 以内に収める。
async fn within_platform_budget<T>(
    platform: Platform,
    limit: Duration,
    work: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    timeout(limit, work).await.unwrap_or_else(|_| {
        Err(PipelineError::Timeout {
            scope: FailureScope::Generation(platform).label(),
            after: limit,
        })
    })
}
