//! Processing state machine.
//!
//! Drives one content item from `uploaded` to `ready` or `failed`:
//!
//! ```text
//! uploaded ─(audio/video)→ transcribing ─→ analyzing ─→ ready
//!     └──────(text)────────────────────────↗
//! ```
//!
//! Every transition is a compare-and-set against the stored state, so a restarted worker
//! resumes from the last durable state. A lost race surfaces as `Conflict` and leaves the
//! item alone.

use std::sync::Arc;
use std::time::Duration;

use prometheus::Gauge;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clients::{ObjectStorage, Transcriber, TranscriptionPoll, TranscriptionStatus};
use crate::observability::metrics::Metrics;
use crate::pipeline::analysis::TopicExtractor;
use crate::store::dao::RepurposeDao;
use crate::store::models::{
    ContentItem, ContentUpdate, FailureRecord, FailureScope, ProcessingState, ProcessingStatus,
};
use crate::util::error::PipelineError;
use crate::util::idempotency::transcription_idempotency_key;
use crate::util::retry::{RetryConfig, retry_with_backoff};
use crate::util::time::Clock;

const TRANSCRIPTION_SERVICE: &str = "transcription";

/// Stage budgets and polling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingSettings {
    pub transcription_retry: RetryConfig,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub analysis_retry: RetryConfig,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            transcription_retry: RetryConfig::new(3, 1000, 30_000),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(900),
            analysis_retry: RetryConfig::new(2, 1000, 30_000),
        }
    }
}

/// トランスクリプトの格納先。
#[must_use]
pub fn transcript_locator(content_id: Uuid) -> String {
    format!("transcripts/{content_id}.txt")
}

struct ActiveGuard(Gauge);

impl ActiveGuard {
    fn new(gauge: &Gauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// 文字起こしジョブの進行状況。失敗したジョブの数で冪等キーを分ける。
#[derive(Debug, Default)]
struct TranscriptionProgress {
    job_id: Option<String>,
    failed_jobs: u32,
}

pub struct ProcessingStateMachine {
    dao: Arc<dyn RepurposeDao>,
    storage: Arc<dyn ObjectStorage>,
    transcriber: Arc<dyn Transcriber>,
    extractor: TopicExtractor,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    settings: ProcessingSettings,
}

impl ProcessingStateMachine {
    #[must_use]
    pub fn new(
        dao: Arc<dyn RepurposeDao>,
        storage: Arc<dyn ObjectStorage>,
        transcriber: Arc<dyn Transcriber>,
        extractor: TopicExtractor,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        settings: ProcessingSettings,
    ) -> Self {
        Self {
            dao,
            storage,
            transcriber,
            extractor,
            metrics,
            clock,
            settings,
        }
    }

    /// アイテムを終端状態まで進める。終端状態のアイテムはそのまま返す。
    ///
    /// # Errors
    /// ステージが予算を使い切って `failed` になった場合はそのステージのエラーを返す。
    /// ストアの失敗や競合ではアイテムを `failed` にしない。
    #[instrument(skip(self), fields(content_id = %content_id))]
    pub async fn process(&self, content_id: Uuid) -> Result<ProcessingStatus, PipelineError> {
        let mut item = self
            .dao
            .get_content(content_id)
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| PipelineError::not_found("content", content_id))?;

        if item.archived_at.is_some() {
            return Err(PipelineError::Validation(format!(
                "content {content_id} is archived"
            )));
        }
        if item.state.is_terminal() {
            return Ok(ProcessingStatus::from(&item));
        }

        let _active = ActiveGuard::new(&self.metrics.active_processing);

        loop {
            item = match item.state {
                ProcessingState::Uploaded => {
                    let next = if item.media_kind.needs_transcription() {
                        ProcessingState::Transcribing
                    } else {
                        ProcessingState::Analyzing
                    };
                    self.transition(&item, next, ContentUpdate::default()).await?
                }
                ProcessingState::Transcribing => {
                    let started = Instant::now();
                    let outcome = self.transcribe(&item).await;
                    self.metrics
                        .transcription_duration
                        .observe(started.elapsed().as_secs_f64());
                    self.settle(&item, FailureScope::Transcription, outcome).await?
                }
                ProcessingState::Analyzing => {
                    let started = Instant::now();
                    let outcome = self.analyze(&item).await;
                    self.metrics
                        .analysis_duration
                        .observe(started.elapsed().as_secs_f64());
                    self.settle(&item, FailureScope::Analysis, outcome).await?
                }
                ProcessingState::Ready | ProcessingState::Failed => {
                    return Ok(ProcessingStatus::from(&item));
                }
            };
        }
    }

    async fn transition(
        &self,
        item: &ContentItem,
        to: ProcessingState,
        update: ContentUpdate,
    ) -> Result<ContentItem, PipelineError> {
        let updated = self
            .dao
            .transition_content(item.id, item.state, to, &update, self.clock.now())
            .await
            .map_err(PipelineError::store)?
            .ok_or_else(|| {
                PipelineError::Conflict(format!("content {} is no longer {}", item.id, item.state))
            })?;

        info!(content_id = %item.id, from = %item.state, to = %to, "content state transition");
        Ok(updated)
    }

    /// ステージの結果を確定する。ストア障害と競合以外の失敗は記録して `failed` へ遷移させる。
    /// 失敗記録の書き込みに失敗してもログに残すだけで、元のエラーを返す。
    async fn settle(
        &self,
        item: &ContentItem,
        scope: FailureScope,
        outcome: Result<ContentItem, PipelineError>,
    ) -> Result<ContentItem, PipelineError> {
        let error = match outcome {
            Ok(next) => return Ok(next),
            Err(error @ (PipelineError::Store(_) | PipelineError::Conflict(_))) => return Err(error),
            Err(error) => error,
        };

        let record = FailureRecord {
            content_id: item.id,
            scope,
            kind: error.kind(),
            message: error.to_string(),
            occurred_at: self.clock.now(),
        };
        if let Err(store_error) = self.dao.record_failure(&record).await {
            error!(
                content_id = %item.id,
                stage = %scope.label(),
                error = ?store_error,
                "failed to record processing failure"
            );
        }

        let update = ContentUpdate {
            last_error: Some(error.to_string()),
            ..ContentUpdate::default()
        };
        self.transition(item, ProcessingState::Failed, update).await?;
        self.metrics.content_failed.inc();

        warn!(
            content_id = %item.id,
            stage = %scope.label(),
            kind = error.kind().as_str(),
            error = %error,
            "content processing failed"
        );
        Err(error)
    }

    async fn transcribe(&self, item: &ContentItem) -> Result<ContentItem, PipelineError> {
        let config = self.settings.transcription_retry;
        let mut progress = TranscriptionProgress {
            job_id: item.transcription_job_id.clone(),
            failed_jobs: item.failed_transcription_jobs,
        };
        let mut retries = 0;

        loop {
            let error = match self.transcription_attempt(item, &mut progress).await {
                Ok(next) => return Ok(next),
                Err(error) => error,
            };
            if !error.is_retryable() || !config.can_retry(retries) {
                return Err(error);
            }

            retries += 1;
            self.metrics.transcription_retries.inc();
            let backoff = config.delay_for_retry(retries);
            let delay = error
                .retry_after()
                .map_or(backoff, |hint| hint.max(backoff));
            warn!(
                content_id = %item.id,
                stage = "transcription",
                attempt = retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "transcription attempt failed, retrying"
            );
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    }

    /// ジョブを開始（または再開）し、完了までポーリングしてトランスクリプトを保存する。
    async fn transcription_attempt(
        &self,
        item: &ContentItem,
        progress: &mut TranscriptionProgress,
    ) -> Result<ContentItem, PipelineError> {
        let job_id = if let Some(job_id) = &progress.job_id {
            debug!(content_id = %item.id, job_id = %job_id, "resuming transcription job");
            job_id.clone()
        } else {
            let key = transcription_idempotency_key(item.id, progress.failed_jobs);
            let job_id = self
                .transcriber
                .start(&item.storage_locator, &item.media_format, &key)
                .await?;
            self.record_job(item.id, Some(&job_id), progress.failed_jobs)
                .await?;
            info!(content_id = %item.id, job_id = %job_id, "transcription job started");
            progress.job_id = Some(job_id.clone());
            job_id
        };

        let poll = self.poll_until_done(&job_id).await?;
        if poll.status == TranscriptionStatus::Failed {
            let failed_jobs = progress.failed_jobs.saturating_add(1);
            self.record_job(item.id, None, failed_jobs).await?;
            progress.job_id = None;
            progress.failed_jobs = failed_jobs;
            return Err(PipelineError::transient(
                TRANSCRIPTION_SERVICE,
                poll.error
                    .unwrap_or_else(|| format!("job {job_id} failed")),
            ));
        }

        let transcript = poll
            .transcript
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                PipelineError::transient(
                    TRANSCRIPTION_SERVICE,
                    format!("job {job_id} completed without a transcript"),
                )
            })?;

        let locator = transcript_locator(item.id);
        self.storage
            .put(&locator, transcript.as_bytes().to_vec())
            .await?;

        let update = ContentUpdate {
            transcript_locator: Some(locator),
            duration_secs: poll.duration_secs(),
            ..ContentUpdate::default()
        };
        self.transition(item, ProcessingState::Analyzing, update).await
    }

    async fn record_job(
        &self,
        content_id: Uuid,
        job_id: Option<&str>,
        failed_jobs: u32,
    ) -> Result<(), PipelineError> {
        let written = self
            .dao
            .set_transcription_job(content_id, job_id, failed_jobs, self.clock.now())
            .await
            .map_err(PipelineError::store)?;
        if written {
            Ok(())
        } else {
            Err(PipelineError::Conflict(format!(
                "content {content_id} left transcribing while recording its job"
            )))
        }
    }

    async fn poll_until_done(&self, job_id: &str) -> Result<TranscriptionPoll, PipelineError> {
        let deadline = Instant::now() + self.settings.poll_timeout;

        loop {
            let poll = self.transcriber.poll(job_id).await?;
            match poll.status {
                TranscriptionStatus::Completed | TranscriptionStatus::Failed => return Ok(poll),
                TranscriptionStatus::Queued | TranscriptionStatus::InProgress => {}
            }

            if Instant::now() + self.settings.poll_interval > deadline {
                return Err(PipelineError::Timeout {
                    scope: format!("transcription job {job_id}"),
                    after: self.settings.poll_timeout,
                });
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    async fn analyze(&self, item: &ContentItem) -> Result<ContentItem, PipelineError> {
        let locator = item.source_text_locator();
        let topics = retry_with_backoff(
            &self.settings.analysis_retry,
            "analysis",
            |attempt| self.extract_topics(locator, attempt),
            |_, _| self.metrics.analysis_retries.inc(),
        )
        .await?;

        let update = ContentUpdate {
            topics: Some(topics),
            ..ContentUpdate::default()
        };
        let ready = self.transition(item, ProcessingState::Ready, update).await?;
        self.metrics.content_processed.inc();
        Ok(ready)
    }

    async fn extract_topics(&self, locator: &str, attempt: usize) -> Result<Vec<String>, PipelineError> {
        let bytes = self.storage.get(locator).await?;
        let text = String::from_utf8(bytes).map_err(|_| {
            PipelineError::Validation(format!("source text at {locator} is not valid UTF-8"))
        })?;
        self.extractor.extract(&text, attempt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{
        CompletionRequest, LanguageModel, MemoryObjectStorage, TranscriptSegment,
    };
    use crate::store::dao::{ContentDao, FailureDao, GenerationDao, InMemoryDao, StyleDao};
    use crate::store::models::{
        GeneratedContent, GenerationStatus, MediaKind, NewContentItem, NewGeneratedContent,
        Platform, StyleExemplar,
    };
    use crate::util::error::ErrorKind;
    use crate::util::time::SystemClock;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use prometheus::Registry;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPICS: &str = r#"{"topics": ["repurposing", "podcasts", "voice", "workflow", "audience"]}"#;

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    struct TopicModel {
        bad_responses: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for TopicModel {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.bad_responses) {
                return Ok(r#"{"topics": ["only", "two"]}"#.to_string());
            }
            Ok(TOPICS.to_string())
        }
    }

    /// 失敗記録の書き込みだけを拒否するストア。それ以外はインメモリ実装に委譲する。
    #[derive(Default)]
    struct FailureLogDown {
        inner: InMemoryDao,
    }

    #[async_trait]
    impl ContentDao for FailureLogDown {
        async fn insert_content(&self, item: &ContentItem) -> anyhow::Result<()> {
            self.inner.insert_content(item).await
        }

        async fn get_content(&self, id: Uuid) -> anyhow::Result<Option<ContentItem>> {
            self.inner.get_content(id).await
        }

        async fn transition_content(
            &self,
            id: Uuid,
            from: ProcessingState,
            to: ProcessingState,
            update: &ContentUpdate,
            now: DateTime<Utc>,
        ) -> anyhow::Result<Option<ContentItem>> {
            self.inner.transition_content(id, from, to, update, now).await
        }

        async fn set_transcription_job(
            &self,
            id: Uuid,
            job_id: Option<&str>,
            failed_jobs: u32,
            now: DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            self.inner
                .set_transcription_job(id, job_id, failed_jobs, now)
                .await
        }

        async fn list_content_by_owner(&self, owner_id: Uuid) -> anyhow::Result<Vec<ContentItem>> {
            self.inner.list_content_by_owner(owner_id).await
        }

        async fn list_content_by_state(
            &self,
            states: &[ProcessingState],
            limit: usize,
        ) -> anyhow::Result<Vec<ContentItem>> {
            self.inner.list_content_by_state(states, limit).await
        }

        async fn archive_content(
            &self,
            id: Uuid,
            now: DateTime<Utc>,
        ) -> anyhow::Result<Option<ContentItem>> {
            self.inner.archive_content(id, now).await
        }
    }

    #[async_trait]
    impl StyleDao for FailureLogDown {
        async fn insert_exemplar(&self, exemplar: &StyleExemplar) -> anyhow::Result<()> {
            self.inner.insert_exemplar(exemplar).await
        }

        async fn list_exemplars(&self, owner_id: Uuid) -> anyhow::Result<Vec<StyleExemplar>> {
            self.inner.list_exemplars(owner_id).await
        }

        async fn mark_exemplar_embedded(&self, id: Uuid) -> anyhow::Result<Option<StyleExemplar>> {
            self.inner.mark_exemplar_embedded(id).await
        }
    }

    #[async_trait]
    impl GenerationDao for FailureLogDown {
        async fn insert_generation(
            &self,
            generation: NewGeneratedContent,
            now: DateTime<Utc>,
        ) -> anyhow::Result<GeneratedContent> {
            self.inner.insert_generation(generation, now).await
        }

        async fn get_generation(&self, id: Uuid) -> anyhow::Result<Option<GeneratedContent>> {
            self.inner.get_generation(id).await
        }

        async fn list_versions(
            &self,
            content_id: Uuid,
            platform: Platform,
        ) -> anyhow::Result<Vec<GeneratedContent>> {
            self.inner.list_versions(content_id, platform).await
        }

        async fn get_version(
            &self,
            content_id: Uuid,
            platform: Platform,
            version: u32,
        ) -> anyhow::Result<Option<GeneratedContent>> {
            self.inner.get_version(content_id, platform, version).await
        }

        async fn latest_version(
            &self,
            content_id: Uuid,
            platform: Platform,
        ) -> anyhow::Result<Option<GeneratedContent>> {
            self.inner.latest_version(content_id, platform).await
        }

        async fn update_generation_status(
            &self,
            id: Uuid,
            from: GenerationStatus,
            to: GenerationStatus,
        ) -> anyhow::Result<Option<GeneratedContent>> {
            self.inner.update_generation_status(id, from, to).await
        }
    }

    #[async_trait]
    impl FailureDao for FailureLogDown {
        async fn record_failure(&self, _failure: &FailureRecord) -> anyhow::Result<()> {
            anyhow::bail!("failure log unavailable")
        }

        async fn list_failures(&self, content_id: Uuid) -> anyhow::Result<Vec<FailureRecord>> {
            self.inner.list_failures(content_id).await
        }
    }

    #[derive(Default)]
    struct FakeTranscriber {
        start_failures: AtomicUsize,
        failed_jobs: AtomicUsize,
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn start(
            &self,
            _storage_locator: &str,
            _media_format: &str,
            idempotency_key: &str,
        ) -> Result<String, PipelineError> {
            if take_one(&self.start_failures) {
                return Err(PipelineError::transient("transcription", "unavailable"));
            }
            let mut keys = self.keys.lock().unwrap();
            keys.push(idempotency_key.to_string());
            Ok(format!("job-{}", keys.len()))
        }

        async fn poll(&self, _job_id: &str) -> Result<TranscriptionPoll, PipelineError> {
            if take_one(&self.failed_jobs) {
                return Ok(TranscriptionPoll {
                    status: TranscriptionStatus::Failed,
                    transcript: None,
                    timestamps: None,
                    error: Some("decoder crashed".to_string()),
                });
            }
            Ok(TranscriptionPoll {
                status: TranscriptionStatus::Completed,
                transcript: Some("spoken ".repeat(600)),
                timestamps: Some(vec![TranscriptSegment {
                    start_secs: 0.0,
                    end_secs: 754.5,
                    text: "spoken".to_string(),
                }]),
                error: None,
            })
        }
    }

    struct Harness {
        dao: Arc<InMemoryDao>,
        storage: Arc<MemoryObjectStorage>,
        transcriber: Arc<FakeTranscriber>,
        model: Arc<TopicModel>,
        metrics: Arc<Metrics>,
        machine: ProcessingStateMachine,
    }

    fn harness(transcriber: FakeTranscriber, bad_topic_responses: usize) -> Harness {
        let dao = Arc::new(InMemoryDao::new());
        let storage = Arc::new(MemoryObjectStorage::new());
        let transcriber = Arc::new(transcriber);
        let model = Arc::new(TopicModel {
            bad_responses: AtomicUsize::new(bad_topic_responses),
            calls: AtomicUsize::new(0),
        });
        let metrics = Arc::new(Metrics::new(Arc::new(Registry::new())).unwrap());
        let settings = ProcessingSettings {
            transcription_retry: RetryConfig::immediate(3),
            poll_interval: Duration::ZERO,
            poll_timeout: Duration::from_secs(5),
            analysis_retry: RetryConfig::immediate(2),
        };
        let machine = ProcessingStateMachine::new(
            dao.clone(),
            storage.clone(),
            transcriber.clone(),
            TopicExtractor::new(model.clone(), 256, 500),
            metrics.clone(),
            Arc::new(SystemClock),
            settings,
        );
        Harness {
            dao,
            storage,
            transcriber,
            model,
            metrics,
            machine,
        }
    }

    async fn upload(h: &Harness, kind: MediaKind, body: &str) -> ContentItem {
        let locator = format!("uploads/{}", Uuid::new_v4());
        h.storage
            .put(&locator, body.as_bytes().to_vec())
            .await
            .unwrap();
        let item = ContentItem::new(
            NewContentItem {
                owner_id: Uuid::new_v4(),
                storage_locator: locator,
                media_kind: kind,
                media_format: if kind == MediaKind::Text { "txt" } else { "mp3" }.to_string(),
                image_description: None,
            },
            chrono::Utc::now(),
        );
        h.dao.insert_content(&item).await.unwrap();
        item
    }

    #[tokio::test]
    async fn text_goes_straight_to_analysis() {
        let h = harness(FakeTranscriber::default(), 0);
        let item = upload(&h, MediaKind::Text, &"word ".repeat(550)).await;

        let status = h.machine.process(item.id).await.unwrap();

        assert_eq!(status.state, ProcessingState::Ready);
        assert_eq!(status.topics.map(|t| t.len()), Some(5));
        assert!(h.transcriber.keys.lock().unwrap().is_empty());
        assert_eq!(h.metrics.content_processed.get() as u64, 1);
    }

    #[tokio::test]
    async fn transcription_recovers_after_two_failures() {
        let h = harness(
            FakeTranscriber {
                start_failures: AtomicUsize::new(2),
                ..FakeTranscriber::default()
            },
            0,
        );
        let item = upload(&h, MediaKind::Audio, "binary").await;

        let status = h.machine.process(item.id).await.unwrap();
        assert_eq!(status.state, ProcessingState::Ready);

        let stored = h.dao.get_content(item.id).await.unwrap().unwrap();
        assert_eq!(stored.transcript_locator, Some(transcript_locator(item.id)));
        assert_eq!(stored.duration_secs, Some(754.5));
        assert!(h.storage.contains(&transcript_locator(item.id)).await);
        assert_eq!(h.metrics.transcription_retries.get() as u64, 2);
    }

    #[tokio::test]
    async fn exhausted_transcription_budget_fails_the_item() {
        let h = harness(
            FakeTranscriber {
                start_failures: AtomicUsize::new(4),
                ..FakeTranscriber::default()
            },
            0,
        );
        let item = upload(&h, MediaKind::Video, "binary").await;

        let error = h.machine.process(item.id).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::TransientService);

        let stored = h.dao.get_content(item.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ProcessingState::Failed);
        assert!(stored.last_error.is_some());

        let failures = h.dao.list_failures(item.id).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].scope, FailureScope::Transcription);
        assert_eq!(failures[0].kind, ErrorKind::TransientService);
    }

    #[tokio::test]
    async fn failed_job_is_replaced_with_a_new_key() {
        let h = harness(
            FakeTranscriber {
                failed_jobs: AtomicUsize::new(1),
                ..FakeTranscriber::default()
            },
            0,
        );
        let item = upload(&h, MediaKind::Audio, "binary").await;

        h.machine.process(item.id).await.unwrap();

        let stored = h.dao.get_content(item.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_transcription_jobs, 1);
        let keys = h.transcriber.keys.lock().unwrap().clone();
        assert_eq!(
            keys,
            vec![
                transcription_idempotency_key(item.id, 0),
                transcription_idempotency_key(item.id, 1),
            ]
        );
    }

    #[tokio::test]
    async fn restart_resumes_recorded_job_without_starting_another() {
        let h = harness(FakeTranscriber::default(), 0);
        let item = upload(&h, MediaKind::Audio, "binary").await;
        let now = chrono::Utc::now();
        h.dao
            .transition_content(
                item.id,
                ProcessingState::Uploaded,
                ProcessingState::Transcribing,
                &ContentUpdate::default(),
                now,
            )
            .await
            .unwrap();
        assert!(h.dao.set_transcription_job(item.id, Some("job-existing"), 0, now).await.unwrap());

        let status = h.machine.process(item.id).await.unwrap();

        assert_eq!(status.state, ProcessingState::Ready);
        assert!(h.transcriber.keys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn short_text_fails_without_calling_the_model() {
        let h = harness(FakeTranscriber::default(), 0);
        let item = upload(&h, MediaKind::Text, "far too short").await;

        let error = h.machine.process(item.id).await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InsufficientContent);
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
        let failures = h.dao.list_failures(item.id).await.unwrap();
        assert_eq!(failures[0].scope, FailureScope::Analysis);
    }

    #[tokio::test]
    async fn bad_topic_counts_consume_the_analysis_budget() {
        let h = harness(FakeTranscriber::default(), 2);
        let item = upload(&h, MediaKind::Text, &"word ".repeat(550)).await;
        assert_eq!(
            h.machine.process(item.id).await.unwrap().state,
            ProcessingState::Ready
        );
        assert_eq!(h.metrics.analysis_retries.get() as u64, 2);

        let h = harness(FakeTranscriber::default(), 3);
        let item = upload(&h, MediaKind::Text, &"word ".repeat(550)).await;
        assert!(h.machine.process(item.id).await.is_err());
        let stored = h.dao.get_content(item.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ProcessingState::Failed);
        assert_eq!(stored.topics, None);
    }

    #[tokio::test]
    async fn terminal_items_are_left_alone() {
        let h = harness(FakeTranscriber::default(), 0);
        let item = upload(&h, MediaKind::Text, &"word ".repeat(550)).await;
        h.machine.process(item.id).await.unwrap();

        let again = h.machine.process(item.id).await.unwrap();

        assert_eq!(again.state, ProcessingState::Ready);
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_after_a_failed_job_keeps_the_fresh_key() {
        let h = harness(FakeTranscriber::default(), 0);
        let item = upload(&h, MediaKind::Audio, "binary").await;
        let now = chrono::Utc::now();
        h.dao
            .transition_content(
                item.id,
                ProcessingState::Uploaded,
                ProcessingState::Transcribing,
                &ContentUpdate::default(),
                now,
            )
            .await
            .unwrap();
        assert!(h.dao.set_transcription_job(item.id, None, 1, now).await.unwrap());

        let status = h.machine.process(item.id).await.unwrap();

        assert_eq!(status.state, ProcessingState::Ready);
        assert_eq!(
            h.transcriber.keys.lock().unwrap().clone(),
            vec![transcription_idempotency_key(item.id, 1)]
        );
    }

    #[tokio::test]
    async fn unwritable_failure_log_still_fails_the_item_with_the_stage_error() {
        let dao = Arc::new(FailureLogDown::default());
        let storage = Arc::new(MemoryObjectStorage::new());
        let model = Arc::new(TopicModel {
            bad_responses: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let metrics = Arc::new(Metrics::new(Arc::new(Registry::new())).unwrap());
        let machine = ProcessingStateMachine::new(
            dao.clone(),
            storage.clone(),
            Arc::new(FakeTranscriber::default()),
            TopicExtractor::new(model, 256, 500),
            metrics.clone(),
            Arc::new(SystemClock),
            ProcessingSettings::default(),
        );

        storage
            .put("uploads/short.txt", b"far too short".to_vec())
            .await
            .unwrap();
        let item = ContentItem::new(
            NewContentItem {
                owner_id: Uuid::new_v4(),
                storage_locator: "uploads/short.txt".to_string(),
                media_kind: MediaKind::Text,
                media_format: "txt".to_string(),
                image_description: None,
            },
            chrono::Utc::now(),
        );
        dao.insert_content(&item).await.unwrap();

        let error = machine.process(item.id).await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InsufficientContent);
        let stored = dao.get_content(item.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ProcessingState::Failed);
        assert_eq!(metrics.content_failed.get() as u64, 1);
    }
}
