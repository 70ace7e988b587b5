//! 統合テスト用のインメモリ・コラボレーターとハーネス。
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use repurpose_worker::clients::{
    CompletionRequest, Embedder, LanguageModel, MemoryObjectStorage, MemoryVectorSearch,
    ObjectStorage, TranscriptSegment, Transcriber, TranscriptionPoll, TranscriptionStatus,
};
use repurpose_worker::observability::Telemetry;
use repurpose_worker::pipeline::{GenerationSettings, ProcessingSettings};
use repurpose_worker::service::{Collaborators, RepurposeService, ServiceSettings};
use repurpose_worker::store::dao::{ContentDao, InMemoryDao, StyleDao};
use repurpose_worker::store::models::{
    ContentItem, MediaKind, NewContentItem, Platform, StyleExemplar,
};
use repurpose_worker::util::error::PipelineError;
use repurpose_worker::util::retry::RetryConfig;
use repurpose_worker::util::time::SystemClock;

pub const EXEMPLARS: [&str; 3] = [
    "I recorded a long interview last week. The best part was the tangent about editing.",
    "Short posts work for me. One idea, one story, one question for you at the end.",
    "Consistency beats intensity. I publish a little every day and it adds up quickly.",
];

pub fn linkedin_post(seed: u64) -> String {
    let hook = if seed % 2 == 0 {
        "Most teams ship content once and forget it exists."
    } else {
        "Many teams ship content once and forget it exists."
    };
    let body: Vec<String> = (0..16)
        .map(|i| format!("Sentence number {i} explains how one long recording becomes many useful posts."))
        .collect();
    let middle = body.chunks(4).map(|c| c.join(" ")).collect::<Vec<_>>().join("\n\n");
    format!("{hook}\n\n{middle}\n\nHow are you reusing your best long-form work today?")
}

pub fn twitter_thread() -> String {
    [
        "1/ One podcast episode can feed a whole week of posts. Here is the workflow we use.",
        "2/ Start with the transcript. Pull out the five moments people replayed the most.",
        "3/ Turn each moment into a single idea. One idea per post keeps things readable.",
        "4/ Match the voice of your past posts so the audience recognises you instantly.",
        "5/ Schedule the pieces across platforms instead of dumping everything on one day.",
        "6/ Follow for more workflows like this and share it with a creator friend.",
    ]
    .join("\n\n")
}

pub fn instagram_caption() -> String {
    let opening = "Last spring we recorded a two hour conversation and almost let it disappear into the archive. 🎙️ It felt like too much work to cut it into pieces, and honestly we were tired.";
    let middle = "Then we tried something different. We pulled the transcript, picked the moments that made us laugh or think, and rewrote each one in our own voice. Every small piece found a new audience, and people kept asking where the full episode lived.";
    let closing = "Now every long recording becomes a month of posts without extra filming days. ✨ Save this if you have a backlog of recordings waiting for a second life, and tell us which one you would start with.";
    format!("{opening}\n\n{middle}\n\n{closing}")
}

pub fn youtube_script() -> String {
    [
        "[00:00-00:08] Your best ideas are buried in long videos. [VISUAL: creator scrolling a long timeline]",
        "[00:08-00:16] Pull the transcript and mark the moments that landed. [VISUAL: highlighted transcript lines]",
        "[00:16-00:24] Rewrite each moment in the voice your audience knows. [VISUAL: side by side drafts]",
        "[00:24-00:32] Cut one clip per idea and keep it under a minute. [VISUAL: editing timeline with short clips]",
        "[00:32-00:40] Post them across the week instead of all at once. [VISUAL: calendar filling up]",
        "[00:40-00:48] Follow for the full workflow. [VISUAL: creator pointing at subscribe button]",
    ]
    .join("\n")
}

const TITLES: &str = r#"{"titles": [
    {"approach": "curiosity", "title": "What happens when one episode becomes ten posts"},
    {"approach": "benefit", "title": "Save a week of writing with one recording"},
    {"approach": "listicle", "title": "5 steps to repurpose your podcast"},
    {"approach": "question", "title": "Are you wasting your best long-form content?"},
    {"approach": "statement", "title": "Repurposing is the cheapest growth channel"}
]}"#;

const TOPICS: &str = r#"{"topics": ["repurposing", "podcasts", "voice", "workflow", "audience", "scheduling"]}"#;

/// プロンプトの種類を見分けて固定の応答を返す言語モデル。
pub struct ScriptedModel {
    pub calls: AtomicUsize,
    /// このプラットフォームの生成だけ応答を止める
    pub stalled_platform: Option<Platform>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            stalled_platform: None,
        }
    }

    pub fn stalling(platform: Platform) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            stalled_platform: Some(platform),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = &request.prompt;

        if prompt.contains("list its key topics") {
            return Ok(TOPICS.to_string());
        }
        if prompt.contains("search-friendly titles") {
            return Ok(TITLES.to_string());
        }
        if let Some(stalled) = self.stalled_platform {
            if prompt.contains(&format!("ghostwriting {}", stalled.prompt_noun())) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }

        let seed = request.seed.unwrap_or_default();
        let writing =
            |platform: Platform| prompt.contains(&format!("ghostwriting {}", platform.prompt_noun()));
        let text = if writing(Platform::LinkedIn) {
            linkedin_post(seed)
        } else if writing(Platform::Twitter) {
            twitter_thread()
        } else if writing(Platform::Instagram) {
            instagram_caption()
        } else {
            youtube_script()
        };
        Ok(text)
    }
}

/// 最初の `failures` 回の開始要求を一時的な障害として失敗させる文字起こし。
pub struct FlakyTranscriber {
    pub failures: usize,
    pub starts: AtomicUsize,
    pub transcript_words: usize,
}

impl FlakyTranscriber {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            starts: AtomicUsize::new(0),
            transcript_words: 640,
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FlakyTranscriber {
    async fn start(
        &self,
        _storage_locator: &str,
        _media_format: &str,
        idempotency_key: &str,
    ) -> Result<String, PipelineError> {
        let start = self.starts.fetch_add(1, Ordering::SeqCst);
        if start < self.failures {
            return Err(PipelineError::transient("transcription", "backend overloaded"));
        }
        Ok(format!("job-{idempotency_key}"))
    }

    async fn poll(&self, _job_id: &str) -> Result<TranscriptionPoll, PipelineError> {
        Ok(TranscriptionPoll {
            status: TranscriptionStatus::Completed,
            transcript: Some("spoken ".repeat(self.transcript_words)),
            timestamps: Some(vec![
                TranscriptSegment {
                    start_secs: 0.0,
                    end_secs: 120.0,
                    text: "first half".to_string(),
                },
                TranscriptSegment {
                    start_secs: 120.0,
                    end_secs: 245.5,
                    text: "second half".to_string(),
                },
            ]),
            error: None,
        })
    }
}

/// 本文ごとに異なるベクトルを返す。最初の `failures` 回は一時的な障害として失敗する。
pub struct StubEmbedder {
    pub failures: AtomicUsize,
}

impl StubEmbedder {
    pub fn healthy() -> Self {
        Self::failing_first(0)
    }

    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PipelineError::transient("embedder", "embedding backend down"));
        }
        #[allow(clippy::cast_precision_loss)]
        let length = text.len() as f32;
        Ok(vec![1.0, length.sin(), length.cos()])
    }
}

pub struct Harness {
    pub service: Arc<RepurposeService>,
    pub dao: Arc<InMemoryDao>,
    pub storage: Arc<MemoryObjectStorage>,
    pub search: Arc<MemoryVectorSearch>,
    pub model: Arc<ScriptedModel>,
    pub transcriber: Arc<FlakyTranscriber>,
}

pub fn fast_settings() -> ServiceSettings {
    ServiceSettings {
        processing: ProcessingSettings {
            transcription_retry: RetryConfig::immediate(3),
            poll_interval: Duration::from_millis(1),
            poll_timeout: Duration::from_secs(5),
            analysis_retry: RetryConfig::immediate(2),
        },
        generation: GenerationSettings {
            platform_timeout: Duration::from_millis(300),
            request_deadline: Duration::from_secs(5),
            ..GenerationSettings::default()
        },
        ..ServiceSettings::default()
    }
}

pub fn harness(model: ScriptedModel, transcriber: FlakyTranscriber, embedder: StubEmbedder) -> Harness {
    let dao = Arc::new(InMemoryDao::new());
    let storage = Arc::new(MemoryObjectStorage::new());
    let search = Arc::new(MemoryVectorSearch::new());
    let model = Arc::new(model);
    let transcriber = Arc::new(transcriber);
    let telemetry = Telemetry::metrics_only().expect("metrics register");

    let service = Arc::new(RepurposeService::new(
        Collaborators {
            dao: dao.clone(),
            storage: storage.clone(),
            transcriber: transcriber.clone(),
            model: model.clone(),
            embedder: Arc::new(embedder),
            vector_search: search.clone(),
        },
        fast_settings(),
        telemetry.metrics_arc(),
        Arc::new(SystemClock),
    ));

    Harness {
        service,
        dao,
        storage,
        search,
        model,
        transcriber,
    }
}

pub fn default_harness() -> Harness {
    harness(
        ScriptedModel::new(),
        FlakyTranscriber::new(0),
        StubEmbedder::healthy(),
    )
}

impl Harness {
    pub async fn upload_text(&self, owner_id: Uuid, words: usize) -> ContentItem {
        let locator = format!("uploads/{}.txt", Uuid::new_v4());
        self.storage
            .put(&locator, "word ".repeat(words).into_bytes())
            .await
            .expect("upload stored");
        self.service
            .register_content(NewContentItem {
                owner_id,
                storage_locator: locator,
                media_kind: MediaKind::Text,
                media_format: "txt".to_string(),
                image_description: Some("A creator recording a podcast at a desk".to_string()),
            })
            .await
            .expect("content registered")
    }

    pub async fn upload_audio(&self, owner_id: Uuid) -> ContentItem {
        let locator = format!("uploads/{}.mp3", Uuid::new_v4());
        self.storage
            .put(&locator, vec![0_u8; 32])
            .await
            .expect("upload stored");
        self.service
            .register_content(NewContentItem {
                owner_id,
                storage_locator: locator,
                media_kind: MediaKind::Audio,
                media_format: "mp3".to_string(),
                image_description: None,
            })
            .await
            .expect("content registered")
    }

    pub async fn add_exemplars(&self, user_id: Uuid, count: usize) {
        for text in EXEMPLARS.iter().take(count) {
            self.service
                .add_style_exemplar(user_id, text)
                .await
                .expect("exemplar added");
        }
    }

    pub async fn dao_content(&self, id: Uuid) -> ContentItem {
        self.dao
            .get_content(id)
            .await
            .expect("store readable")
            .expect("content exists")
    }

    pub async fn dao_exemplars(&self, user_id: Uuid) -> Vec<StyleExemplar> {
        self.dao.list_exemplars(user_id).await.expect("store readable")
    }

    /// テキストをアップロードし、解析まで済ませた `ready` のアイテムを返す。
    pub async fn ready_content(&self, owner_id: Uuid) -> ContentItem {
        let item = self.upload_text(owner_id, 620).await;
        self.service
            .process_content(item.id)
            .await
            .expect("content processed");
        item
    }
}
