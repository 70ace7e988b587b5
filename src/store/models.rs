//! Persisted records for content items, style exemplars, generated content and failures.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::seo::SeoMetadata;
use crate::pipeline::style::{ExemplarCharacteristics, StylePatterns};
use crate::util::error::ErrorKind;

/// コンテンツ処理の状態。
///
/// 前進のみ許可され、リトライは同じ状態への再入として扱う。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    Uploaded,
    Transcribing,
    Analyzing,
    Ready,
    Failed,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 5] = [
        ProcessingState::Uploaded,
        ProcessingState::Transcribing,
        ProcessingState::Analyzing,
        ProcessingState::Ready,
        ProcessingState::Failed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingState::Uploaded => "uploaded",
            ProcessingState::Transcribing => "transcribing",
            ProcessingState::Analyzing => "analyzing",
            ProcessingState::Ready => "ready",
            ProcessingState::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(ProcessingState::Uploaded),
            "transcribing" => Some(ProcessingState::Transcribing),
            "analyzing" => Some(ProcessingState::Analyzing),
            "ready" => Some(ProcessingState::Ready),
            "failed" => Some(ProcessingState::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingState::Ready | ProcessingState::Failed)
    }

    /// 遷移が許可されているかを判定する。同一状態への再入（リトライ）は非終端状態のみ許可。
    #[must_use]
    pub fn can_transition_to(self, next: ProcessingState) -> bool {
        use ProcessingState::{Analyzing, Failed, Ready, Transcribing, Uploaded};

        match (self, next) {
            (Ready | Failed, _) => false,
            (current, next) if current == next => true,
            (Uploaded, Transcribing | Analyzing | Failed)
            | (Transcribing, Analyzing | Failed)
            | (Analyzing, Ready | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Text,
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Text => "text",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MediaKind::Text),
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    #[must_use]
    pub fn needs_transcription(self) -> bool {
        !matches!(self, MediaKind::Text)
    }
}

/// Target social platform. The set is closed; every match over it is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[serde(rename = "linkedin")]
    LinkedIn,
    Twitter,
    Instagram,
    #[serde(rename = "youtube_shorts")]
    YouTubeShorts,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::LinkedIn,
        Platform::Twitter,
        Platform::Instagram,
        Platform::YouTubeShorts,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::LinkedIn => "linkedin",
            Platform::Twitter => "twitter",
            Platform::Instagram => "instagram",
            Platform::YouTubeShorts => "youtube_shorts",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linkedin" => Some(Platform::LinkedIn),
            "twitter" | "x" => Some(Platform::Twitter),
            "instagram" => Some(Platform::Instagram),
            "youtube_shorts" | "youtube-shorts" | "youtube" => Some(Platform::YouTubeShorts),
            _ => None,
        }
    }

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Platform::LinkedIn => "LinkedIn",
            Platform::Twitter => "Twitter",
            Platform::Instagram => "Instagram",
            Platform::YouTubeShorts => "YouTube Shorts",
        }
    }

    /// 生成物を指す冠詞付きの名詞句。プロンプト文中で使う。
    #[must_use]
    pub fn prompt_noun(self) -> &'static str {
        match self {
            Platform::LinkedIn => "a LinkedIn post",
            Platform::Twitter => "a Twitter thread",
            Platform::Instagram => "an Instagram caption",
            Platform::YouTubeShorts => "a YouTube Shorts script",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// アップロードされた元コンテンツ。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub storage_locator: String,
    pub media_kind: MediaKind,
    pub media_format: String,
    pub state: ProcessingState,
    pub transcript_locator: Option<String>,
    pub topics: Option<Vec<String>>,
    pub duration_secs: Option<f64>,
    pub transcription_job_id: Option<String>,
    /// 失敗した文字起こしジョブの数。次のジョブの冪等キーに使う。
    #[serde(default)]
    pub failed_transcription_jobs: u32,
    pub image_description: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    #[must_use]
    pub fn new(new: NewContentItem, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner_id: new.owner_id,
            storage_locator: new.storage_locator,
            media_kind: new.media_kind,
            media_format: new.media_format,
            state: ProcessingState::Uploaded,
            transcript_locator: None,
            topics: None,
            duration_secs: None,
            transcription_job_id: None,
            failed_transcription_jobs: 0,
            image_description: new.image_description,
            last_error: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    /// 生成ステージで使うテキストの格納先。文字起こし済みならトランスクリプトを優先する。
    #[must_use]
    pub fn source_text_locator(&self) -> &str {
        self.transcript_locator
            .as_deref()
            .unwrap_or(&self.storage_locator)
    }
}

/// Upload-time description of a new content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContentItem {
    pub owner_id: Uuid,
    pub storage_locator: String,
    pub media_kind: MediaKind,
    pub media_format: String,
    pub image_description: Option<String>,
}

/// Fields written together with a state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentUpdate {
    pub transcript_locator: Option<String>,
    pub duration_secs: Option<f64>,
    pub topics: Option<Vec<String>>,
    pub last_error: Option<String>,
}

/// Caller-facing view of an item's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingStatus {
    pub content_id: Uuid,
    pub state: ProcessingState,
    pub topics: Option<Vec<String>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ContentItem> for ProcessingStatus {
    fn from(item: &ContentItem) -> Self {
        Self {
            content_id: item.id,
            state: item.state,
            topics: item.topics.clone(),
            last_error: item.last_error.clone(),
            updated_at: item.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Embedded,
    Failed,
}

impl EmbeddingStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingStatus::Embedded => "embedded",
            EmbeddingStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "embedded" => Some(EmbeddingStatus::Embedded),
            "failed" => Some(EmbeddingStatus::Failed),
            _ => None,
        }
    }
}

/// ユーザーの過去の文章サンプル。埋め込み後は不変。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleExemplar {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub text: String,
    pub embedding_status: EmbeddingStatus,
    pub characteristics: ExemplarCharacteristics,
    pub created_at: DateTime<Utc>,
}

/// Readiness view over a user's exemplars. Never stored; recomputed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleProfile {
    pub user_id: Uuid,
    pub exemplar_count: usize,
    pub ready: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl StyleProfile {
    pub const MIN_EXEMPLARS: usize = 3;

    #[must_use]
    pub fn from_exemplars(user_id: Uuid, exemplars: &[StyleExemplar]) -> Self {
        let exemplar_count = exemplars.len();
        let all_embedded = exemplars
            .iter()
            .all(|exemplar| exemplar.embedding_status == EmbeddingStatus::Embedded);

        Self {
            user_id,
            exemplar_count,
            ready: exemplar_count >= Self::MIN_EXEMPLARS && all_embedded,
            last_updated: exemplars.iter().map(|exemplar| exemplar.created_at).max(),
        }
    }
}

/// 生成コンテンツのライフサイクル。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Draft,
    Approved,
    Scheduled,
    Published,
}

impl GenerationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Draft => "draft",
            GenerationStatus::Approved => "approved",
            GenerationStatus::Scheduled => "scheduled",
            GenerationStatus::Published => "published",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(GenerationStatus::Draft),
            "approved" => Some(GenerationStatus::Approved),
            "scheduled" => Some(GenerationStatus::Scheduled),
            "published" => Some(GenerationStatus::Published),
            _ => None,
        }
    }

    /// Only the immediate successor is reachable.
    #[must_use]
    pub fn can_advance_to(self, next: GenerationStatus) -> bool {
        matches!(
            (self, next),
            (GenerationStatus::Draft, GenerationStatus::Approved)
                | (GenerationStatus::Approved, GenerationStatus::Scheduled)
                | (GenerationStatus::Scheduled, GenerationStatus::Published)
        )
    }
}

/// 生成済みコンテンツの1バージョン。本文とメタデータは作成後に変更しない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub id: Uuid,
    pub content_id: Uuid,
    pub owner_id: Uuid,
    pub platform: Platform,
    pub version: u32,
    pub text: String,
    pub seo: SeoMetadata,
    pub status: GenerationStatus,
    pub seed: u64,
    pub style_snapshot: StylePatterns,
    pub created_at: DateTime<Utc>,
}

/// A validated generation waiting for its version number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewGeneratedContent {
    pub content_id: Uuid,
    pub owner_id: Uuid,
    pub platform: Platform,
    pub text: String,
    pub seo: SeoMetadata,
    pub seed: u64,
    pub style_snapshot: StylePatterns,
}

impl NewGeneratedContent {
    #[must_use]
    pub fn into_version(self, version: u32, created_at: DateTime<Utc>) -> GeneratedContent {
        GeneratedContent {
            id: Uuid::now_v7(),
            content_id: self.content_id,
            owner_id: self.owner_id,
            platform: self.platform,
            version,
            text: self.text,
            seo: self.seo,
            status: GenerationStatus::Draft,
            seed: self.seed,
            style_snapshot: self.style_snapshot,
            created_at,
        }
    }
}

/// Where a failure happened: a processing stage or a platform dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    Transcription,
    Analysis,
    Generation(Platform),
}

impl FailureScope {
    #[must_use]
    pub fn label(self) -> String {
        match self {
            FailureScope::Transcription => "transcription".to_string(),
            FailureScope::Analysis => "analysis".to_string(),
            FailureScope::Generation(platform) => format!("generation:{platform}"),
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transcription" => Some(FailureScope::Transcription),
            "analysis" => Some(FailureScope::Analysis),
            other => other
                .strip_prefix("generation:")
                .and_then(Platform::parse)
                .map(FailureScope::Generation),
        }
    }
}

/// 失敗の記録。呼び出し元へ返す前に必ず永続化する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub content_id: Uuid,
    pub scope: FailureScope,
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}
