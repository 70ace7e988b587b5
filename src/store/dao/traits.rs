//! DAO trait definitions, one per entity.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::models::{
    ContentItem, ContentUpdate, FailureRecord, GeneratedContent, GenerationStatus,
    NewGeneratedContent, Platform, ProcessingState, StyleExemplar,
};

#[async_trait]
pub trait ContentDao: Send + Sync {
    async fn insert_content(&self, item: &ContentItem) -> Result<()>;

    async fn get_content(&self, id: Uuid) -> Result<Option<ContentItem>>;

    /// 現在の状態が `from` の場合に限り `to` へ遷移し、`update` の設定済みフィールドを書き込む。
    ///
    /// # Returns
    /// - `Ok(Some(item))`: 遷移成功（更新後のレコード）
    /// - `Ok(None)`: 状態が一致しない（他のワーカーが先に遷移させた）
    async fn transition_content(
        &self,
        id: Uuid,
        from: ProcessingState,
        to: ProcessingState,
        update: &ContentUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ContentItem>>;

    /// 文字起こしジョブIDと失敗済みジョブ数を記録する。`transcribing` 中のみ書き込む。
    async fn set_transcription_job(
        &self,
        id: Uuid,
        job_id: Option<&str>,
        failed_jobs: u32,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_content_by_owner(&self, owner_id: Uuid) -> Result<Vec<ContentItem>>;

    /// 指定状態のアーカイブされていないアイテムを古い順に返す。
    async fn list_content_by_state(
        &self,
        states: &[ProcessingState],
        limit: usize,
    ) -> Result<Vec<ContentItem>>;

    async fn archive_content(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ContentItem>>;
}

#[async_trait]
pub trait StyleDao: Send + Sync {
    async fn insert_exemplar(&self, exemplar: &StyleExemplar) -> Result<()>;

    async fn list_exemplars(&self, owner_id: Uuid) -> Result<Vec<StyleExemplar>>;

    /// 埋め込みに失敗したエグザンプラを `embedded` に更新する。
    ///
    /// # Returns
    /// 状態が `failed` でなかった（または存在しない）場合は `None`。
    async fn mark_exemplar_embedded(&self, id: Uuid) -> Result<Option<StyleExemplar>>;
}

#[async_trait]
pub trait GenerationDao: Send + Sync {
    /// 次のバージョン番号を採番して保存する。(content_id, platform) ごとに直列化される。
    async fn insert_generation(
        &self,
        generation: NewGeneratedContent,
        now: DateTime<Utc>,
    ) -> Result<GeneratedContent>;

    async fn get_generation(&self, id: Uuid) -> Result<Option<GeneratedContent>>;

    async fn list_versions(
        &self,
        content_id: Uuid,
        platform: Platform,
    ) -> Result<Vec<GeneratedContent>>;

    async fn get_version(
        &self,
        content_id: Uuid,
        platform: Platform,
        version: u32,
    ) -> Result<Option<GeneratedContent>>;

    async fn latest_version(
        &self,
        content_id: Uuid,
        platform: Platform,
    ) -> Result<Option<GeneratedContent>>;

    /// Compare-and-set on the lifecycle status. `None` when the current status is not `from`.
    async fn update_generation_status(
        &self,
        id: Uuid,
        from: GenerationStatus,
        to: GenerationStatus,
    ) -> Result<Option<GeneratedContent>>;
}

#[async_trait]
pub trait FailureDao: Send + Sync {
    async fn record_failure(&self, failure: &FailureRecord) -> Result<()>;

    async fn list_failures(&self, content_id: Uuid) -> Result<Vec<FailureRecord>>;
}

/// 全DAOトレイトをまとめたもの。サービス層はこれを `Arc<dyn RepurposeDao>` として保持する。
pub trait RepurposeDao: ContentDao + StyleDao + GenerationDao + FailureDao {}

impl<T> RepurposeDao for T where T: ContentDao + StyleDao + GenerationDao + FailureDao {}
