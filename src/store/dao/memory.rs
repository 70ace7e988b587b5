//! インメモリDAO。ローカル実行と結合テスト用。
//!
//! 全エンティティを1つのミューテックスで保護するため、バージョン採番はロック内で直列化される。

use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::traits::{ContentDao, FailureDao, GenerationDao, StyleDao};
use crate::store::models::{
    ContentItem, ContentUpdate, EmbeddingStatus, FailureRecord, GeneratedContent, GenerationStatus,
    NewGeneratedContent, Platform, ProcessingState, StyleExemplar,
};

#[derive(Default)]
struct State {
    contents: HashMap<Uuid, ContentItem>,
    exemplars: Vec<StyleExemplar>,
    generations: Vec<GeneratedContent>,
    failures: Vec<FailureRecord>,
}

#[derive(Default)]
pub struct InMemoryDao {
    state: Mutex<State>,
}

impl InMemoryDao {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_update(item: &mut ContentItem, update: &ContentUpdate) {
    if let Some(locator) = &update.transcript_locator {
        item.transcript_locator = Some(locator.clone());
    }
    if let Some(duration) = update.duration_secs {
        item.duration_secs = Some(duration);
    }
    if let Some(topics) = &update.topics {
        item.topics = Some(topics.clone());
    }
    if let Some(error) = &update.last_error {
        item.last_error = Some(error.clone());
    }
}

#[async_trait]
impl ContentDao for InMemoryDao {
    async fn insert_content(&self, item: &ContentItem) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.contents.contains_key(&item.id) {
            bail!("content item {} already exists", item.id);
        }
        state.contents.insert(item.id, item.clone());
        Ok(())
    }

    async fn get_content(&self, id: Uuid) -> Result<Option<ContentItem>> {
        Ok(self.state.lock().await.contents.get(&id).cloned())
    }

    async fn transition_content(
        &self,
        id: Uuid,
        from: ProcessingState,
        to: ProcessingState,
        update: &ContentUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ContentItem>> {
        let mut state = self.state.lock().await;
        let Some(item) = state.contents.get_mut(&id) else {
            return Ok(None);
        };
        if item.state != from || !from.can_transition_to(to) {
            return Ok(None);
        }

        item.state = to;
        apply_update(item, update);
        item.updated_at = now;
        Ok(Some(item.clone()))
    }

    async fn set_transcription_job(
        &self,
        id: Uuid,
        job_id: Option<&str>,
        failed_jobs: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.contents.get_mut(&id) {
            Some(item) if item.state == ProcessingState::Transcribing => {
                item.transcription_job_id = job_id.map(str::to_string);
                item.failed_transcription_jobs = failed_jobs;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_content_by_owner(&self, owner_id: Uuid) -> Result<Vec<ContentItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<ContentItem> = state
            .contents
            .values()
            .filter(|item| item.owner_id == owner_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| (item.created_at, item.id));
        Ok(items)
    }

    async fn list_content_by_state(
        &self,
        states: &[ProcessingState],
        limit: usize,
    ) -> Result<Vec<ContentItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<ContentItem> = state
            .contents
            .values()
            .filter(|item| item.archived_at.is_none() && states.contains(&item.state))
            .cloned()
            .collect();
        items.sort_by_key(|item| (item.updated_at, item.id));
        items.truncate(limit);
        Ok(items)
    }

    async fn archive_content(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ContentItem>> {
        let mut state = self.state.lock().await;
        Ok(state.contents.get_mut(&id).map(|item| {
            if item.archived_at.is_none() {
                item.archived_at = Some(now);
                item.updated_at = now;
            }
            item.clone()
        }))
    }
}

#[async_trait]
impl StyleDao for InMemoryDao {
    async fn insert_exemplar(&self, exemplar: &StyleExemplar) -> Result<()> {
        self.state.lock().await.exemplars.push(exemplar.clone());
        Ok(())
    }

    async fn list_exemplars(&self, owner_id: Uuid) -> Result<Vec<StyleExemplar>> {
        let state = self.state.lock().await;
        Ok(state
            .exemplars
            .iter()
            .filter(|exemplar| exemplar.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn mark_exemplar_embedded(&self, id: Uuid) -> Result<Option<StyleExemplar>> {
        let mut state = self.state.lock().await;
        let Some(exemplar) = state
            .exemplars
            .iter_mut()
            .find(|exemplar| exemplar.id == id && exemplar.embedding_status == EmbeddingStatus::Failed)
        else {
            return Ok(None);
        };
        exemplar.embedding_status = EmbeddingStatus::Embedded;
        Ok(Some(exemplar.clone()))
    }
}

#[async_trait]
impl GenerationDao for InMemoryDao {
    async fn insert_generation(
        &self,
        generation: NewGeneratedContent,
        now: DateTime<Utc>,
    ) -> Result<GeneratedContent> {
        let mut state = self.state.lock().await;
        let next_version = state
            .generations
            .iter()
            .filter(|existing| {
                existing.content_id == generation.content_id
                    && existing.platform == generation.platform
            })
            .map(|existing| existing.version)
            .max()
            .unwrap_or(0)
            + 1;

        let stored = generation.into_version(next_version, now);
        state.generations.push(stored.clone());
        Ok(stored)
    }

    async fn get_generation(&self, id: Uuid) -> Result<Option<GeneratedContent>> {
        let state = self.state.lock().await;
        Ok(state.generations.iter().find(|g| g.id == id).cloned())
    }

    async fn list_versions(
        &self,
        content_id: Uuid,
        platform: Platform,
    ) -> Result<Vec<GeneratedContent>> {
        let state = self.state.lock().await;
        let mut versions: Vec<GeneratedContent> = state
            .generations
            .iter()
            .filter(|g| g.content_id == content_id && g.platform == platform)
            .cloned()
            .collect();
        versions.sort_by_key(|g| g.version);
        Ok(versions)
    }

    async fn get_version(
        &self,
        content_id: Uuid,
        platform: Platform,
        version: u32,
    ) -> Result<Option<GeneratedContent>> {
        let state = self.state.lock().await;
        Ok(state
            .generations
            .iter()
            .find(|g| g.content_id == content_id && g.platform == platform && g.version == version)
            .cloned())
    }

    async fn latest_version(
        &self,
        content_id: Uuid,
        platform: Platform,
    ) -> Result<Option<GeneratedContent>> {
        let state = self.state.lock().await;
        Ok(state
            .generations
            .iter()
            .filter(|g| g.content_id == content_id && g.platform == platform)
            .max_by_key(|g| g.version)
            .cloned())
    }

    async fn update_generation_status(
        &self,
        id: Uuid,
        from: GenerationStatus,
        to: GenerationStatus,
    ) -> Result<Option<GeneratedContent>> {
        let mut state = self.state.lock().await;
        Ok(state
            .generations
            .iter_mut()
            .find(|g| g.id == id && g.status == from)
            .map(|g| {
                g.status = to;
                g.clone()
            }))
    }
}

#[async_trait]
impl FailureDao for InMemoryDao {
    async fn record_failure(&self, failure: &FailureRecord) -> Result<()> {
        self.state.lock().await.failures.push(failure.clone());
        Ok(())
    }

    async fn list_failures(&self, content_id: Uuid) -> Result<Vec<FailureRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .failures
            .iter()
            .filter(|failure| failure.content_id == content_id)
            .cloned()
            .collect())
    }
}
