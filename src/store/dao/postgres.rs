//! PostgreSQL implementation of the DAO traits.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::traits::{ContentDao, FailureDao, GenerationDao, StyleDao};
use crate::pipeline::seo::SeoMetadata;
use crate::pipeline::style::{ExemplarCharacteristics, StylePatterns};
use crate::store::models::{
    ContentItem, ContentUpdate, EmbeddingStatus, FailureRecord, FailureScope, GeneratedContent,
    GenerationStatus, MediaKind, NewGeneratedContent, Platform, ProcessingState, StyleExemplar,
};
use crate::util::error::ErrorKind;
use crate::util::idempotency::acquire_version_lock;

const CONTENT_COLUMNS: &str = "id, owner_id, storage_locator, media_kind, media_format, state, \
     transcript_locator, topics, duration_secs, transcription_job_id, failed_transcription_jobs, \
     image_description, last_error, created_at, updated_at, archived_at";

const GENERATION_COLUMNS: &str = "id, content_id, owner_id, platform, version, body, seo, \
     status, seed, style_snapshot, created_at";

#[derive(Debug, Clone)]
pub struct PgRepurposeDao {
    pool: PgPool,
}

impl PgRepurposeDao {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 接続確認。readinessプローブから呼ばれる。
    ///
    /// # Errors
    /// プールから接続を取得できない、またはクエリが失敗した場合。
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("repurpose database ping failed")?;
        Ok(())
    }
}

// シードはu64だがBIGINTに格納するためビット列をそのまま再解釈する
fn seed_to_db(seed: u64) -> i64 {
    i64::from_be_bytes(seed.to_be_bytes())
}

fn seed_from_db(raw: i64) -> u64 {
    u64::from_be_bytes(raw.to_be_bytes())
}

fn content_from_row(row: &PgRow) -> Result<ContentItem> {
    let media_kind: String = row.try_get("media_kind")?;
    let state: String = row.try_get("state")?;
    let topics: Option<Json<Vec<String>>> = row.try_get("topics")?;
    let failed_jobs: i32 = row.try_get("failed_transcription_jobs")?;

    Ok(ContentItem {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        storage_locator: row.try_get("storage_locator")?,
        media_kind: MediaKind::parse(&media_kind)
            .ok_or_else(|| anyhow!("unknown media kind: {media_kind}"))?,
        media_format: row.try_get("media_format")?,
        state: ProcessingState::parse(&state)
            .ok_or_else(|| anyhow!("unknown processing state: {state}"))?,
        transcript_locator: row.try_get("transcript_locator")?,
        topics: topics.map(|Json(topics)| topics),
        duration_secs: row.try_get("duration_secs")?,
        transcription_job_id: row.try_get("transcription_job_id")?,
        failed_transcription_jobs: u32::try_from(failed_jobs)
            .map_err(|_| anyhow!("negative failed transcription job count: {failed_jobs}"))?,
        image_description: row.try_get("image_description")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        archived_at: row.try_get("archived_at")?,
    })
}

fn exemplar_from_row(row: &PgRow) -> Result<StyleExemplar> {
    let status: String = row.try_get("embedding_status")?;
    let Json(characteristics): Json<ExemplarCharacteristics> = row.try_get("characteristics")?;

    Ok(StyleExemplar {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        text: row.try_get("body")?,
        embedding_status: EmbeddingStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown embedding status: {status}"))?,
        characteristics,
        created_at: row.try_get("created_at")?,
    })
}

fn generation_from_row(row: &PgRow) -> Result<GeneratedContent> {
    let platform: String = row.try_get("platform")?;
    let status: String = row.try_get("status")?;
    let version: i32 = row.try_get("version")?;
    let seed: i64 = row.try_get("seed")?;
    let Json(seo): Json<SeoMetadata> = row.try_get("seo")?;
    let Json(style_snapshot): Json<StylePatterns> = row.try_get("style_snapshot")?;

    Ok(GeneratedContent {
        id: row.try_get("id")?,
        content_id: row.try_get("content_id")?,
        owner_id: row.try_get("owner_id")?,
        platform: Platform::parse(&platform)
            .ok_or_else(|| anyhow!("unknown platform: {platform}"))?,
        version: u32::try_from(version).context("negative generation version")?,
        text: row.try_get("body")?,
        seo,
        status: GenerationStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown generation status: {status}"))?,
        seed: seed_from_db(seed),
        style_snapshot,
        created_at: row.try_get("created_at")?,
    })
}

fn failure_from_row(row: &PgRow) -> Result<FailureRecord> {
    let scope: String = row.try_get("scope")?;
    let kind: String = row.try_get("kind")?;

    Ok(FailureRecord {
        content_id: row.try_get("content_id")?,
        scope: FailureScope::parse(&scope).ok_or_else(|| anyhow!("unknown failure scope: {scope}"))?,
        kind: ErrorKind::parse(&kind).ok_or_else(|| anyhow!("unknown error kind: {kind}"))?,
        message: row.try_get("message")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

#[async_trait]
impl ContentDao for PgRepurposeDao {
    async fn insert_content(&self, item: &ContentItem) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO content_items (
                id, owner_id, storage_locator, media_kind, media_format, state,
                transcript_locator, topics, duration_secs, transcription_job_id,
                failed_transcription_jobs, image_description, last_error, created_at,
                updated_at, archived_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ",
        )
        .bind(item.id)
        .bind(item.owner_id)
        .bind(&item.storage_locator)
        .bind(item.media_kind.as_str())
        .bind(&item.media_format)
        .bind(item.state.as_str())
        .bind(&item.transcript_locator)
        .bind(item.topics.as_ref().map(Json))
        .bind(item.duration_secs)
        .bind(&item.transcription_job_id)
        .bind(i32::try_from(item.failed_transcription_jobs).unwrap_or(i32::MAX))
        .bind(&item.image_description)
        .bind(&item.last_error)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.archived_at)
        .execute(&self.pool)
        .await
        .context("failed to insert content_items record")?;

        Ok(())
    }

    async fn get_content(&self, id: Uuid) -> Result<Option<ContentItem>> {
        let row = sqlx::query(&format!(
            "SELECT {CONTENT_COLUMNS} FROM content_items WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch content item")?;

        row.as_ref().map(content_from_row).transpose()
    }

    async fn transition_content(
        &self,
        id: Uuid,
        from: ProcessingState,
        to: ProcessingState,
        update: &ContentUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ContentItem>> {
        if !from.can_transition_to(to) {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            r"
            UPDATE content_items
            SET state = $3,
                transcript_locator = COALESCE($4, transcript_locator),
                duration_secs = COALESCE($5, duration_secs),
                topics = COALESCE($6, topics),
                last_error = COALESCE($7, last_error),
                updated_at = $8
            WHERE id = $1 AND state = $2
            RETURNING {CONTENT_COLUMNS}
            "
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(&update.transcript_locator)
        .bind(update.duration_secs)
        .bind(update.topics.as_ref().map(Json))
        .bind(&update.last_error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to transition content item")?;

        row.as_ref().map(content_from_row).transpose()
    }

    async fn set_transcription_job(
        &self,
        id: Uuid,
        job_id: Option<&str>,
        failed_jobs: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE content_items
            SET transcription_job_id = $2, failed_transcription_jobs = $3, updated_at = $4
            WHERE id = $1 AND state = 'transcribing'
            ",
        )
        .bind(id)
        .bind(job_id)
        .bind(i32::try_from(failed_jobs).unwrap_or(i32::MAX))
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to persist transcription job id")?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_content_by_owner(&self, owner_id: Uuid) -> Result<Vec<ContentItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTENT_COLUMNS} FROM content_items WHERE owner_id = $1 ORDER BY created_at, id"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list content items by owner")?;

        rows.iter().map(content_from_row).collect()
    }

    async fn list_content_by_state(
        &self,
        states: &[ProcessingState],
        limit: usize,
    ) -> Result<Vec<ContentItem>> {
        let states: Vec<&str> = states.iter().map(|state| state.as_str()).collect();
        let rows = sqlx::query(&format!(
            r"
            SELECT {CONTENT_COLUMNS}
            FROM content_items
            WHERE state = ANY($1) AND archived_at IS NULL
            ORDER BY updated_at, id
            LIMIT $2
            "
        ))
        .bind(states)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("failed to list content items by state")?;

        rows.iter().map(content_from_row).collect()
    }

    async fn archive_content(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ContentItem>> {
        let row = sqlx::query(&format!(
            r"
            UPDATE content_items
            SET archived_at = COALESCE(archived_at, $2),
                updated_at = CASE WHEN archived_at IS NULL THEN $2 ELSE updated_at END
            WHERE id = $1
            RETURNING {CONTENT_COLUMNS}
            "
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to archive content item")?;

        row.as_ref().map(content_from_row).transpose()
    }
}

#[async_trait]
impl StyleDao for PgRepurposeDao {
    async fn insert_exemplar(&self, exemplar: &StyleExemplar) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO style_exemplars (id, owner_id, body, embedding_status, characteristics, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(exemplar.id)
        .bind(exemplar.owner_id)
        .bind(&exemplar.text)
        .bind(exemplar.embedding_status.as_str())
        .bind(Json(&exemplar.characteristics))
        .bind(exemplar.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert style exemplar")?;

        Ok(())
    }

    async fn list_exemplars(&self, owner_id: Uuid) -> Result<Vec<StyleExemplar>> {
        let rows = sqlx::query(
            r"
            SELECT id, owner_id, body, embedding_status, characteristics, created_at
            FROM style_exemplars
            WHERE owner_id = $1
            ORDER BY created_at, id
            ",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list style exemplars")?;

        rows.iter().map(exemplar_from_row).collect()
    }

    async fn mark_exemplar_embedded(&self, id: Uuid) -> Result<Option<StyleExemplar>> {
        let row = sqlx::query(
            r"
            UPDATE style_exemplars
            SET embedding_status = $2
            WHERE id = $1 AND embedding_status = $3
            RETURNING id, owner_id, body, embedding_status, characteristics, created_at
            ",
        )
        .bind(id)
        .bind(EmbeddingStatus::Embedded.as_str())
        .bind(EmbeddingStatus::Failed.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to mark style exemplar embedded")?;

        row.as_ref().map(exemplar_from_row).transpose()
    }
}

#[async_trait]
impl GenerationDao for PgRepurposeDao {
    async fn insert_generation(
        &self,
        generation: NewGeneratedContent,
        now: DateTime<Utc>,
    ) -> Result<GeneratedContent> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        acquire_version_lock(&mut *tx, generation.content_id, generation.platform)
            .await
            .context("failed to acquire version lock")?;

        let current: Option<i32> = sqlx::query_scalar(
            r"
            SELECT MAX(version)
            FROM generated_contents
            WHERE content_id = $1 AND platform = $2
            ",
        )
        .bind(generation.content_id)
        .bind(generation.platform.as_str())
        .fetch_one(&mut *tx)
        .await
        .context("failed to read current version")?;

        let next = u32::try_from(current.unwrap_or(0)).context("negative generation version")? + 1;
        let stored = generation.into_version(next, now);

        sqlx::query(
            r"
            INSERT INTO generated_contents (
                id, content_id, owner_id, platform, version, body, seo,
                status, seed, style_snapshot, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(stored.id)
        .bind(stored.content_id)
        .bind(stored.owner_id)
        .bind(stored.platform.as_str())
        .bind(i32::try_from(stored.version).context("version overflow")?)
        .bind(&stored.text)
        .bind(Json(&stored.seo))
        .bind(stored.status.as_str())
        .bind(seed_to_db(stored.seed))
        .bind(Json(&stored.style_snapshot))
        .bind(stored.created_at)
        .execute(&mut *tx)
        .await
        .context("failed to insert generated content")?;

        tx.commit().await.context("failed to commit transaction")?;

        Ok(stored)
    }

    async fn get_generation(&self, id: Uuid) -> Result<Option<GeneratedContent>> {
        let row = sqlx::query(&format!(
            "SELECT {GENERATION_COLUMNS} FROM generated_contents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch generated content")?;

        row.as_ref().map(generation_from_row).transpose()
    }

    async fn list_versions(
        &self,
        content_id: Uuid,
        platform: Platform,
    ) -> Result<Vec<GeneratedContent>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {GENERATION_COLUMNS}
            FROM generated_contents
            WHERE content_id = $1 AND platform = $2
            ORDER BY version
            "
        ))
        .bind(content_id)
        .bind(platform.as_str())
        .fetch_all(&self.pool)
        .await
        .context("failed to list generated content versions")?;

        rows.iter().map(generation_from_row).collect()
    }

    async fn get_version(
        &self,
        content_id: Uuid,
        platform: Platform,
        version: u32,
    ) -> Result<Option<GeneratedContent>> {
        let row = sqlx::query(&format!(
            r"
            SELECT {GENERATION_COLUMNS}
            FROM generated_contents
            WHERE content_id = $1 AND platform = $2 AND version = $3
            "
        ))
        .bind(content_id)
        .bind(platform.as_str())
        .bind(i32::try_from(version).context("version overflow")?)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch generated content version")?;

        row.as_ref().map(generation_from_row).transpose()
    }

    async fn latest_version(
        &self,
        content_id: Uuid,
        platform: Platform,
    ) -> Result<Option<GeneratedContent>> {
        let row = sqlx::query(&format!(
            r"
            SELECT {GENERATION_COLUMNS}
            FROM generated_contents
            WHERE content_id = $1 AND platform = $2
            ORDER BY version DESC
            LIMIT 1
            "
        ))
        .bind(content_id)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch latest generated content")?;

        row.as_ref().map(generation_from_row).transpose()
    }

    async fn update_generation_status(
        &self,
        id: Uuid,
        from: GenerationStatus,
        to: GenerationStatus,
    ) -> Result<Option<GeneratedContent>> {
        let row = sqlx::query(&format!(
            r"
            UPDATE generated_contents
            SET status = $3
            WHERE id = $1 AND status = $2
            RETURNING {GENERATION_COLUMNS}
            "
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to update generation status")?;

        row.as_ref().map(generation_from_row).transpose()
    }
}

#[async_trait]
impl FailureDao for PgRepurposeDao {
    async fn record_failure(&self, failure: &FailureRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO failure_records (content_id, scope, kind, message, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(failure.content_id)
        .bind(failure.scope.label())
        .bind(failure.kind.as_str())
        .bind(&failure.message)
        .bind(failure.occurred_at)
        .execute(&self.pool)
        .await
        .context("failed to insert failure record")?;

        Ok(())
    }

    async fn list_failures(&self, content_id: Uuid) -> Result<Vec<FailureRecord>> {
        let rows = sqlx::query(
            r"
            SELECT content_id, scope, kind, message, occurred_at
            FROM failure_records
            WHERE content_id = $1
            ORDER BY occurred_at, id
            ",
        )
        .bind(content_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list failure records")?;

        rows.iter().map(failure_from_row).collect()
    }
}
