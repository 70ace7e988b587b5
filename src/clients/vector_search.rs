use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::pipeline::style::ExemplarCharacteristics;
use crate::util::error::PipelineError;

use super::{check_status, map_send_error};

const SERVICE: &str = "vector-search";

/// Payload stored next to each exemplar vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExemplarMetadata {
    pub exemplar_id: Uuid,
    pub text: String,
    pub characteristics: ExemplarCharacteristics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub exemplar_id: Uuid,
    pub score: f32,
    pub metadata: ExemplarMetadata,
}

/// ユーザーごとに分離されたベクトル索引。`query` はスコアの降順で返す。
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn upsert(
        &self,
        user_id: Uuid,
        vector: Vec<f32>,
        metadata: ExemplarMetadata,
    ) -> Result<(), PipelineError>;

    async fn query(
        &self,
        user_id: Uuid,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorMatch>, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct VectorSearchClient {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct UpsertPayload<'a> {
    id: Uuid,
    vector: &'a [f32],
    metadata: &'a ExemplarMetadata,
}

#[derive(Debug, Serialize)]
struct QueryPayload<'a> {
    vector: &'a [f32],
    k: usize,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    matches: Vec<VectorMatch>,
}

impl VectorSearchClient {
    /// # Errors
    /// HTTPクライアントの構築やURLの解釈に失敗した場合。
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build vector-search client")?;
        let base_url = Url::parse(&base_url.into()).context("invalid vector-search base URL")?;

        Ok(Self { client, base_url })
    }

    fn namespace_url(&self, user_id: Uuid, suffix: &str) -> Result<Url, PipelineError> {
        self.base_url
            .join(&format!("v1/namespaces/{user_id}/{suffix}"))
            .map_err(|error| PipelineError::Validation(format!("invalid vector-search URL: {error}")))
    }
}

#[async_trait]
impl VectorSearch for VectorSearchClient {
    async fn upsert(
        &self,
        user_id: Uuid,
        vector: Vec<f32>,
        metadata: ExemplarMetadata,
    ) -> Result<(), PipelineError> {
        let response = self
            .client
            .post(self.namespace_url(user_id, "vectors")?)
            .json(&UpsertPayload {
                id: metadata.exemplar_id,
                vector: &vector,
                metadata: &metadata,
            })
            .send()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;
        check_status(SERVICE, response).await?;
        Ok(())
    }

    async fn query(
        &self,
        user_id: Uuid,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorMatch>, PipelineError> {
        let response = self
            .client
            .post(self.namespace_url(user_id, "query")?)
            .json(&QueryPayload { vector, k })
            .send()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        let mut body: QueryResponse = check_status(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        body.matches
            .sort_by(|a, b| b.score.total_cmp(&a.score).then(a.exemplar_id.cmp(&b.exemplar_id)));
        body.matches.truncate(k);
        Ok(body.matches)
    }
}

struct StoredVector {
    vector: Vec<f32>,
    metadata: ExemplarMetadata,
}

/// コサイン類似度による総当たり検索。ローカル実行とテスト用。
#[derive(Default)]
pub struct MemoryVectorSearch {
    namespaces: RwLock<HashMap<Uuid, Vec<StoredVector>>>,
}

impl MemoryVectorSearch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, user_id: Uuid) -> usize {
        self.namespaces
            .read()
            .await
            .get(&user_id)
            .map_or(0, Vec::len)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorSearch for MemoryVectorSearch {
    async fn upsert(
        &self,
        user_id: Uuid,
        vector: Vec<f32>,
        metadata: ExemplarMetadata,
    ) -> Result<(), PipelineError> {
        let mut namespaces = self.namespaces.write().await;
        let entries = namespaces.entry(user_id).or_default();
        entries.retain(|entry| entry.metadata.exemplar_id != metadata.exemplar_id);
        entries.push(StoredVector { vector, metadata });
        Ok(())
    }

    async fn query(
        &self,
        user_id: Uuid,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorMatch>, PipelineError> {
        let namespaces = self.namespaces.read().await;
        let Some(entries) = namespaces.get(&user_id) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = entries
            .iter()
            .map(|entry| VectorMatch {
                exemplar_id: entry.metadata.exemplar_id,
                score: cosine_similarity(vector, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.exemplar_id.cmp(&b.exemplar_id)));
        matches.truncate(k);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metadata(text: &str) -> ExemplarMetadata {
        ExemplarMetadata {
            exemplar_id: Uuid::new_v4(),
            text: text.to_string(),
            characteristics: ExemplarCharacteristics::default(),
        }
    }

    #[tokio::test]
    async fn memory_search_is_scoped_per_user_and_ranked() {
        let search = MemoryVectorSearch::new();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        let near = metadata("near");
        let far = metadata("far");
        search.upsert(user, vec![1.0, 0.0], near.clone()).await.unwrap();
        search.upsert(user, vec![0.0, 1.0], far.clone()).await.unwrap();
        search.upsert(other, vec![1.0, 0.0], metadata("foreign")).await.unwrap();

        let matches = search.query(user, &[0.9, 0.1], 5).await.unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].exemplar_id, near.exemplar_id);
        assert_eq!(matches[1].exemplar_id, far.exemplar_id);
    }

    #[tokio::test]
    async fn memory_upsert_replaces_same_exemplar() {
        let search = MemoryVectorSearch::new();
        let user = Uuid::new_v4();
        let exemplar = metadata("a");

        search.upsert(user, vec![1.0], exemplar.clone()).await.unwrap();
        search.upsert(user, vec![1.0], exemplar).await.unwrap();

        assert_eq!(search.len(user).await, 1);
    }

    #[tokio::test]
    async fn client_query_orders_and_truncates() {
        let server = MockServer::start().await;
        let user = Uuid::new_v4();
        let low = metadata("low");
        let high = metadata("high");
        Mock::given(method("POST"))
            .and(path(format!("/v1/namespaces/{user}/query")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "matches": [
                    { "exemplar_id": low.exemplar_id, "score": 0.2, "metadata": low },
                    { "exemplar_id": high.exemplar_id, "score": 0.9, "metadata": high },
                ]
            })))
            .mount(&server)
            .await;

        let client = VectorSearchClient::new(server.uri(), Duration::from_secs(5)).expect("builds");
        let matches = client.query(user, &[0.1, 0.2], 1).await.expect("query succeeds");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].exemplar_id, high.exemplar_id);
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }
}
