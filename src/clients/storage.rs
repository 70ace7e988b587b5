use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tokio::sync::RwLock;

use crate::util::error::PipelineError;

use super::{check_status, map_send_error};

const SERVICE: &str = "object-storage";

/// Opaque blob storage addressed by locator strings.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, locator: &str, bytes: Vec<u8>) -> Result<(), PipelineError>;
    async fn get(&self, locator: &str) -> Result<Vec<u8>, PipelineError>;
    async fn delete(&self, locator: &str) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    client: Client,
    base_url: Url,
}

impl HttpObjectStorage {
    /// # Errors
    /// HTTPクライアントの構築やURLの解釈に失敗した場合。
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build object-storage client")?;
        let base_url = Url::parse(&base_url.into()).context("invalid object-storage base URL")?;

        Ok(Self { client, base_url })
    }

    fn object_url(&self, locator: &str) -> Result<Url, PipelineError> {
        let locator = locator.trim_start_matches('/');
        if locator.is_empty() {
            return Err(PipelineError::Validation("empty storage locator".to_string()));
        }
        self.base_url
            .join(&format!("objects/{locator}"))
            .map_err(|error| PipelineError::Validation(format!("invalid locator {locator}: {error}")))
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn put(&self, locator: &str, bytes: Vec<u8>) -> Result<(), PipelineError> {
        let response = self
            .client
            .put(self.object_url(locator)?)
            .body(bytes)
            .send()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;
        check_status(SERVICE, response).await?;
        Ok(())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self
            .client
            .get(self.object_url(locator)?)
            .send()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PipelineError::not_found("object", locator));
        }

        let bytes = check_status(SERVICE, response)
            .await?
            .bytes()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, locator: &str) -> Result<(), PipelineError> {
        let response = self
            .client
            .delete(self.object_url(locator)?)
            .send()
            .await
            .map_err(|error| map_send_error(SERVICE, &error))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(SERVICE, response).await?;
        Ok(())
    }
}

/// プロセス内のオブジェクトストレージ。ローカル実行とテスト用。
#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, locator: &str) -> bool {
        self.objects.read().await.contains_key(locator)
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(&self, locator: &str, bytes: Vec<u8>) -> Result<(), PipelineError> {
        self.objects
            .write()
            .await
            .insert(locator.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>, PipelineError> {
        self.objects
            .read()
            .await
            .get(locator)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("object", locator))
    }

    async fn delete(&self, locator: &str) -> Result<(), PipelineError> {
        self.objects.write().await.remove(locator);
        Ok(())
    }
}
