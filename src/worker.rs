//! Background worker that drives pending content items to a terminal state.
//!
//! Each tick lists non-terminal, non-archived items (oldest first) and hands every one
//! that is not already in flight to the processing state machine, bounded by a semaphore.
//! Items left in `transcribing`/`analyzing` by a previous process are resumed the same way.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::service::RepurposeService;
use crate::store::models::ProcessingState;

const PENDING_STATES: [ProcessingState; 3] = [
    ProcessingState::Uploaded,
    ProcessingState::Transcribing,
    ProcessingState::Analyzing,
];

pub struct ProcessingWorker {
    service: Arc<RepurposeService>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    concurrency: usize,
    poll_interval: Duration,
}

impl ProcessingWorker {
    #[must_use]
    pub fn new(service: Arc<RepurposeService>, concurrency: usize, poll_interval: Duration) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            service,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            concurrency,
            poll_interval,
        }
    }

    /// ワーカーループを起動する。`cancel_token.cancel()` で停止する。
    #[must_use]
    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel_token).await })
    }

    async fn run(self, cancel_token: CancellationToken) {
        info!(
            concurrency = self.concurrency,
            poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "processing worker started"
        );

        loop {
            match self.tick().await {
                Ok(0) => {}
                Ok(dispatched) => debug!(dispatched, "processing tick dispatched items"),
                Err(error) => error!(error = ?error, "processing tick failed"),
            }

            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!("processing worker received shutdown signal, stopping");
                    break;
                }
                () = sleep(self.poll_interval) => {}
            }
        }

        info!("processing worker shutdown complete");
    }

    /// 保留中のアイテムを空きスロットの分だけディスパッチし、その件数を返す。
    ///
    /// # Errors
    /// 保留アイテムの一覧取得に失敗した場合。
    pub async fn tick(&self) -> Result<usize> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let pending = self
            .service
            .dao()
            .list_content_by_state(&PENDING_STATES, available + self.concurrency)
            .await
            .context("failed to list pending content")?;

        let mut dispatched = 0;
        for item in pending {
            if !self.in_flight.lock().await.insert(item.id) {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                self.in_flight.lock().await.remove(&item.id);
                break;
            };

            let service = Arc::clone(&self.service);
            let in_flight = Arc::clone(&self.in_flight);
            let content_id = item.id;
            tokio::spawn(async move {
                let _permit = permit;
                match service.process_content(content_id).await {
                    Ok(status) => info!(
                        content_id = %content_id,
                        state = %status.state,
                        "content processing finished"
                    ),
                    Err(error) => warn!(
                        content_id = %content_id,
                        kind = error.kind().as_str(),
                        error = %error,
                        "content processing stopped"
                    ),
                }
                in_flight.lock().await.remove(&content_id);
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }
}
