use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    cache::RequestKey,
    fetch::{FetchRequest, FetchResponse},
    CacheWorker, WorkerError,
};
use crate::{
    store::{self, keys, KeyValueStore, StoreError},
    types::WorkerToClient,
};

pub const SYNC_TRAFFIC_TAG: &str = "sync-traffic-data";
pub const PERIODIC_TRAFFIC_TAG: &str = "update-traffic";

const TRAFFIC_UPDATE_ENDPOINT: &str = "/api/traffic/update";
const TRAFFIC_LATEST_ENDPOINT: &str = "/api/traffic/latest";

// Serializes read-modify-write of the offline queue across both contexts.
static QUEUE_LOCK: Mutex<()> = Mutex::const_new(());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineRecord {
    pub endpoint: String,
    pub payload: Value,
}

impl OfflineRecord {
    pub fn traffic(payload: Value) -> Self {
        Self {
            endpoint: TRAFFIC_UPDATE_ENDPOINT.into(),
            payload,
        }
    }
}

pub async fn load_offline_records(
    store: &dyn KeyValueStore,
) -> Result<Vec<OfflineRecord>, StoreError> {
    Ok(store::load_json(store, keys::OFFLINE_TRAFFIC_UPDATES)
        .await?
        .unwrap_or_default())
}

pub async fn queue_offline_record(
    store: &dyn KeyValueStore,
    record: OfflineRecord,
) -> Result<usize, StoreError> {
    let _guard = QUEUE_LOCK.lock().await;
    let mut records = load_offline_records(store).await?;
    records.push(record);
    store::save_json(store, keys::OFFLINE_TRAFFIC_UPDATES, &records).await?;
    Ok(records.len())
}

impl CacheWorker {
    pub async fn handle_sync(&self, tag: &str) -> Result<usize, WorkerError> {
        if tag != SYNC_TRAFFIC_TAG {
            debug!(%tag, "ignoring unknown sync tag");
            return Ok(0);
        }

        let flushed = self.flush_offline_records().await.inspect_err(|e| {
            warn!(error = %e, "sync failed, records kept for next trigger");
        })?;
        info!(flushed, "traffic data synced");

        if let Some(clients) = &self.clients {
            let _ = clients
                .send(WorkerToClient::SyncComplete {
                    tag: tag.to_string(),
                    flushed,
                })
                .await;
        }
        Ok(flushed)
    }

    /// Submits a snapshot of the queue in order. Only once every record in it
    /// was accepted are those records dropped; anything queued meanwhile stays.
    async fn flush_offline_records(&self) -> Result<usize, WorkerError> {
        let records = load_offline_records(self.store.as_ref()).await?;
        if records.is_empty() {
            return Ok(0);
        }

        for record in &records {
            let url = self.resolve(&record.endpoint)?;
            let request = FetchRequest::post_json(url.clone(), &record.payload)?;
            let resp = self.fetcher.fetch(&request).await?;
            ensure_success(&url, &resp)?;
        }

        let _guard = QUEUE_LOCK.lock().await;
        let mut current = load_offline_records(self.store.as_ref()).await?;
        current.drain(..records.len().min(current.len()));
        if current.is_empty() {
            self.store.remove(keys::OFFLINE_TRAFFIC_UPDATES).await?;
        } else {
            debug!(remaining = current.len(), "records queued during sync kept");
            store::save_json(self.store.as_ref(), keys::OFFLINE_TRAFFIC_UPDATES, &current).await?;
        }
        Ok(records.len())
    }

    pub async fn handle_periodic_sync(&self, tag: &str) -> Result<bool, WorkerError> {
        if tag != PERIODIC_TRAFFIC_TAG {
            debug!(%tag, "ignoring unknown periodic sync tag");
            return Ok(false);
        }

        let url = self.resolve(TRAFFIC_LATEST_ENDPOINT)?;
        let resp = self.fetcher.fetch(&FetchRequest::get(url.clone())).await?;
        ensure_success(&url, &resp)?;
        serde_json::from_slice::<Value>(&resp.body)?;

        self.current_cache().put(RequestKey::get(&url), resp);
        info!("traffic cache updated");
        Ok(true)
    }
}

fn ensure_success(url: &reqwest::Url, resp: &FetchResponse) -> Result<(), WorkerError> {
    if resp.is_success() {
        Ok(())
    } else {
        Err(WorkerError::Status {
            url: url.to_string(),
            status: resp.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use super::*;
    use crate::{
        config::WorkerSettings,
        platform::testing::RecordingPlatform,
        store::MemoryStore,
        worker::{cache::CacheStorage, fetch::{FetchError, Fetcher}},
    };

    struct RacingUplink {
        store: MemoryStore,
        raced: AtomicBool,
    }

    #[async_trait]
    impl Fetcher for RacingUplink {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            if request.method == Method::POST && !self.raced.swap(true, Ordering::SeqCst) {
                queue_offline_record(&self.store, OfflineRecord::traffic(json!({ "late": true })))
                    .await
                    .unwrap();
            }
            Ok(FetchResponse::new(StatusCode::OK, None, ""))
        }
    }

    #[tokio::test]
    async fn record_queued_during_flush_survives() {
        let store = MemoryStore::new();
        queue_offline_record(&store, OfflineRecord::traffic(json!({ "n": 1 })))
            .await
            .unwrap();
        let worker = CacheWorker::new(
            WorkerSettings::for_origin(crate::config::testing::origin()),
            CacheStorage::new(),
            Arc::new(RacingUplink {
                store: store.clone(),
                raced: AtomicBool::new(false),
            }),
            Arc::new(store.clone()),
            Arc::new(RecordingPlatform::default()),
            None,
        );

        assert_eq!(worker.handle_sync(SYNC_TRAFFIC_TAG).await.unwrap(), 1);
        assert_eq!(
            load_offline_records(&store).await.unwrap(),
            vec![OfflineRecord::traffic(json!({ "late": true }))]
        );

        assert_eq!(worker.handle_sync(SYNC_TRAFFIC_TAG).await.unwrap(), 1);
        assert!(load_offline_records(&store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_queue_flushes_nothing() {
        let store = MemoryStore::new();
        let worker = CacheWorker::new(
            WorkerSettings::for_origin(crate::config::testing::origin()),
            CacheStorage::new(),
            Arc::new(RacingUplink {
                store: store.clone(),
                raced: AtomicBool::new(false),
            }),
            Arc::new(store.clone()),
            Arc::new(RecordingPlatform::default()),
            None,
        );
        assert_eq!(worker.handle_sync(SYNC_TRAFFIC_TAG).await.unwrap(), 0);
    }
}
