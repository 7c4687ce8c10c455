pub mod cache;
pub mod fetch;
pub mod push;
pub mod strategy;
pub mod sync;

use std::sync::Arc;

use axum::{body::Bytes, http::StatusCode};
use reqwest::Url;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    config::WorkerSettings,
    platform::Platform,
    store::{KeyValueStore, StoreError},
    types::{ClientToWorker, WorkerToClient},
};

use self::{
    cache::{Cache, CacheStorage, RequestKey},
    fetch::{FetchError, FetchRequest, FetchResponse, Fetcher},
};

const EVENT_BUFFER: usize = 256;

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("{url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("worker is not running")]
    Unavailable,
}

pub struct CacheWorker {
    settings: WorkerSettings,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn KeyValueStore>,
    platform: Arc<dyn Platform>,
    clients: Option<mpsc::Sender<WorkerToClient>>,
    background: TaskTracker,
}

impl CacheWorker {
    pub fn new(
        settings: WorkerSettings,
        caches: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn KeyValueStore>,
        platform: Arc<dyn Platform>,
        clients: Option<mpsc::Sender<WorkerToClient>>,
    ) -> Self {
        Self {
            settings,
            caches,
            fetcher,
            store,
            platform,
            clients,
            background: TaskTracker::new(),
        }
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn cache_name(&self) -> String {
        self.settings.cache_name()
    }

    pub fn version(&self) -> &str {
        &self.settings.version
    }

    fn current_cache(&self) -> Arc<Cache> {
        self.caches.open(&self.cache_name())
    }

    fn resolve(&self, path: &str) -> Result<Url, WorkerError> {
        self.settings
            .origin
            .join(path)
            .map_err(|e| WorkerError::InvalidUrl(format!("{path}: {e}")))
    }

    pub async fn install(&self) -> Result<usize, WorkerError> {
        let mut fetched = Vec::with_capacity(self.settings.manifest.len());
        for entry in &self.settings.manifest {
            let url = self.resolve(entry)?;
            let resp = self.fetcher.fetch(&FetchRequest::get(url.clone())).await?;
            if !resp.is_success() {
                return Err(WorkerError::Status {
                    url: url.to_string(),
                    status: resp.status,
                });
            }
            fetched.push((RequestKey::get(&url), resp));
        }

        let cache = self.current_cache();
        let count = fetched.len();
        for (key, resp) in fetched {
            cache.put(key, resp);
        }
        info!(cache = %self.cache_name(), count, "cache populated");
        Ok(count)
    }

    pub async fn activate(&self) -> Vec<String> {
        let current = self.cache_name();
        let mut deleted = Vec::new();
        for name in self.caches.keys() {
            if name != current && self.caches.delete(&name) {
                info!(cache = %name, "deleting old cache");
                deleted.push(name);
            }
        }
        deleted
    }

    pub fn handle_message(&self, msg: ClientToWorker) {
        match msg {
            ClientToWorker::InitRealtime { client_id } => {
                info!(%client_id, "realtime client registered");
            }
            ClientToWorker::MessageQueued { count } => {
                debug!(count, "client queued message");
            }
            ClientToWorker::SkipWaiting => {
                info!("skip waiting requested");
            }
            ClientToWorker::GetVersion { reply } => {
                let _ = reply.send(self.settings.version.clone());
            }
        }
    }

    pub async fn settle(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }
}

pub enum WorkerEvent {
    Install {
        reply: oneshot::Sender<Result<usize, WorkerError>>,
    },
    Activate {
        reply: oneshot::Sender<Vec<String>>,
    },
    Fetch {
        request: FetchRequest,
        reply: oneshot::Sender<Result<FetchResponse, FetchError>>,
    },
    Sync {
        tag: String,
        reply: Option<oneshot::Sender<Result<usize, WorkerError>>>,
    },
    PeriodicSync {
        tag: String,
    },
    Push {
        data: Option<Bytes>,
    },
    NotificationClick {
        action: Option<String>,
        url: String,
    },
}

#[derive(Clone)]
pub struct WorkerHandle {
    events: mpsc::Sender<WorkerEvent>,
    messages: mpsc::Sender<ClientToWorker>,
}

impl WorkerHandle {
    pub fn message_port(&self) -> mpsc::Sender<ClientToWorker> {
        self.messages.clone()
    }

    pub async fn install(&self) -> Result<usize, WorkerError> {
        self.request(|reply| WorkerEvent::Install { reply })
            .await
            .unwrap_or(Err(WorkerError::Unavailable))
    }

    pub async fn activate(&self) -> Vec<String> {
        self.request(|reply| WorkerEvent::Activate { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, WorkerError> {
        self.request(|reply| WorkerEvent::Fetch { request, reply })
            .await
            .ok_or(WorkerError::Unavailable)?
            .map_err(WorkerError::from)
    }

    pub async fn sync(&self, tag: &str) -> Result<usize, WorkerError> {
        let tag = tag.to_string();
        self.request(|reply| WorkerEvent::Sync {
            tag,
            reply: Some(reply),
        })
        .await
        .unwrap_or(Err(WorkerError::Unavailable))
    }

    pub async fn periodic_sync(&self, tag: &str) {
        let _ = self
            .events
            .send(WorkerEvent::PeriodicSync {
                tag: tag.to_string(),
            })
            .await;
    }

    pub async fn push(&self, data: Option<Bytes>) {
        let _ = self.events.send(WorkerEvent::Push { data }).await;
    }

    pub async fn notification_click(&self, action: Option<&str>, url: &str) {
        let _ = self
            .events
            .send(WorkerEvent::NotificationClick {
                action: action.map(String::from),
                url: url.to_string(),
            })
            .await;
    }

    pub async fn version(&self) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.messages
            .send(ClientToWorker::GetVersion { reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WorkerEvent,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.events.send(make(tx)).await.ok()?;
        rx.await.ok()
    }
}

pub fn spawn(worker: Arc<CacheWorker>, shutdown: CancellationToken) -> (WorkerHandle, JoinHandle<()>) {
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (messages_tx, messages_rx) = mpsc::channel(EVENT_BUFFER);
    let handle = tokio::spawn(run_worker(worker, events_rx, messages_rx, shutdown));
    (
        WorkerHandle {
            events: events_tx,
            messages: messages_tx,
        },
        handle,
    )
}

async fn run_worker(
    worker: Arc<CacheWorker>,
    mut events: mpsc::Receiver<WorkerEvent>,
    mut messages: mpsc::Receiver<ClientToWorker>,
    shutdown: CancellationToken,
) {
    info!(version = %worker.version(), "cache worker started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = messages.recv() => match msg {
                Some(msg) => worker.handle_message(msg),
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => dispatch(&worker, event).await,
                None => break,
            },
        }
    }
    worker.settle().await;
    info!("cache worker stopped");
}

async fn dispatch(worker: &Arc<CacheWorker>, event: WorkerEvent) {
    match event {
        WorkerEvent::Install { reply } => {
            let result = worker.install().await;
            if let Err(e) = &result {
                error!(error = %e, "install failed");
            }
            let _ = reply.send(result);
        }
        WorkerEvent::Activate { reply } => {
            let _ = reply.send(worker.activate().await);
        }
        WorkerEvent::Fetch { request, reply } => {
            let worker = worker.clone();
            tokio::spawn(async move {
                let _ = reply.send(worker.handle_fetch(request).await);
            });
        }
        WorkerEvent::Sync { tag, reply } => {
            let worker = worker.clone();
            tokio::spawn(async move {
                let result = worker.handle_sync(&tag).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            });
        }
        WorkerEvent::PeriodicSync { tag } => {
            let worker = worker.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.handle_periodic_sync(&tag).await {
                    warn!(%tag, error = %e, "periodic sync failed");
                }
            });
        }
        WorkerEvent::Push { data } => {
            worker.handle_push(data.as_deref()).await;
        }
        WorkerEvent::NotificationClick { action, url } => {
            worker
                .handle_notification_click(action.as_deref(), &url)
                .await;
        }
    }
}
