pub mod backoff;
pub mod config;
pub mod dashboard;
pub mod handlers;
pub mod outbox;
pub mod platform;
pub mod proxy;
pub mod realtime;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod types;
pub mod worker;

use std::sync::Arc;

use futures::Stream;
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Config,
    handlers::BuiltinHandlers,
    platform::{Platform, TracingPlatform},
    realtime::{RealtimeClient, RealtimeDeps, WorkerLink},
    store::{FileStore, KeyValueStore, StoreError},
    transport::{Connector, HttpPoller, Poller, WsConnector},
    types::AppEvent,
    worker::{
        cache::CacheStorage,
        fetch::{Fetcher, HttpFetcher},
        sync::{queue_offline_record, OfflineRecord, SYNC_TRAFFIC_TAG},
        CacheWorker, WorkerHandle,
    },
};

const EVENT_BUS_CAPACITY: usize = 256;
const WORKER_TO_CLIENT_BUFFER: usize = 64;

pub struct Backends {
    pub store: Arc<dyn KeyValueStore>,
    pub platform: Arc<dyn Platform>,
    pub fetcher: Arc<dyn Fetcher>,
    pub connector: Option<Arc<dyn Connector>>,
    pub poller: Arc<dyn Poller>,
}

impl Backends {
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = FileStore::open(&config.store_path).await?;
        let connector = config.realtime.socket_url.as_ref().map(|url| {
            Arc::new(WsConnector::new(url.clone(), config.realtime.ws_send_buffer))
                as Arc<dyn Connector>
        });
        Ok(Self {
            store: Arc::new(store),
            platform: Arc::new(TracingPlatform),
            fetcher: Arc::new(HttpFetcher::new()),
            connector,
            poller: Arc::new(HttpPoller::new(config.realtime.poll_url.clone())),
        })
    }
}

pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn KeyValueStore>,
    pub events: broadcast::Sender<AppEvent>,
    pub realtime: RealtimeClient,
    pub worker: WorkerHandle,
    pub shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext {
    pub async fn initialize(config: Config) -> anyhow::Result<Arc<Self>> {
        let backends = Backends::from_config(&config).await?;
        Ok(Self::assemble(config, backends).await)
    }

    pub async fn assemble(config: Config, backends: Backends) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (clients_tx, clients_rx) = mpsc::channel(WORKER_TO_CLIENT_BUFFER);

        let cache_worker = Arc::new(CacheWorker::new(
            config.worker.clone(),
            CacheStorage::new(),
            backends.fetcher,
            backends.store.clone(),
            backends.platform.clone(),
            Some(clients_tx),
        ));
        let (worker, worker_task) = worker::spawn(cache_worker, shutdown.child_token());

        let deps = RealtimeDeps {
            connector: backends.connector,
            poller: backends.poller,
            store: backends.store.clone(),
            handlers: BuiltinHandlers::new(
                events.clone(),
                backends.platform,
                backends.store.clone(),
            ),
            worker: Some(WorkerLink {
                to_worker: worker.message_port(),
                from_worker: clients_rx,
            }),
        };
        let (realtime, realtime_task) =
            RealtimeClient::start(config.realtime.clone(), deps, shutdown.child_token()).await;
        info!(client_id = realtime.client_id(), "application context ready");

        Arc::new(Self {
            config,
            store: backends.store,
            events,
            realtime,
            worker,
            shutdown,
            tasks: Mutex::new(vec![worker_task, realtime_task]),
        })
    }

    pub fn event_stream(&self) -> impl Stream<Item = AppEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "event stream lagged");
                None
            }
        })
    }

    pub async fn record_offline(&self, payload: Value) -> Result<usize, StoreError> {
        let pending = queue_offline_record(self.store.as_ref(), OfflineRecord::traffic(payload)).await?;
        info!(pending, "traffic report saved for sync");
        Ok(pending)
    }

    pub async fn online(&self) {
        self.realtime.online().await;
        if let Err(e) = self.worker.sync(SYNC_TRAFFIC_TAG).await {
            warn!(error = %e, "background sync failed");
        }
    }

    pub async fn offline(&self) {
        self.realtime.offline().await;
    }

    pub async fn teardown(&self) {
        self.realtime.shutdown();
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "task ended abnormally");
            }
        }
        info!("application context stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::{
        config::{RealtimeSettings, WorkerSettings},
        dashboard::{DashboardModule, Role, RoleDashboard},
        platform::testing::RecordingPlatform,
        store::MemoryStore,
        transport::testing::ScriptedPoller,
        worker::{fetch::testing::FakeNetwork, fetch::FetchResponse, sync::load_offline_records},
    };

    fn config(role: Role) -> Config {
        Config {
            bind_addr: "127.0.0.1:0".into(),
            store_path: String::new(),
            role,
            realtime: RealtimeSettings {
                socket_url: None,
                ..RealtimeSettings::for_origin(&crate::config::testing::origin())
            },
            worker: WorkerSettings::for_origin(crate::config::testing::origin()),
        }
    }

    async fn context(role: Role, network: Arc<FakeNetwork>, store: MemoryStore) -> Arc<AppContext> {
        AppContext::assemble(
            config(role),
            Backends {
                store: Arc::new(store),
                platform: Arc::new(RecordingPlatform::default()),
                fetcher: network,
                connector: None,
                poller: Arc::new(ScriptedPoller::default()),
            },
        )
        .await
    }

    #[tokio::test]
    async fn dashboard_folds_live_topic_payloads() {
        let ctx = context(Role::CabDriver, Arc::new(FakeNetwork::default()), MemoryStore::new()).await;
        let mut dashboard = RoleDashboard::new(Role::CabDriver).with_feed_period(Duration::from_secs(3600));
        dashboard.init(&ctx).await.unwrap();

        ctx.realtime
            .receive(r#"{"type":"ride_request","topic":"rides","payload":{"rideId":"R1"}}"#)
            .await;
        ctx.realtime
            .receive(r#"{"type":"ride_request","topic":"traffic","payload":{"rideId":"R2"}}"#)
            .await;

        let state = dashboard.render_state();
        assert_eq!(state["live"], json!([{ "rideId": "R1" }]));

        dashboard.teardown().await;
        ctx.realtime
            .receive(r#"{"type":"ride_request","topic":"rides","payload":{"rideId":"R3"}}"#)
            .await;
        assert_eq!(dashboard.render_state()["live"].as_array().unwrap().len(), 1);

        ctx.teardown().await;
    }

    #[tokio::test]
    async fn dashboard_restores_saved_state() {
        let store = MemoryStore::new();
        store::save_json(&store, "smartroads_emergency", &json!({ "emergencies": [{ "id": "EMG-1" }] }))
            .await
            .unwrap();
        let ctx = context(Role::Emergency, Arc::new(FakeNetwork::default()), store).await;

        let mut dashboard = RoleDashboard::new(Role::Emergency);
        dashboard.init(&ctx).await.unwrap();
        assert_eq!(dashboard.render_state()["emergencies"][0]["id"], "EMG-1");

        dashboard.teardown().await;
        ctx.teardown().await;
    }

    #[tokio::test]
    async fn offline_reports_flush_when_back_online() {
        let network = Arc::new(FakeNetwork::default());
        network.route_response(
            "http://localhost:8080/api/traffic/update",
            FetchResponse::new(StatusCode::OK, None, ""),
        );
        let store = MemoryStore::new();
        let ctx = context(Role::Commuter, network.clone(), store.clone()).await;
        let mut events = Box::pin(ctx.event_stream());

        assert_eq!(ctx.record_offline(json!({ "road": "A1" })).await.unwrap(), 1);
        assert_eq!(ctx.record_offline(json!({ "road": "B2" })).await.unwrap(), 2);

        ctx.online().await;

        assert!(load_offline_records(&store).await.unwrap().is_empty());
        assert_eq!(
            network.requests_to("http://localhost:8080/api/traffic/update"),
            2
        );
        loop {
            match events.next().await {
                Some(AppEvent::SyncComplete { flushed, .. }) => {
                    assert_eq!(flushed, 2);
                    break;
                }
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }

        ctx.teardown().await;
    }

    #[tokio::test]
    async fn worker_reports_its_version() {
        let ctx = context(Role::Delivery, Arc::new(FakeNetwork::default()), MemoryStore::new()).await;
        assert_eq!(ctx.worker.version().await.as_deref(), Some("1.0.0"));
        ctx.teardown().await;
    }

    #[tokio::test]
    async fn push_reaches_the_event_bus() {
        let ctx = context(Role::Commuter, Arc::new(FakeNetwork::default()), MemoryStore::new()).await;
        let mut events = Box::pin(ctx.event_stream());

        ctx.worker
            .push(Some(axum::body::Bytes::from_static(br#"{"title":"Accident on A1"}"#)))
            .await;

        loop {
            match events.next().await {
                Some(AppEvent::Notification(n)) => {
                    assert_eq!(n.title, "Accident on A1");
                    break;
                }
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }

        ctx.teardown().await;
    }
}
