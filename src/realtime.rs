use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinHandle},
    time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    backoff::ReconnectPolicy,
    config::RealtimeSettings,
    handlers::BuiltinHandlers,
    outbox::Outbox,
    store::{self, keys, KeyValueStore},
    subscriptions::{Callback, SubscriberId, TopicSubscriptions},
    transport::{Connection, Connector, Poller, TransportError},
    types::{
        now_millis, AppEvent, ClientToWorker, ConnectionState, ConnectionStatus, IncomingMessage,
        OutgoingMessage, Topic, TransportKind, WorkerToClient,
    },
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_BUFFER: usize = 64;

pub struct WorkerLink {
    pub to_worker: mpsc::Sender<ClientToWorker>,
    pub from_worker: mpsc::Receiver<WorkerToClient>,
}

pub struct RealtimeDeps {
    pub connector: Option<Arc<dyn Connector>>,
    pub poller: Arc<dyn Poller>,
    pub store: Arc<dyn KeyValueStore>,
    pub handlers: BuiltinHandlers,
    pub worker: Option<WorkerLink>,
}

enum Command {
    Connect {
        done: oneshot::Sender<()>,
    },
    Send {
        message: OutgoingMessage,
        reply: oneshot::Sender<bool>,
    },
    Receive {
        raw: String,
        done: oneshot::Sender<()>,
    },
    Subscribe {
        topic: Topic,
        callback: Callback,
        reply: oneshot::Sender<SubscriberId>,
    },
    Unsubscribe {
        topic: Topic,
        id: SubscriberId,
        done: oneshot::Sender<()>,
    },
    Online {
        done: oneshot::Sender<()>,
    },
    Offline,
    Background,
    Foreground {
        done: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
}

#[derive(Clone)]
pub struct RealtimeClient {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    client_id: Arc<str>,
    shutdown: CancellationToken,
}

pub struct Subscription {
    topic: Topic,
    id: SubscriberId,
    commands: mpsc::Sender<Command>,
}

impl Subscription {
    pub async fn unsubscribe(self) {
        let (done, rx) = oneshot::channel();
        let cmd = Command::Unsubscribe {
            topic: self.topic,
            id: self.id,
            done,
        };
        if self.commands.send(cmd).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl RealtimeClient {
    pub async fn start(
        settings: RealtimeSettings,
        deps: RealtimeDeps,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let client_id = match store::client_id(deps.store.as_ref()).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "client id not persisted, using ephemeral id");
                format!("client_{}", Uuid::new_v4().simple())
            }
        };
        let outbox = Outbox::restore(deps.store.clone(), settings.outbox_capacity).await;

        let (to_worker, from_worker) = match deps.worker {
            Some(link) => (Some(link.to_worker), Some(link.from_worker)),
            None => (None, None),
        };
        if let Some(worker) = &to_worker {
            let _ = worker
                .send(ClientToWorker::InitRealtime {
                    client_id: client_id.clone(),
                })
                .await;
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);

        let driver = Driver {
            policy: ReconnectPolicy::new(
                settings.reconnect_initial_delay,
                settings.reconnect_max_delay,
                settings.reconnect_max_attempts,
            ),
            heartbeat: ticker(settings.heartbeat_foreground),
            sweep: ticker(settings.queue_sweep),
            poll: ticker(settings.poll_interval),
            poll_task: None,
            settings,
            connector: deps.connector,
            poller: deps.poller,
            store: deps.store,
            handlers: deps.handlers,
            outbox,
            subscriptions: TopicSubscriptions::new(),
            client_id: client_id.clone(),
            link: Link::Down,
            reconnect_at: None,
            state: state_tx,
            commands: commands_rx,
            to_worker,
            from_worker,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(driver.run());

        let client = Self {
            commands: commands_tx,
            state: state_rx,
            client_id: Arc::from(client_id.as_str()),
            shutdown,
        };
        (client, handle)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn connect(&self) {
        self.request(|done| Command::Connect { done }).await;
    }

    /// Transmits now when possible; otherwise queues durably. Returns whether
    /// the message went out immediately.
    pub async fn send(&self, message: OutgoingMessage) -> bool {
        self.request(|reply| Command::Send { message, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn receive(&self, raw: impl Into<String>) {
        let raw = raw.into();
        self.request(|done| Command::Receive { raw, done }).await;
    }

    pub async fn subscribe(&self, topic: &str, callback: Callback) -> Subscription {
        let topic = topic.to_string();
        let id = self
            .request(|reply| Command::Subscribe {
                topic: topic.clone(),
                callback,
                reply,
            })
            .await
            .unwrap_or_else(Uuid::nil);
        Subscription {
            topic,
            id,
            commands: self.commands.clone(),
        }
    }

    pub async fn online(&self) {
        self.request(|done| Command::Online { done }).await;
    }

    pub async fn offline(&self) {
        let _ = self.commands.send(Command::Offline).await;
    }

    pub async fn background(&self) {
        let _ = self.commands.send(Command::Background).await;
    }

    pub async fn foreground(&self) {
        self.request(|done| Command::Foreground { done }).await;
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.request(|reply| Command::Status { reply })
            .await
            .unwrap_or(ConnectionStatus {
                state: ConnectionState::Closed,
                transport: TransportKind::None,
                pending: 0,
            })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn send_traffic_report(&self, data: Value) -> bool {
        self.send(OutgoingMessage::new("traffic_report", data)).await
    }

    pub async fn send_delivery_status(&self, delivery_id: &str, status: &str, extra: Value) -> bool {
        let mut payload = json!({ "deliveryId": delivery_id, "status": status });
        if let (Some(target), Value::Object(fields)) = (payload.as_object_mut(), extra) {
            target.extend(fields);
        }
        self.send(OutgoingMessage::new("delivery_status", payload))
            .await
    }

    pub async fn send_group_message(
        &self,
        group_id: &str,
        message: &str,
        sender: Option<&str>,
    ) -> bool {
        let payload = json!({
            "groupId": group_id,
            "message": message,
            "sender": sender.unwrap_or(&self.client_id),
            "timestamp": now_millis(),
        });
        self.send(OutgoingMessage::new("group_message", payload))
            .await
    }

    pub async fn send_emergency_report(&self, data: Value) -> bool {
        self.send(OutgoingMessage::new("emergency_report", data).with_priority("high"))
            .await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.ok()?;
        rx.await.ok()
    }
}

enum Link {
    Down,
    Socket(Connection),
    Polling,
}

impl Link {
    fn kind(&self) -> TransportKind {
        match self {
            Link::Down => TransportKind::None,
            Link::Socket(_) => TransportKind::Socket,
            Link::Polling => TransportKind::Polling,
        }
    }
}

struct Driver {
    settings: RealtimeSettings,
    connector: Option<Arc<dyn Connector>>,
    poller: Arc<dyn Poller>,
    store: Arc<dyn KeyValueStore>,
    handlers: BuiltinHandlers,
    outbox: Outbox,
    subscriptions: TopicSubscriptions,
    client_id: String,
    link: Link,
    policy: ReconnectPolicy,
    reconnect_at: Option<Instant>,
    heartbeat: Interval,
    sweep: Interval,
    poll: Interval,
    poll_task: Option<PollTask>,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::Receiver<Command>,
    to_worker: Option<mpsc::Sender<ClientToWorker>>,
    from_worker: Option<mpsc::Receiver<WorkerToClient>>,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let reconnect_deadline = self
                .reconnect_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                frame = next_frame(&mut self.link) => match frame {
                    Some(raw) => self.receive(&raw).await,
                    None => self.on_disconnect(),
                },

                _ = sleep_until(reconnect_deadline), if self.reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.reconnect().await;
                }

                _ = self.heartbeat.tick() => self.heartbeat().await,

                _ = self.sweep.tick() => self.drain().await,

                _ = self.poll.tick(), if matches!(self.link, Link::Polling) => self.start_poll().await,

                outcome = poll_outcome(&mut self.poll_task) => {
                    self.poll_task = None;
                    self.on_poll_outcome(outcome).await;
                }

                msg = next_worker_message(&mut self.from_worker) => match msg {
                    Some(msg) => self.on_worker_message(msg),
                    None => self.from_worker = None,
                },
            }
        }

        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.link = Link::Down;
        self.reconnect_at = None;
        self.state.send_replace(ConnectionState::Closed);
        info!("realtime client stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { done } => {
                self.connect().await;
                let _ = done.send(());
            }
            Command::Send { message, reply } => {
                let sent = self.send(message).await;
                let _ = reply.send(sent);
            }
            Command::Receive { raw, done } => {
                self.receive(&raw).await;
                let _ = done.send(());
            }
            Command::Subscribe {
                topic,
                callback,
                reply,
            } => {
                let before = self.subscriptions.subscriber_count(&topic);
                let id = self.subscriptions.subscribe(&topic, callback);
                if self.subscriptions.subscriber_count(&topic) > before {
                    self.announce("subscribe", &topic).await;
                }
                let _ = reply.send(id);
            }
            Command::Unsubscribe { topic, id, done } => {
                if self.subscriptions.unsubscribe(&topic, &id) {
                    self.announce("unsubscribe", &topic).await;
                }
                let _ = done.send(());
            }
            Command::Online { done } => {
                info!("connectivity regained");
                self.policy.reset();
                self.reconnect_at = None;
                self.connect().await;
                let _ = done.send(());
            }
            Command::Offline => {
                info!("connectivity lost");
                self.handlers.emit(AppEvent::Connection { connected: false });
            }
            Command::Background => {
                debug!("moved to background");
                self.heartbeat = ticker(self.settings.heartbeat_background);
            }
            Command::Foreground { done } => {
                debug!("moved to foreground");
                self.heartbeat = ticker(self.settings.heartbeat_foreground);
                self.drain().await;
                let _ = done.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(ConnectionStatus {
                    state: *self.state.borrow(),
                    transport: self.link.kind(),
                    pending: self.outbox.len(),
                });
            }
        }
    }

    async fn connect(&mut self) {
        if !matches!(self.link, Link::Down) {
            return;
        }
        self.reconnect_at = None;

        let Some(connector) = self.connector.clone() else {
            info!("socket unsupported, using polling");
            self.start_polling();
            return;
        };

        self.state.send_replace(ConnectionState::Connecting);
        match open_socket(connector.as_ref()).await {
            Ok(conn) => self.on_open(conn).await,
            Err(e) => {
                warn!(error = %e, "socket connection failed, using polling");
                self.start_polling();
            }
        }
    }

    async fn reconnect(&mut self) {
        let Some(connector) = self.connector.clone() else {
            return;
        };
        info!(attempt = self.policy.attempts(), "reconnecting");

        self.state.send_replace(ConnectionState::Connecting);
        match open_socket(connector.as_ref()).await {
            Ok(conn) => self.on_open(conn).await,
            Err(e) => {
                warn!(error = %e, attempt = self.policy.attempts(), "reconnect failed");
                self.state.send_replace(ConnectionState::Closed);
                self.schedule_reconnect();
            }
        }
    }

    async fn on_open(&mut self, conn: Connection) {
        info!("socket connected");
        self.link = Link::Socket(conn);
        self.policy.reset();
        self.state.send_replace(ConnectionState::Open);
        self.handlers.emit(AppEvent::Connection { connected: true });

        for topic in self.subscriptions.topics() {
            self.announce("subscribe", &topic).await;
        }
        self.drain().await;
    }

    fn start_polling(&mut self) {
        self.link = Link::Polling;
        self.poll = ticker(self.settings.poll_interval);
        self.state.send_replace(ConnectionState::Open);
        self.handlers.emit(AppEvent::Connection { connected: true });
    }

    fn on_disconnect(&mut self) {
        info!("socket disconnected");
        self.link = Link::Down;
        self.state.send_replace(ConnectionState::Closed);
        self.handlers.emit(AppEvent::Connection { connected: false });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        match self.policy.next_delay() {
            Some(delay) => {
                debug!(
                    attempt = self.policy.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                warn!(
                    attempts = self.policy.attempts(),
                    "reconnect attempts exhausted, waiting for connectivity"
                );
            }
        }
    }

    async fn send(&mut self, mut message: OutgoingMessage) -> bool {
        if message.client_id.is_none() {
            message.client_id = Some(self.client_id.clone());
        }

        if matches!(self.link, Link::Socket(_)) {
            // older queued messages go first
            self.drain().await;
            if self.outbox.is_empty() && self.transmit(&message) {
                return true;
            }
        }

        self.enqueue(message).await;
        false
    }

    fn transmit(&self, message: &OutgoingMessage) -> bool {
        let Link::Socket(conn) = &self.link else {
            return false;
        };
        match serde_json::to_string(message) {
            Ok(frame) => conn.transmit(frame),
            Err(e) => {
                error!(error = %e, kind = %message.kind, "failed to serialize message");
                false
            }
        }
    }

    async fn enqueue(&mut self, message: OutgoingMessage) {
        debug!(kind = %message.kind, "queueing message");
        self.outbox.push(message).await;
        if let Some(worker) = &self.to_worker {
            let _ = worker.try_send(ClientToWorker::MessageQueued {
                count: self.outbox.len(),
            });
        }
    }

    async fn drain(&mut self) {
        if !matches!(self.link, Link::Socket(_)) {
            return;
        }
        let mut sent = 0usize;
        while let Some(message) = self.outbox.front() {
            if !self.transmit(message) {
                break;
            }
            self.outbox.confirm_front().await;
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, remaining = self.outbox.len(), "drained queued messages");
        }
    }

    async fn announce(&mut self, kind: &str, topic: &str) {
        if matches!(self.link, Link::Socket(_)) {
            self.send(OutgoingMessage::control(kind, topic)).await;
        }
    }

    async fn heartbeat(&mut self) {
        if matches!(self.link, Link::Socket(_)) {
            self.send(OutgoingMessage::new("heartbeat", Value::Null))
                .await;
        }
    }

    async fn receive(&mut self, raw: &str) {
        match serde_json::from_str::<IncomingMessage>(raw) {
            Ok(msg) => self.dispatch(msg).await,
            Err(e) => warn!(error = %e, "dropping malformed message"),
        }
    }

    async fn dispatch(&mut self, msg: IncomingMessage) {
        self.handlers.handle(&msg).await;
        if let Some(topic) = &msg.topic {
            self.subscriptions.dispatch(topic, &msg.payload);
        }
    }

    async fn start_poll(&mut self) {
        if self.poll_task.is_some() {
            return;
        }
        let since = match self.store.get(keys::LAST_POLL_UPDATE).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "failed to read poll cursor");
                0
            }
        };

        let poller = self.poller.clone();
        self.poll_task = Some(tokio::spawn(async move {
            match tokio::time::timeout(POLL_TIMEOUT, poller.poll(since)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            }
        }));
    }

    async fn on_poll_outcome(&mut self, outcome: Result<Result<Vec<Value>, TransportError>, JoinError>) {
        let updates = match outcome {
            Ok(Ok(updates)) => updates,
            Ok(Err(e)) => {
                warn!(error = %e, "polling failed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "poll task ended abnormally");
                return;
            }
        };

        let received = updates.len();
        for update in updates {
            match serde_json::from_value::<IncomingMessage>(update) {
                Ok(msg) => self.dispatch(msg).await,
                Err(e) => warn!(error = %e, "dropping malformed update"),
            }
        }
        if received > 0 {
            if let Err(e) = self
                .store
                .set(keys::LAST_POLL_UPDATE, now_millis().to_string())
                .await
            {
                warn!(error = %e, "failed to persist poll cursor");
            }
        }
    }

    fn on_worker_message(&mut self, msg: WorkerToClient) {
        match msg {
            WorkerToClient::SyncComplete { tag, flushed } => {
                info!(%tag, flushed, "background sync completed");
                self.handlers.emit(AppEvent::SyncComplete { tag, flushed });
            }
            WorkerToClient::PushNotification(notification) => {
                self.handlers.emit(AppEvent::Notification(notification));
            }
        }
    }
}

async fn open_socket(connector: &dyn Connector) -> Result<Connection, TransportError> {
    tokio::time::timeout(CONNECT_TIMEOUT, connector.connect())
        .await
        .map_err(|_| TransportError::Timeout)?
}

async fn next_frame(link: &mut Link) -> Option<String> {
    match link {
        Link::Socket(conn) => conn.inbound.recv().await,
        _ => std::future::pending().await,
    }
}

type PollTask = JoinHandle<Result<Vec<Value>, TransportError>>;

async fn poll_outcome(
    task: &mut Option<PollTask>,
) -> Result<Result<Vec<Value>, TransportError>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn next_worker_message(
    rx: &mut Option<mpsc::Receiver<WorkerToClient>>,
) -> Option<WorkerToClient> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
