use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

pub type Topic = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    None,
    Socket,
    Polling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub transport: TransportKind,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<Topic>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

impl OutgoingMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            topic: None,
            payload,
            client_id: None,
            timestamp: now_millis(),
            priority: None,
        }
    }

    pub fn control(kind: &str, topic: &str) -> Self {
        Self {
            topic: Some(topic.to_string()),
            ..Self::new(kind, Value::Null)
        }
    }

    pub fn with_priority(mut self, priority: &str) -> Self {
        self.priority = Some(priority.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub topic: Option<Topic>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    TrafficUpdate,
    EmergencyAlert,
    DeliveryUpdate,
    GroupUpdate,
    SystemNotification,
    Pong,
    Other(String),
}

impl From<&str> for MessageKind {
    fn from(kind: &str) -> Self {
        match kind {
            "traffic_update" => Self::TrafficUpdate,
            "emergency_alert" => Self::EmergencyAlert,
            "delivery_update" => Self::DeliveryUpdate,
            "group_update" => Self::GroupUpdate,
            "system_notification" => Self::SystemNotification,
            "pong" => Self::Pong,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub url: String,
    #[serde(default)]
    pub require_interaction: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vibrate: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NotificationAction>,
}

pub const DEFAULT_ICON: &str = "/assets/icons/icon-192.png";

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            icon: DEFAULT_ICON.into(),
            badge: None,
            tag: None,
            url: url.into(),
            require_interaction: false,
            vibrate: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn tagged(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug)]
pub enum ClientToWorker {
    InitRealtime { client_id: String },
    MessageQueued { count: usize },
    SkipWaiting,
    GetVersion { reply: oneshot::Sender<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerToClient {
    SyncComplete { tag: String, flushed: usize },
    PushNotification(Notification),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Connection { connected: bool },
    TrafficUpdate(Value),
    EmergencyAlert(Value),
    DeliveryUpdate(Value),
    GroupUpdate(Value),
    Notification(Notification),
    Message { kind: String, payload: Value },
    SyncComplete { tag: String, flushed: usize },
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
