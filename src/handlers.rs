use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    platform::Platform,
    store::{self, keys, KeyValueStore},
    types::{now_millis, AppEvent, IncomingMessage, MessageKind, Notification},
};

pub struct BuiltinHandlers {
    events: broadcast::Sender<AppEvent>,
    platform: Arc<dyn Platform>,
    store: Arc<dyn KeyValueStore>,
}

impl BuiltinHandlers {
    pub fn new(
        events: broadcast::Sender<AppEvent>,
        platform: Arc<dyn Platform>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            events,
            platform,
            store,
        }
    }

    pub async fn handle(&self, msg: &IncomingMessage) {
        match MessageKind::from(msg.kind.as_str()) {
            MessageKind::TrafficUpdate => self.traffic_update(&msg.payload).await,
            MessageKind::EmergencyAlert => {
                self.emit(AppEvent::EmergencyAlert(msg.payload.clone()));
                let body = text(&msg.payload, "message")
                    .unwrap_or("Emergency reported in your area")
                    .to_string();
                let mut notification =
                    Notification::new("Emergency Alert", body, "/modules/emergency.html")
                        .tagged("emergency-alert");
                notification.require_interaction = true;
                self.notify(notification).await;
            }
            MessageKind::DeliveryUpdate => {
                self.emit(AppEvent::DeliveryUpdate(msg.payload.clone()));
            }
            MessageKind::GroupUpdate => {
                self.emit(AppEvent::GroupUpdate(msg.payload.clone()));
            }
            MessageKind::SystemNotification => {
                let title = text(&msg.payload, "title").unwrap_or("Smart Roads Notification");
                let body = text(&msg.payload, "message").unwrap_or_default();
                let url = text(&msg.payload, "url").unwrap_or("/");
                let notification =
                    Notification::new(title, body, url).tagged("system-notification");
                self.notify(notification).await;
            }
            MessageKind::Pong => {}
            MessageKind::Other(kind) => debug!(%kind, "no built-in handler"),
        }

        self.emit(AppEvent::Message {
            kind: msg.kind.clone(),
            payload: msg.payload.clone(),
        });
    }

    async fn traffic_update(&self, data: &Value) {
        self.emit(AppEvent::TrafficUpdate(data.clone()));

        let snapshot = json!({ "data": data, "timestamp": now_millis() });
        if let Err(e) =
            store::save_json(self.store.as_ref(), keys::LAST_TRAFFIC_UPDATE, &snapshot).await
        {
            warn!(error = %e, "failed to persist traffic update");
        }

        let significant =
            text(data, "severity") == Some("high") || text(data, "type") == Some("accident");
        if significant {
            let body = format!(
                "{}: {}",
                text(data, "location").unwrap_or("Unknown location"),
                text(data, "description").unwrap_or_default()
            );
            let notification =
                Notification::new("Traffic Update", body, "/").tagged("traffic-update");
            self.notify(notification).await;
        }
    }

    pub async fn notify(&self, notification: Notification) {
        self.platform.show_notification(&notification).await;
        self.emit(AppEvent::Notification(notification));
    }

    pub fn emit(&self, event: AppEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

fn text<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}
