use tracing::{debug, warn};

use super::CacheWorker;
use crate::types::{Notification, NotificationAction, PushPayload, WorkerToClient, DEFAULT_ICON};

const BADGE: &str = "/assets/icons/icon-72.png";

pub fn notification_from_push(data: Option<&[u8]>) -> Notification {
    let payload = match data {
        Some(bytes) => serde_json::from_slice::<PushPayload>(bytes).unwrap_or_else(|e| {
            warn!(error = %e, "unreadable push payload");
            PushPayload::default()
        }),
        None => PushPayload::default(),
    };

    Notification {
        title: payload.title.unwrap_or_else(|| "Smart Roads".into()),
        body: payload
            .body
            .unwrap_or_else(|| "Smart Roads Notification".into()),
        icon: payload.icon.unwrap_or_else(|| DEFAULT_ICON.into()),
        badge: Some(BADGE.into()),
        tag: None,
        url: payload.url.unwrap_or_else(|| "/".into()),
        require_interaction: false,
        vibrate: vec![100, 50, 100],
        actions: vec![
            NotificationAction {
                action: "open".into(),
                title: "Open App".into(),
            },
            NotificationAction {
                action: "close".into(),
                title: "Close".into(),
            },
        ],
    }
}

impl CacheWorker {
    pub async fn handle_push(&self, data: Option<&[u8]>) -> Notification {
        let notification = notification_from_push(data);
        self.platform.show_notification(&notification).await;

        if let Some(clients) = &self.clients {
            let _ = clients
                .send(WorkerToClient::PushNotification(notification.clone()))
                .await;
        }
        notification
    }

    pub async fn handle_notification_click(&self, action: Option<&str>, url: &str) -> bool {
        if action == Some("open") {
            self.platform.open_window(url).await;
            return true;
        }
        debug!(?action, "notification closed");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_fields_override_defaults() {
        let n = notification_from_push(Some(
            br#"{"title":"Road closed","body":"Main St","url":"/modules/commuters.html"}"#.as_slice(),
        ));
        assert_eq!(n.title, "Road closed");
        assert_eq!(n.body, "Main St");
        assert_eq!(n.url, "/modules/commuters.html");
        assert_eq!(n.icon, DEFAULT_ICON);
        assert_eq!(n.actions[0].action, "open");
    }

    #[test]
    fn malformed_payload_uses_defaults() {
        let n = notification_from_push(Some(b"not json".as_slice()));
        assert_eq!(n.title, "Smart Roads");
        assert_eq!(n.body, "Smart Roads Notification");
        assert_eq!(n.url, "/");
    }
}
