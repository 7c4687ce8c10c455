use async_trait::async_trait;
use tracing::info;

use crate::types::Notification;

#[async_trait]
pub trait Platform: Send + Sync {
    async fn show_notification(&self, notification: &Notification);
    async fn open_window(&self, url: &str);
}

pub struct TracingPlatform;

#[async_trait]
impl Platform for TracingPlatform {
    async fn show_notification(&self, notification: &Notification) {
        info!(
            title = %notification.title,
            body = %notification.body,
            url = %notification.url,
            "notification"
        );
    }

    async fn open_window(&self, url: &str) {
        info!(%url, "open window");
    }
}
