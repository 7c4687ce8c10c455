use std::time::Duration;

use anyhow::Context;
use reqwest::Url;

use crate::dashboard::Role;

#[derive(Clone, Debug)]
pub struct RealtimeSettings {
    pub socket_url: Option<String>,
    pub poll_url: Url,
    pub reconnect_max_attempts: u32,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub heartbeat_foreground: Duration,
    pub heartbeat_background: Duration,
    pub queue_sweep: Duration,
    pub poll_interval: Duration,
    pub outbox_capacity: usize,
    pub ws_send_buffer: usize,
}

impl RealtimeSettings {
    pub fn for_origin(origin: &Url) -> Self {
        Self {
            socket_url: Some(socket_url_for(origin)),
            poll_url: poll_url_for(origin),
            reconnect_max_attempts: 5,
            reconnect_initial_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(10_000),
            heartbeat_foreground: Duration::from_secs(30),
            heartbeat_background: Duration::from_secs(60),
            queue_sweep: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(5000),
            outbox_capacity: 100,
            ws_send_buffer: 64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub version: String,
    pub origin: Url,
    pub manifest: Vec<String>,
    pub offline_page: String,
}

impl WorkerSettings {
    pub fn for_origin(origin: Url) -> Self {
        Self {
            version: "1.0.0".into(),
            origin,
            manifest: default_manifest(),
            offline_page: "/offline.html".into(),
        }
    }

    pub fn cache_name(&self) -> String {
        format!("smart-roads-v{}", self.version)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub store_path: String,
    pub role: Role,
    pub realtime: RealtimeSettings,
    pub worker: WorkerSettings,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("SMARTROADS_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".into());
        let origin: Url = std::env::var("SMARTROADS_ORIGIN")
            .unwrap_or_else(|_| DEFAULT_ORIGIN.into())
            .parse()
            .context("SMARTROADS_ORIGIN must be an absolute URL")?;
        let socket_disabled: bool = std::env::var("SMARTROADS_SOCKET_DISABLED")
            .unwrap_or_else(|_| "false".into())
            .parse()
            .context("SMARTROADS_SOCKET_DISABLED must be true or false")?;
        let socket_url = match std::env::var("SMARTROADS_SOCKET_URL") {
            _ if socket_disabled => None,
            Ok(url) => Some(url),
            Err(_) => Some(socket_url_for(&origin)),
        };
        let store_path = std::env::var("SMARTROADS_STORE_PATH")
            .unwrap_or_else(|_| "smartroads-store.json".into());
        let version =
            std::env::var("SMARTROADS_CACHE_VERSION").unwrap_or_else(|_| "1.0.0".into());
        let role = std::env::var("SMARTROADS_ROLE")
            .unwrap_or_else(|_| "commuter".into())
            .parse()
            .context("SMARTROADS_ROLE must be commuter, cab_driver, delivery or emergency")?;

        let reconnect_max_attempts = std::env::var("RECONNECT_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "5".into())
            .parse()
            .context("RECONNECT_MAX_ATTEMPTS must be a number")?;
        let reconnect_initial_delay_ms: u64 = std::env::var("RECONNECT_INITIAL_DELAY_MS")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .context("RECONNECT_INITIAL_DELAY_MS must be a number")?;
        let reconnect_max_delay_ms: u64 = std::env::var("RECONNECT_MAX_DELAY_MS")
            .unwrap_or_else(|_| "10000".into())
            .parse()
            .context("RECONNECT_MAX_DELAY_MS must be a number")?;
        let heartbeat_foreground_secs: u64 = std::env::var("HEARTBEAT_FOREGROUND_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .context("HEARTBEAT_FOREGROUND_SECS must be a number")?;
        let heartbeat_background_secs: u64 = std::env::var("HEARTBEAT_BACKGROUND_SECS")
            .unwrap_or_else(|_| "60".into())
            .parse()
            .context("HEARTBEAT_BACKGROUND_SECS must be a number")?;
        let queue_sweep_ms: u64 = std::env::var("QUEUE_SWEEP_MS")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .context("QUEUE_SWEEP_MS must be a number")?;
        let poll_interval_ms: u64 = std::env::var("POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "5000".into())
            .parse()
            .context("POLL_INTERVAL_MS must be a number")?;
        let outbox_capacity = std::env::var("OUTBOX_CAPACITY")
            .unwrap_or_else(|_| "100".into())
            .parse()
            .context("OUTBOX_CAPACITY must be a number")?;
        let ws_send_buffer = std::env::var("WS_SEND_BUFFER")
            .unwrap_or_else(|_| "64".into())
            .parse()
            .context("WS_SEND_BUFFER must be a number")?;

        let realtime = RealtimeSettings {
            socket_url,
            poll_url: poll_url_for(&origin),
            reconnect_max_attempts,
            reconnect_initial_delay: Duration::from_millis(reconnect_initial_delay_ms),
            reconnect_max_delay: Duration::from_millis(reconnect_max_delay_ms),
            heartbeat_foreground: Duration::from_secs(heartbeat_foreground_secs),
            heartbeat_background: Duration::from_secs(heartbeat_background_secs),
            queue_sweep: Duration::from_millis(queue_sweep_ms),
            poll_interval: Duration::from_millis(poll_interval_ms),
            outbox_capacity,
            ws_send_buffer,
        };

        let worker = WorkerSettings {
            version,
            ..WorkerSettings::for_origin(origin)
        };

        Ok(Self {
            bind_addr,
            store_path,
            role,
            realtime,
            worker,
        })
    }
}

pub const DEFAULT_ORIGIN: &str = "http://localhost:8080";

/// `ws://host/ws` for http origins, `wss://host/ws` for https ones.
pub fn socket_url_for(origin: &Url) -> String {
    let scheme = if origin.scheme() == "https" { "wss" } else { "ws" };
    let host = origin.host_str().unwrap_or("localhost");
    match origin.port() {
        Some(port) => format!("{scheme}://{host}:{port}/ws"),
        None => format!("{scheme}://{host}/ws"),
    }
}

fn poll_url_for(origin: &Url) -> Url {
    origin.join("/api/poll").unwrap_or_else(|_| origin.clone())
}

fn default_manifest() -> Vec<String> {
    [
        "/",
        "/index.html",
        "/manifest.json",
        "/assets/css/style.css",
        "/assets/css/pwa.css",
        "/assets/js/app.js",
        "/assets/js/maps.js",
        "/modules/commuters.html",
        "/modules/delivery.html",
        "/modules/cab-drivers.html",
        "/modules/emergency.html",
        "https://unpkg.com/leaflet@1.9.4/dist/leaflet.css",
        "https://unpkg.com/leaflet@1.9.4/dist/leaflet.js",
        "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.0/css/all.min.css",
        "https://fonts.googleapis.com/css2?family=Inter:wght@300;400;500;600;700&display=swap",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
