use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, Url};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connection attempt timed out")]
    Timeout,
}

pub struct Connection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

impl Connection {
    /// Hands a frame to the link without waiting; false when the link is
    /// closed or its buffer is full.
    pub fn transmit(&self, frame: String) -> bool {
        self.outbound.try_send(frame).is_ok()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;
}

#[async_trait]
pub trait Poller: Send + Sync {
    async fn poll(&self, since: i64) -> Result<Vec<Value>, TransportError>;
}

pub struct WsConnector {
    url: String,
    buffer: usize,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, buffer: usize) -> Self {
        Self {
            url: url.into(),
            buffer,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut ws_sink, mut ws_stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<String>(self.buffer);

        let send_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(frame.into())).await {
                    warn!(error = %e, "socket send failed");
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "socket closed by server");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "socket read failed");
                        break;
                    }
                }
            }
            send_task.abort();
        });

        debug!(url = %self.url, "socket connected");
        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

pub struct HttpPoller {
    client: Client,
    endpoint: Url,
}

impl HttpPoller {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Poller for HttpPoller {
    async fn poll(&self, since: i64) -> Result<Vec<Value>, TransportError> {
        let updates = self
            .client
            .get(self.endpoint.clone())
            .query(&[("since", since)])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Value>>()
            .await?;
        Ok(updates)
    }
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;

    pub struct RemoteEnd {
        pub to_client: mpsc::Sender<String>,
        pub from_client: mpsc::Receiver<String>,
    }

    impl RemoteEnd {
        pub fn drain(&mut self) -> Vec<Value> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.from_client.try_recv() {
                frames.push(serde_json::from_str(&frame).unwrap());
            }
            frames
        }
    }

    pub fn pair() -> (Connection, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::channel(256);
        let (in_tx, in_rx) = mpsc::channel(256);
        (
            Connection {
                outbound: out_tx,
                inbound: in_rx,
            },
            RemoteEnd {
                to_client: in_tx,
                from_client: out_rx,
            },
        )
    }

    #[derive(Default)]
    pub struct ScriptedConnector {
        pub script: Mutex<VecDeque<Connection>>,
        pub attempts: AtomicUsize,
    }

    impl ScriptedConnector {
        pub fn push(&self) -> RemoteEnd {
            let (conn, remote) = pair();
            self.script.lock().unwrap().push_back(conn);
            remote
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Connection, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Refused("no server".into()))
        }
    }

    #[derive(Default)]
    pub struct ScriptedPoller {
        pub batches: Mutex<VecDeque<Vec<Value>>>,
        pub calls: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Poller for ScriptedPoller {
        async fn poll(&self, since: i64) -> Result<Vec<Value>, TransportError> {
            self.calls.lock().unwrap().push(since);
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
        }
    }
}
