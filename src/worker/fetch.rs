use async_trait::async_trait;
use axum::{
    body::Bytes,
    http::{header, Method, StatusCode},
};
use reqwest::{Client, Url};
use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("network unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    Cors,
    NoCors,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub accept: Option<String>,
    pub content_type: Option<String>,
    pub mode: RequestMode,
    pub body: Bytes,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            accept: None,
            content_type: None,
            mode: RequestMode::SameOrigin,
            body: Bytes::new(),
        }
    }

    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            accept: Some("text/html".into()),
            ..Self::get(url)
        }
    }

    pub fn post_json(url: Url, payload: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: Method::POST,
            content_type: Some("application/json".into()),
            body: Bytes::from(serde_json::to_vec(payload)?),
            ..Self::get(url)
        })
    }

    pub fn with_accept(mut self, accept: &str) -> Self {
        self.accept = Some(accept.to_string());
        self
    }

    pub fn accepts_image(&self) -> bool {
        self.accept.as_deref().is_some_and(|a| a.contains("image"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn new(status: StatusCode, content_type: Option<&str>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: content_type.map(String::from),
            body: body.into(),
        }
    }

    pub fn json(status: StatusCode, value: &Value) -> Self {
        Self::new(status, Some("application/json"), value.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        if let Some(accept) = &request.accept {
            builder = builder.header(header::ACCEPT, accept);
        }
        if let Some(content_type) = &request.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = resp.bytes().await?;

        Ok(FetchResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    use super::*;

    #[derive(Default)]
    pub struct FakeNetwork {
        pub routes: Mutex<HashMap<String, FetchResponse>>,
        pub requests: Mutex<Vec<(Method, String)>>,
        pub offline: AtomicBool,
    }

    impl FakeNetwork {
        pub fn route(&self, url: &str, body: &str) {
            self.routes.lock().unwrap().insert(
                url.to_string(),
                FetchResponse::new(StatusCode::OK, Some("text/plain"), body.to_string()),
            );
        }

        pub fn route_response(&self, url: &str, response: FetchResponse) {
            self.routes.lock().unwrap().insert(url.to_string(), response);
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        pub fn requests_to(&self, url: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, u)| u == url)
                .count()
        }
    }

    #[async_trait]
    impl Fetcher for FakeNetwork {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            let url = request.url.to_string();
            self.requests
                .lock()
                .unwrap()
                .push((request.method.clone(), url.clone()));
            if self.offline.load(Ordering::SeqCst) {
                return Err(FetchError::Unreachable(url));
            }
            Ok(self
                .routes
                .lock()
                .unwrap()
                .get(&url)
                .cloned()
                .unwrap_or_else(|| FetchResponse::new(StatusCode::NOT_FOUND, None, "")))
        }
    }
}
