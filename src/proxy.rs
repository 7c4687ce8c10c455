use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use reqwest::Url;
use tracing::{debug, warn};

use crate::worker::{
    fetch::{FetchRequest, RequestMode},
    WorkerError, WorkerHandle,
};

const MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Clone)]
pub struct ProxyState {
    pub worker: WorkerHandle,
    pub origin: Url,
}

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Worker(WorkerError::Unavailable) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Worker(_) => StatusCode::BAD_GATEWAY,
        };
        warn!(%status, error = %self, "request failed");
        (status, self.to_string()).into_response()
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .fallback(intercept)
        .with_state(state)
}

async fn intercept(
    State(state): State<ProxyState>,
    req: Request,
) -> Result<Response, GatewayError> {
    let (parts, body) = req.into_parts();

    let url = match parts.uri.scheme() {
        Some(_) => Url::parse(&parts.uri.to_string()),
        None => {
            let path = parts
                .uri
                .path_and_query()
                .map(|p| p.as_str())
                .unwrap_or("/");
            state.origin.join(path)
        }
    }
    .map_err(|e| GatewayError::BadRequest(e.to_string()))?;

    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::BadRequest(e.to_string()))?;

    let request = FetchRequest {
        method: parts.method,
        url,
        accept: header_str(&parts.headers, header::ACCEPT),
        content_type: header_str(&parts.headers, header::CONTENT_TYPE),
        mode: request_mode(&parts.headers),
        body,
    };
    debug!(method = %request.method, url = %request.url, "intercepted");

    let resp = state.worker.fetch(request).await?;

    let mut builder = Response::builder().status(resp.status);
    if let Some(content_type) = &resp.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(resp.body))
        .map_err(|e| GatewayError::BadRequest(e.to_string()))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn request_mode(headers: &HeaderMap) -> RequestMode {
    match headers.get("sec-fetch-mode").and_then(|v| v.to_str().ok()) {
        Some("navigate") => RequestMode::Navigate,
        Some("cors") => RequestMode::Cors,
        Some("no-cors") => RequestMode::NoCors,
        _ => RequestMode::SameOrigin,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::WorkerSettings,
        platform::testing::RecordingPlatform,
        store::MemoryStore,
        worker::{self, cache::CacheStorage, fetch::testing::FakeNetwork, CacheWorker},
    };

    fn proxy(network: Arc<FakeNetwork>) -> (Router, CancellationToken) {
        let settings = WorkerSettings {
            manifest: vec!["/offline.html".into()],
            ..WorkerSettings::for_origin(crate::config::testing::origin())
        };
        let origin = settings.origin.clone();
        let worker = Arc::new(CacheWorker::new(
            settings,
            CacheStorage::new(),
            network,
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingPlatform::default()),
            None,
        ));
        let shutdown = CancellationToken::new();
        let (handle, _task) = worker::spawn(worker, shutdown.clone());
        (
            router(ProxyState {
                worker: handle,
                origin,
            }),
            shutdown,
        )
    }

    async fn body_text(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), MAX_BODY_BYTES).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn healthz() {
        let (app, _shutdown) = proxy(Arc::new(FakeNetwork::default()));
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_request_offline_returns_offline_json() {
        let network = Arc::new(FakeNetwork::default());
        network.set_offline(true);
        let (app, _shutdown) = proxy(network);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/traffic/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(body["status"], "offline");
    }

    #[tokio::test]
    async fn navigation_header_selects_offline_page() {
        let network = Arc::new(FakeNetwork::default());
        network.route("http://localhost:8080/offline.html", "offline page");
        let (app, _shutdown) = proxy(network.clone());

        // warm the cache through a static fetch first
        let warm = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/offline.html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_text(warm).await, "offline page");

        network.set_offline(true);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/modules/delivery.html")
                    .header("sec-fetch-mode", "navigate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(body_text(resp).await, "offline page");
    }

    #[tokio::test]
    async fn pass_through_failure_is_bad_gateway() {
        let network = Arc::new(FakeNetwork::default());
        network.set_offline(true);
        let (app, _shutdown) = proxy(network);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/traffic/update")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn stopped_worker_is_unavailable() {
        let (app, shutdown) = proxy(Arc::new(FakeNetwork::default()));
        shutdown.cancel();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
