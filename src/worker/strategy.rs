use axum::http::{Method, StatusCode};
use reqwest::Url;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    cache::RequestKey,
    fetch::{FetchError, FetchRequest, FetchResponse, RequestMode},
    CacheWorker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    PassThrough,
    Api,
    Navigation,
    StaticAsset,
}

pub fn classify(request: &FetchRequest, origin: &Url) -> RequestClass {
    if request.method != Method::GET {
        return RequestClass::PassThrough;
    }
    if request.url.origin() != origin.origin() {
        return RequestClass::PassThrough;
    }
    if request.url.path().contains("/api/") {
        return RequestClass::Api;
    }
    if request.mode == RequestMode::Navigate {
        return RequestClass::Navigation;
    }
    RequestClass::StaticAsset
}

pub fn offline_api_response() -> FetchResponse {
    FetchResponse::json(
        StatusCode::OK,
        &json!({
            "status": "offline",
            "message": "You are offline. Data may be outdated.",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}

const OFFLINE_IMAGE: &str = concat!(
    r#"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="150" viewBox="0 0 200 150">"#,
    r##"<rect width="200" height="150" fill="#f0f0f0"/>"##,
    r##"<text x="100" y="75" text-anchor="middle" fill="#666" font-family="Arial" font-size="14">"##,
    "Image not available offline</text></svg>"
);

pub fn offline_image_response() -> FetchResponse {
    FetchResponse::new(StatusCode::OK, Some("image/svg+xml"), OFFLINE_IMAGE)
}

pub fn offline_text_response() -> FetchResponse {
    FetchResponse::new(
        StatusCode::SERVICE_UNAVAILABLE,
        Some("text/plain"),
        "Offline",
    )
}

impl CacheWorker {
    pub async fn handle_fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        match classify(&request, &self.settings.origin) {
            RequestClass::PassThrough => self.fetcher.fetch(&request).await,
            RequestClass::Api => Ok(self.network_or_placeholder(&request).await),
            RequestClass::Navigation => Ok(self.network_then_cache(&request).await),
            RequestClass::StaticAsset => Ok(self.cache_then_network(request).await),
        }
    }

    async fn network_or_placeholder(&self, request: &FetchRequest) -> FetchResponse {
        match self.fetcher.fetch(request).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(url = %request.url, error = %e, "api request failed, serving offline data");
                offline_api_response()
            }
        }
    }

    async fn network_then_cache(&self, request: &FetchRequest) -> FetchResponse {
        let key = RequestKey::of(request);
        match self.fetcher.fetch(request).await {
            Ok(resp) => {
                if resp.is_success() {
                    self.current_cache().put(key, resp.clone());
                }
                resp
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "navigation offline, trying cache");
                if let Some(cached) = self.caches.match_request(&key) {
                    return cached;
                }
                self.settings
                    .origin
                    .join(&self.settings.offline_page)
                    .ok()
                    .and_then(|url| self.caches.match_request(&RequestKey::get(&url)))
                    .unwrap_or_else(offline_text_response)
            }
        }
    }

    async fn cache_then_network(&self, request: FetchRequest) -> FetchResponse {
        let key = RequestKey::of(&request);

        if let Some(cached) = self.caches.match_request(&key) {
            self.revalidate(request, key);
            return cached;
        }

        match self.fetcher.fetch(&request).await {
            Ok(resp) => {
                if resp.status == StatusCode::OK {
                    self.current_cache().put(key, resp.clone());
                }
                resp
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "asset unavailable");
                if request.accepts_image() {
                    offline_image_response()
                } else {
                    offline_text_response()
                }
            }
        }
    }

    fn revalidate(&self, request: FetchRequest, key: RequestKey) {
        let fetcher = self.fetcher.clone();
        let cache = self.current_cache();
        self.background.spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(resp) if resp.is_success() => cache.put(key, resp),
                Ok(resp) => debug!(url = %request.url, status = %resp.status, "revalidation skipped"),
                Err(e) => debug!(url = %request.url, error = %e, "failed to update cache"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("http://localhost:8080").unwrap()
    }

    fn at(path: &str) -> Url {
        origin().join(path).unwrap()
    }

    #[test]
    fn classification_table() {
        let post = FetchRequest::post_json(at("/api/traffic/update"), &json!({})).unwrap();
        assert_eq!(classify(&post, &origin()), RequestClass::PassThrough);

        let cdn = FetchRequest::get(Url::parse("https://unpkg.com/leaflet.js").unwrap());
        assert_eq!(classify(&cdn, &origin()), RequestClass::PassThrough);

        let api = FetchRequest::get(at("/api/traffic/latest"));
        assert_eq!(classify(&api, &origin()), RequestClass::Api);

        let page = FetchRequest::navigate(at("/modules/delivery.html"));
        assert_eq!(classify(&page, &origin()), RequestClass::Navigation);

        let asset = FetchRequest::get(at("/assets/css/style.css"));
        assert_eq!(classify(&asset, &origin()), RequestClass::StaticAsset);
    }

    #[test]
    fn placeholder_image_is_svg() {
        let resp = offline_image_response();
        assert_eq!(resp.content_type.as_deref(), Some("image/svg+xml"));
        assert!(resp.text().starts_with("<svg"));
    }
}
