use std::sync::Arc;

use axum::http::Method;
use dashmap::DashMap;
use reqwest::Url;

use super::fetch::{FetchRequest, FetchResponse};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: Method,
    pub url: Arc<str>,
}

impl RequestKey {
    pub fn of(request: &FetchRequest) -> Self {
        Self {
            method: request.method.clone(),
            url: Arc::from(request.url.as_str()),
        }
    }

    pub fn get(url: &Url) -> Self {
        Self {
            method: Method::GET,
            url: Arc::from(url.as_str()),
        }
    }
}

#[derive(Default)]
pub struct Cache {
    entries: DashMap<RequestKey, FetchResponse>,
}

impl Cache {
    pub fn get(&self, key: &RequestKey) -> Option<FetchResponse> {
        self.entries.get(key).map(|r| r.value().clone())
    }

    pub fn put(&self, key: RequestKey, response: FetchResponse) {
        self.entries.insert(key, response);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct CacheStorage {
    generations: Arc<DashMap<Arc<str>, Arc<Cache>>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: &str) -> Arc<Cache> {
        self.generations
            .entry(Arc::from(name))
            .or_default()
            .value()
            .clone()
    }

    pub fn has(&self, name: &str) -> bool {
        self.generations.contains_key(name)
    }

    pub fn delete(&self, name: &str) -> bool {
        self.generations.remove(name).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .generations
            .iter()
            .map(|r| r.key().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn match_request(&self, key: &RequestKey) -> Option<FetchResponse> {
        self.generations.iter().find_map(|r| r.value().get(key))
    }
}
