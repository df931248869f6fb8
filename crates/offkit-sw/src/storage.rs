//! Origin-scoped cache store.
//!
//! The host runtime owns persistence; the worker only sees [`CacheStore`].
//! Entries live in exactly one namespace and are only ever removed together
//! with it.

use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use offkit_net::Response;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::error::SwResult;

// ==================== Entries ====================

/// Stored copy of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    /// Final response URL, if the response came from the network.
    pub url: Option<String>,

    /// Response status.
    pub status: u16,

    /// Response headers in order; repeated names keep every value.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl ResponseSnapshot {
    /// Copy a response for storage.
    pub fn capture(response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: response.url.as_ref().map(|u| u.to_string()),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response from the stored copy.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Response {
            url: self.url.as_deref().and_then(|u| Url::parse(u).ok()),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: self.body.clone().into(),
        }
    }
}

/// A request key paired with its stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub request_key: String,
    pub response: ResponseSnapshot,
}

impl CachedEntry {
    pub fn new(request_key: impl Into<String>, response: &Response) -> Self {
        Self {
            request_key: request_key.into(),
            response: ResponseSnapshot::capture(response),
        }
    }
}

// ==================== Store ====================

/// The host's persistent request→response store.
///
/// `put_all` must be all-or-nothing; a single `put` is atomic on its own.
pub trait CacheStore: Send + Sync {
    /// Look up an entry in one namespace.
    fn lookup<'a>(
        &'a self,
        namespace: &'a str,
        request_key: &'a str,
    ) -> BoxFuture<'a, SwResult<Option<CachedEntry>>>;

    /// Insert or overwrite an entry, creating the namespace if needed.
    fn put<'a>(&'a self, namespace: &'a str, entry: CachedEntry) -> BoxFuture<'a, SwResult<()>>;

    /// Insert several entries as one unit.
    fn put_all<'a>(
        &'a self,
        namespace: &'a str,
        entries: Vec<CachedEntry>,
    ) -> BoxFuture<'a, SwResult<()>>;

    /// Names of every existing namespace.
    fn namespaces(&self) -> BoxFuture<'_, SwResult<Vec<String>>>;

    /// Delete a namespace and all of its entries.
    fn delete_namespace<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, SwResult<bool>>;

    /// Request keys stored in a namespace.
    fn entry_keys<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, SwResult<Vec<String>>>;
}

/// A single namespace held in memory.
#[derive(Debug, Default)]
pub struct Cache {
    /// Namespace name.
    pub name: String,

    entries: HashMap<String, CachedEntry>,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn match_request(&self, request_key: &str) -> Option<&CachedEntry> {
        self.entries.get(request_key)
    }

    pub fn put(&mut self, entry: CachedEntry) {
        self.entries.insert(entry.request_key.clone(), entry);
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Write gate ====================

/// Shuts off one version's cache writes once it is superseded.
///
/// Writes hold the gate open for their whole duration, so [`retire`]
/// returns only after in-flight writes have landed. Nothing written through
/// the gate can reach the store after that.
///
/// [`retire`]: WriteGate::retire
#[derive(Debug, Default)]
pub struct WriteGate {
    retired: RwLock<bool>,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `entry` unless the gate is retired. Returns whether it was
    /// written.
    pub async fn put(
        &self,
        store: &dyn CacheStore,
        namespace: &str,
        entry: CachedEntry,
    ) -> SwResult<bool> {
        let retired = self.retired.read().await;
        if *retired {
            trace!(namespace, key = %entry.request_key, "Write dropped, version retired");
            return Ok(false);
        }
        store.put(namespace, entry).await?;
        Ok(true)
    }

    /// Refuse further writes, waiting for any in progress.
    pub async fn retire(&self) {
        *self.retired.write().await = true;
    }

    pub async fn is_retired(&self) -> bool {
        *self.retired.read().await
    }
}

/// In-memory [`CacheStore`] for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn lookup<'a>(
        &'a self,
        namespace: &'a str,
        request_key: &'a str,
    ) -> BoxFuture<'a, SwResult<Option<CachedEntry>>> {
        Box::pin(async move {
            let caches = self.caches.read().await;
            Ok(caches
                .get(namespace)
                .and_then(|cache| cache.match_request(request_key))
                .cloned())
        })
    }

    fn put<'a>(&'a self, namespace: &'a str, entry: CachedEntry) -> BoxFuture<'a, SwResult<()>> {
        Box::pin(async move {
            trace!(namespace, key = %entry.request_key, "Cache put");
            let mut caches = self.caches.write().await;
            caches
                .entry(namespace.to_string())
                .or_insert_with(|| Cache::new(namespace))
                .put(entry);
            Ok(())
        })
    }

    fn put_all<'a>(
        &'a self,
        namespace: &'a str,
        entries: Vec<CachedEntry>,
    ) -> BoxFuture<'a, SwResult<()>> {
        Box::pin(async move {
            let mut caches = self.caches.write().await;
            let cache = caches
                .entry(namespace.to_string())
                .or_insert_with(|| Cache::new(namespace));
            for entry in entries {
                cache.put(entry);
            }
            Ok(())
        })
    }

    fn namespaces(&self) -> BoxFuture<'_, SwResult<Vec<String>>> {
        Box::pin(async move { Ok(self.caches.read().await.keys().cloned().collect()) })
    }

    fn delete_namespace<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, SwResult<bool>> {
        Box::pin(async move { Ok(self.caches.write().await.remove(namespace).is_some()) })
    }

    fn entry_keys<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, SwResult<Vec<String>>> {
        Box::pin(async move {
            let caches = self.caches.read().await;
            Ok(caches
                .get(namespace)
                .map(|cache| cache.keys().into_iter().map(str::to_string).collect())
                .unwrap_or_default())
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_TYPE, SET_COOKIE, VARY};

    fn entry(key: &str, body: &str) -> CachedEntry {
        let response = Response::new(StatusCode::OK, body.to_string())
            .with_content_type("text/css");
        CachedEntry::new(key, &response)
    }

    #[test]
    fn test_snapshot_keeps_status_headers_body() {
        let response = Response::new(StatusCode::CREATED, "hello").with_content_type("text/plain");
        let restored = ResponseSnapshot::capture(&response).to_response();

        assert_eq!(restored.status, StatusCode::CREATED);
        assert_eq!(restored.headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(restored.text().unwrap(), "hello");
    }

    #[test]
    fn test_snapshot_keeps_repeated_headers() {
        let mut response = Response::new(StatusCode::OK, "")
            .with_header(VARY, HeaderValue::from_static("Accept"));
        response
            .headers
            .append(SET_COOKIE, HeaderValue::from_static("session=abc"));
        response
            .headers
            .append(SET_COOKIE, HeaderValue::from_static("theme=dark"));
        let restored = ResponseSnapshot::capture(&response).to_response();

        let cookies: Vec<&str> = restored
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["session=abc", "theme=dark"]);
        assert_eq!(restored.headers.get(VARY).unwrap(), "Accept");
    }

    #[test]
    fn test_cache_overwrites_same_key() {
        let mut cache = Cache::new("socialboost-static-v1");
        cache.put(entry("https://app.test/app.css", "old"));
        cache.put(entry("https://app.test/app.css", "new"));

        assert_eq!(cache.len(), 1);
        let stored = cache.match_request("https://app.test/app.css").unwrap();
        assert_eq!(stored.response.body, b"new");
    }

    #[tokio::test]
    async fn test_lookup_is_namespace_scoped() {
        let store = MemoryCacheStore::new();
        store
            .put("socialboost-static-v1", entry("https://app.test/app.css", "a"))
            .await
            .unwrap();

        let hit = store
            .lookup("socialboost-static-v1", "https://app.test/app.css")
            .await
            .unwrap();
        let miss = store
            .lookup("socialboost-dynamic-v1", "https://app.test/app.css")
            .await
            .unwrap();

        assert!(hit.is_some());
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_retired_gate_drops_writes() {
        let store = MemoryCacheStore::new();
        let gate = WriteGate::new();
        assert!(gate
            .put(&store, "socialboost-dynamic-v1", entry("https://app.test/feed", "a"))
            .await
            .unwrap());

        gate.retire().await;
        store.delete_namespace("socialboost-dynamic-v1").await.unwrap();
        assert!(!gate
            .put(&store, "socialboost-dynamic-v1", entry("https://app.test/feed", "b"))
            .await
            .unwrap());
        assert!(gate.is_retired().await);
        assert!(store.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_namespace_removes_entries() {
        let store = MemoryCacheStore::new();
        store
            .put_all(
                "socialboost-static-v1",
                vec![entry("https://app.test/a.js", "a"), entry("https://app.test/b.js", "b")],
            )
            .await
            .unwrap();

        assert_eq!(store.entry_keys("socialboost-static-v1").await.unwrap().len(), 2);
        assert!(store.delete_namespace("socialboost-static-v1").await.unwrap());
        assert!(!store.delete_namespace("socialboost-static-v1").await.unwrap());
        assert!(store.namespaces().await.unwrap().is_empty());
        assert!(store
            .lookup("socialboost-static-v1", "https://app.test/a.js")
            .await
            .unwrap()
            .is_none());
    }
}
