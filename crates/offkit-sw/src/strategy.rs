//! Caching strategies.
//!
//! Every branch ends in a cache hit, a synthetic response, or a network
//! response; network and storage failures never reach the page.

use std::sync::Arc;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use offkit_common::with_timeout;
use offkit_net::{any_matches, Fetcher, NetError, Request, Response};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::error::{SwError, SwResult};
use crate::namespace::{NamespaceKind, VersionRegistry};
use crate::router::Strategy;
use crate::storage::{CacheStore, CachedEntry, WriteGate};

const OFFLINE_TEXT: &str = "Offline: this resource is not available without a connection.";

const OFFLINE_HTML: &str = "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\"><title>Offline</title></head>\n<body><h1>You are offline</h1><p>Check your connection and try again.</p></body>\n</html>\n";

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    Synthetic,
}

/// Background cache refresh started by stale-while-revalidate.
///
/// Dropping it detaches the task. Nothing orders the refresh against later
/// reads of the same key.
#[derive(Debug)]
pub struct Revalidation(JoinHandle<()>);

impl Revalidation {
    /// Wait for the refresh to finish writing (or give up).
    pub async fn settled(self) {
        if let Err(e) = self.0.await {
            warn!(error = %e, "Revalidation task aborted");
        }
    }
}

/// The answer to an intercepted request.
#[derive(Debug)]
pub struct StrategyResponse {
    pub response: Response,
    pub source: ResponseSource,
    pub revalidation: Option<Revalidation>,
}

impl StrategyResponse {
    fn network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
            revalidation: None,
        }
    }

    fn cached(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Cache,
            revalidation: None,
        }
    }

    fn synthetic(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Synthetic,
            revalidation: None,
        }
    }
}

/// Runs strategies against the store and the network.
pub struct StrategyEngine {
    config: Arc<WorkerConfig>,
    registry: Arc<VersionRegistry>,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    gate: Arc<WriteGate>,
}

impl StrategyEngine {
    pub fn new(
        config: Arc<WorkerConfig>,
        registry: Arc<VersionRegistry>,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            fetcher,
            gate: Arc::new(WriteGate::new()),
        }
    }

    /// Stop writing to this version's namespaces. Refreshes still running
    /// keep serving but no longer store what they fetch.
    pub async fn retire(&self) {
        self.gate.retire().await;
        debug!(version = self.registry.version(), "Cache writes retired");
    }

    /// Run `strategy` for a routed request.
    pub async fn execute(
        &self,
        strategy: Strategy,
        namespace: Option<NamespaceKind>,
        request: Request,
    ) -> StrategyResponse {
        debug!(url = %request.url, strategy = strategy.as_str(), "Executing strategy");
        match strategy {
            Strategy::CacheFirst => {
                self.cache_first(request, namespace.unwrap_or(NamespaceKind::Static))
                    .await
            }
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::NavigationFallback => self.navigation_fallback(request).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        }
    }

    /// Serve from cache; on miss fetch, store, and return.
    pub async fn cache_first(&self, request: Request, kind: NamespaceKind) -> StrategyResponse {
        let namespace = self.registry.name(kind);
        let key = request.cache_key();

        if let Some(entry) = lookup(self.store.as_ref(), namespace, &key).await {
            debug!(url = %request.url, namespace, "Cache hit");
            return StrategyResponse::cached(entry.response.to_response());
        }

        match timed_fetch(self.fetcher.as_ref(), request, self.config.fetch_timeout()).await {
            Ok(response) => {
                if response.ok() {
                    store_copy(&self.gate, self.store.as_ref(), namespace, &key, &response).await;
                }
                StrategyResponse::network(response)
            }
            Err(e) => {
                warn!(url = %key, error = %e, "Static asset unavailable offline");
                StrategyResponse::synthetic(offline_text_response())
            }
        }
    }

    /// Prefer the network; keep copies of cacheable API responses for
    /// offline use.
    pub async fn network_first(&self, request: Request) -> StrategyResponse {
        let namespace = self.registry.name(NamespaceKind::Api);
        let key = request.cache_key();
        let cacheable = any_matches(&self.config.cacheable_api_patterns, &request.url);

        match timed_fetch(self.fetcher.as_ref(), request, self.config.fetch_timeout()).await {
            Ok(response) => {
                if cacheable && response.ok() {
                    store_copy(&self.gate, self.store.as_ref(), namespace, &key, &response).await;
                }
                StrategyResponse::network(response)
            }
            Err(e) => {
                debug!(url = %key, error = %e, "API fetch failed, trying cache");
                match lookup(self.store.as_ref(), namespace, &key).await {
                    Some(entry) => StrategyResponse::cached(entry.response.to_response()),
                    None => StrategyResponse::synthetic(offline_json_response(
                        &self.config.offline_message,
                    )),
                }
            }
        }
    }

    /// Navigations are never cached; offline they get the precached offline
    /// document.
    pub async fn navigation_fallback(&self, request: Request) -> StrategyResponse {
        let url = request.url.clone();
        match timed_fetch(self.fetcher.as_ref(), request, self.config.fetch_timeout()).await {
            Ok(response) => StrategyResponse::network(response),
            Err(e) => {
                debug!(url = %url, error = %e, "Navigation failed, serving offline page");
                match self.offline_document().await {
                    Some(mut response) => {
                        response.status = StatusCode::SERVICE_UNAVAILABLE;
                        StrategyResponse::cached(response)
                    }
                    None => StrategyResponse::synthetic(offline_html_response()),
                }
            }
        }
    }

    /// Answer from cache immediately when possible while a detached fetch
    /// refreshes the entry.
    pub async fn stale_while_revalidate(&self, request: Request) -> StrategyResponse {
        let namespace = self.registry.name(NamespaceKind::Dynamic).to_string();
        let key = request.cache_key();
        let cached = lookup(self.store.as_ref(), &namespace, &key).await;

        let store = Arc::clone(&self.store);
        let gate = Arc::clone(&self.gate);
        let fetcher = Arc::clone(&self.fetcher);
        let timeout = self.config.fetch_timeout();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let refresh = tokio::spawn(async move {
            let result = timed_fetch(fetcher.as_ref(), request, timeout).await;
            if let Ok(response) = &result {
                if response.ok() {
                    store_copy(&gate, store.as_ref(), &namespace, &key, response).await;
                }
            }
            // The receiver is gone when a cached copy was already served.
            let _ = tx.send(result);
        });

        if let Some(entry) = cached {
            return StrategyResponse {
                response: entry.response.to_response(),
                source: ResponseSource::Cache,
                revalidation: Some(Revalidation(refresh)),
            };
        }

        match rx.await {
            Ok(Ok(response)) => StrategyResponse::network(response),
            Ok(Err(e)) => {
                warn!(error = %e, "No cached copy and network failed");
                StrategyResponse::synthetic(offline_text_response())
            }
            Err(_) => StrategyResponse::synthetic(offline_text_response()),
        }
    }

    /// Fetch `request` and store a successful response in `kind`.
    ///
    /// Used by deferred-sync tasks; unlike the strategies this reports
    /// failure to the caller.
    pub async fn refresh(&self, request: Request, kind: NamespaceKind) -> SwResult<StatusCode> {
        let namespace = self.registry.name(kind);
        let key = request.cache_key();
        let response = timed_fetch(self.fetcher.as_ref(), request, self.config.fetch_timeout())
            .await
            .map_err(|e| SwError::cache(format!("refresh of {key} failed: {e}")))?;

        if !response.ok() {
            return Err(SwError::cache(format!(
                "refresh of {key} returned {}",
                response.status
            )));
        }
        let written = self
            .gate
            .put(self.store.as_ref(), namespace, CachedEntry::new(key.as_str(), &response))
            .await?;
        if !written {
            return Err(SwError::state(format!(
                "refresh of {key} skipped, version {} is retired",
                self.registry.version()
            )));
        }
        Ok(response.status)
    }

    async fn offline_document(&self) -> Option<Response> {
        let url = self.config.resolve(&self.config.offline_page).ok()?;
        let request = Request::get(url);
        lookup(
            self.store.as_ref(),
            self.registry.name(NamespaceKind::Static),
            &request.cache_key(),
        )
        .await
        .map(|entry| entry.response.to_response())
    }
}

/// Network fetch bounded by `timeout`; expiry counts as a network failure.
pub(crate) async fn timed_fetch(
    fetcher: &dyn Fetcher,
    request: Request,
    timeout: Duration,
) -> Result<Response, NetError> {
    match with_timeout(timeout, fetcher.fetch(request)).await {
        Ok(result) => result,
        Err(_) => Err(NetError::Timeout(timeout)),
    }
}

/// Cache read where a storage error counts as a miss.
async fn lookup(store: &dyn CacheStore, namespace: &str, key: &str) -> Option<CachedEntry> {
    match store.lookup(namespace, key).await {
        Ok(entry) => entry,
        Err(e) => {
            warn!(namespace, key, error = %e, "Cache read failed");
            None
        }
    }
}

async fn store_copy(
    gate: &WriteGate,
    store: &dyn CacheStore,
    namespace: &str,
    key: &str,
    response: &Response,
) {
    if let Err(e) = gate
        .put(store, namespace, CachedEntry::new(key, response))
        .await
    {
        warn!(namespace, key, error = %e, "Cache write failed");
    }
}

fn offline_text_response() -> Response {
    Response::new(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_TEXT)
        .with_content_type("text/plain; charset=utf-8")
}

fn offline_json_response(message: &str) -> Response {
    let body = json!({ "error": "offline", "message": message }).to_string();
    Response::new(StatusCode::SERVICE_UNAVAILABLE, body)
        .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
}

fn offline_html_response() -> Response {
    Response::new(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_HTML)
        .with_content_type("text/html; charset=utf-8")
}
