//! Install-time precaching of static assets.
//!
//! All-or-nothing: every asset is fetched before anything is written, and
//! the batch is committed with one `put_all`.

use std::sync::Arc;

use futures::future::try_join_all;
use offkit_common::retry_with_backoff;
use offkit_net::{Fetcher, Request};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{SwError, SwResult};
use crate::namespace::{NamespaceKind, VersionRegistry};
use crate::storage::{CacheStore, CachedEntry};
use crate::strategy::timed_fetch;

/// Result of a completed precache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheReport {
    /// Static namespace that received the assets.
    pub namespace: String,
    /// Number of assets stored.
    pub assets: usize,
    /// The new worker activates without waiting for old clients to close.
    pub skip_waiting: bool,
}

pub struct Precacher {
    config: Arc<WorkerConfig>,
    registry: Arc<VersionRegistry>,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
}

impl Precacher {
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
        }
    }

    /// Fetch every configured asset and store them in the static namespace.
    pub async fn run(&self) -> SwResult<PrecacheReport> {
        let namespace = self.registry.name(NamespaceKind::Static);
        info!(
            version = self.registry.version(),
            namespace,
            assets = self.config.precache_assets.len(),
            "Precaching static assets"
        );

        let fetches = self
            .config
            .precache_assets
            .iter()
            .map(|asset| self.fetch_asset(asset));
        let entries = try_join_all(fetches).await?;
        let count = entries.len();

        self.store.put_all(namespace, entries).await?;

        info!(namespace, assets = count, "Precache complete");
        Ok(PrecacheReport {
            namespace: namespace.to_string(),
            assets: count,
            skip_waiting: true,
        })
    }

    async fn fetch_asset(&self, asset: &str) -> SwResult<CachedEntry> {
        let url = self.config.resolve(asset)?;
        let retry = self.config.precache_retry();
        let timeout = self.config.fetch_timeout();

        let response = retry_with_backoff(&retry, || {
            let request = Request::get(url.clone());
            async move {
                let response = timed_fetch(self.fetcher.as_ref(), request, timeout)
                    .await
                    .map_err(|e| e.to_string())?;
                if response.ok() {
                    Ok(response)
                } else {
                    Err(format!("status {}", response.status))
                }
            }
        })
        .await
        .map_err(|reason| {
            warn!(asset, %reason, "Precache fetch failed");
            SwError::PrecacheFailed {
                asset: asset.to_string(),
                reason,
            }
        })?;

        debug!(asset, bytes = response.body.len(), "Fetched asset");
        Ok(CachedEntry::new(Request::get(url).cache_key(), &response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCacheStore;
    use crate::testing::ScriptedFetcher;
    use http::StatusCode;

    fn setup(assets: &[&str]) -> (Precacher, Arc<ScriptedFetcher>, Arc<MemoryCacheStore>) {
        let config = Arc::new(WorkerConfig {
            precache_assets: assets.iter().map(|a| a.to_string()).collect(),
            offline_page: assets[0].to_string(),
            ..Default::default()
        });
        let registry = Arc::new(VersionRegistry::from_config(&config));
        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        let precacher = Precacher::new(config, registry, store.clone(), fetcher.clone());
        (precacher, fetcher, store)
    }

    #[tokio::test]
    async fn test_precache_stores_every_asset() {
        let (precacher, fetcher, store) = setup(&["/offline.html", "/app.js"]);
        fetcher.respond("/offline.html", StatusCode::OK, "<html>offline</html>");
        fetcher.respond("/app.js", StatusCode::OK, "console.log(1)");

        let report = precacher.run().await.unwrap();

        assert_eq!(report.assets, 2);
        assert!(report.skip_waiting);
        assert_eq!(report.namespace, "socialboost-static-v1");
        let mut keys = store.entry_keys("socialboost-static-v1").await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "http://localhost:3000/app.js".to_string(),
                "http://localhost:3000/offline.html".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_one_failure_stores_nothing() {
        let (precacher, fetcher, store) = setup(&["/offline.html", "/app.js", "/app.css"]);
        fetcher.respond("/offline.html", StatusCode::OK, "offline");
        fetcher.respond("/app.js", StatusCode::OK, "js");
        fetcher.fail("/app.css");

        let err = precacher.run().await.unwrap_err();

        match err {
            SwError::PrecacheFailed { asset, .. } => assert_eq!(asset, "/app.css"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_status_fails_install() {
        let (precacher, fetcher, store) = setup(&["/offline.html"]);
        fetcher.respond("/offline.html", StatusCode::INTERNAL_SERVER_ERROR, "boom");

        assert!(precacher.run().await.is_err());
        assert!(store.namespaces().await.unwrap().is_empty());
    }
}
