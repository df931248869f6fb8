//! Activation-time removal of namespaces from older versions.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info};

use crate::error::SwResult;
use crate::namespace::VersionRegistry;
use crate::storage::CacheStore;

pub struct GarbageCollector {
    registry: Arc<VersionRegistry>,
    store: Arc<dyn CacheStore>,
}

impl GarbageCollector {
    pub fn new(registry: Arc<VersionRegistry>, store: Arc<dyn CacheStore>) -> Self {
        Self { registry, store }
    }

    /// Delete every namespace that is not one of the current version's.
    /// Returns the deleted names. Safe to run when nothing is stale.
    pub async fn collect(&self) -> SwResult<Vec<String>> {
        let stale: Vec<String> = self
            .store
            .namespaces()
            .await?
            .into_iter()
            .filter(|name| !self.registry.is_current(name))
            .collect();

        if stale.is_empty() {
            debug!(version = self.registry.version(), "No stale caches");
            return Ok(stale);
        }

        try_join_all(stale.iter().map(|name| {
            info!(namespace = %name, "Deleting stale cache");
            self.store.delete_namespace(name)
        }))
        .await?;

        Ok(stale)
    }
}
