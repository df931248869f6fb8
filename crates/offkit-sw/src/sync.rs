//! Deferred and periodic sync.
//!
//! Two fixed dispatch tables keyed by tag. A tag with no entry is a no-op.
//! No queue or retry state lives here; a failed task is reported to the
//! host, which decides whether to fire the tag again.

use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use hashbrown::HashMap;
use offkit_net::Request;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SwError, SwResult};
use crate::namespace::NamespaceKind;
use crate::strategy::StrategyEngine;

/// Posts drafted while offline.
pub const SYNC_POSTS: &str = "sync-posts";
/// Analytics events recorded while offline.
pub const SYNC_ANALYTICS: &str = "sync-analytics";
/// Periodic refresh of cached API data.
pub const REFRESH_CONTENT: &str = "refresh-content";

pub type SyncFuture = BoxFuture<'static, SwResult<()>>;

type SyncHandler = Arc<dyn Fn() -> SyncFuture + Send + Sync>;

/// A tag and the async work it triggers.
#[derive(Clone)]
pub struct SyncTask {
    tag: String,
    handler: SyncHandler,
}

impl SyncTask {
    pub fn new<F, Fut>(tag: impl Into<String>, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SwResult<()>> + Send + 'static,
    {
        Self {
            tag: tag.into(),
            handler: Arc::new(move || Box::pin(handler()) as SyncFuture),
        }
    }

    /// Re-fetch `urls` and store successful responses in the `api`
    /// namespace. Fails if any URL could not be refreshed.
    pub fn refresh_api(tag: impl Into<String>, engine: Arc<StrategyEngine>, urls: Vec<Url>) -> Self {
        let tag = tag.into();
        let task_tag = tag.clone();
        Self::new(tag, move || {
            let engine = Arc::clone(&engine);
            let urls = urls.clone();
            let tag = task_tag.clone();
            async move {
                let results = join_all(urls.iter().map(|url| {
                    engine.refresh(Request::get(url.clone()), NamespaceKind::Api)
                }))
                .await;

                let failed: Vec<String> = results
                    .into_iter()
                    .filter_map(|r| r.err().map(|e| e.to_string()))
                    .collect();
                if failed.is_empty() {
                    info!(%tag, refreshed = urls.len(), "API cache refreshed");
                    Ok(())
                } else {
                    Err(SwError::SyncFailed {
                        tag,
                        reason: failed.join("; "),
                    })
                }
            }
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn run(&self) -> SyncFuture {
        (self.handler)()
    }
}

impl std::fmt::Debug for SyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTask").field("tag", &self.tag).finish()
    }
}

/// Tag-keyed dispatch table.
#[derive(Debug, Clone, Default)]
pub struct SyncTable {
    tasks: HashMap<String, SyncTask>,
}

impl SyncTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the task for its tag.
    pub fn register(&mut self, task: SyncTask) {
        debug!(tag = task.tag(), "Registered sync task");
        self.tasks.insert(task.tag.clone(), task);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tasks.contains_key(tag)
    }

    pub fn tags(&self) -> Vec<&str> {
        self.tasks.keys().map(|s| s.as_str()).collect()
    }

    /// Start the task for `tag`, or `None` when the tag is unknown.
    pub fn dispatch(&self, tag: &str) -> Option<SyncFuture> {
        match self.tasks.get(tag) {
            Some(task) => Some(task.run()),
            None => {
                warn!(tag, "No sync task for tag");
                None
            }
        }
    }
}

/// One-off and periodic sync tables.
#[derive(Debug, Clone, Default)]
pub struct SyncRegistry {
    pub one_off: SyncTable,
    pub periodic: SyncTable,
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sync(mut self, task: SyncTask) -> Self {
        self.one_off.register(task);
        self
    }

    pub fn on_periodic_sync(mut self, task: SyncTask) -> Self {
        self.periodic.register(task);
        self
    }
}
