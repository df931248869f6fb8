//! Event dispatch.
//!
//! A [`ServiceWorker`] owns one version's components and a dispatch table
//! keyed by [`EventKind`]. [`ServiceWorker::dispatch`] decides synchronously
//! whether an event is handled, then spawns the handler and hands back a
//! [`WaitUntil`] token. The host keeps the worker alive until every token it
//! holds has settled.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use hashbrown::HashMap;
use offkit_net::{Fetcher, HttpFetcher, LoaderConfig, Request};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clients::{Clients, WindowClients};
use crate::config::WorkerConfig;
use crate::error::{SwError, SwResult};
use crate::gc::GarbageCollector;
use crate::namespace::{NamespaceKind, VersionRegistry};
use crate::notification::{
    ClickOutcome, MemoryNotificationSink, NotificationClick, NotificationDescriptor,
    NotificationHandler, NotificationSink,
};
use crate::precache::{PrecacheReport, Precacher};
use crate::router::{PassthroughReason, Route, Router, Strategy};
use crate::storage::{CacheStore, MemoryCacheStore};
use crate::strategy::{StrategyEngine, StrategyResponse};
use crate::sync::{SyncFuture, SyncRegistry, SyncTask, REFRESH_CONTENT};

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Dispatch table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Push,
    NotificationClick,
    Sync,
    PeriodicSync,
}

/// An event delivered by the host runtime.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    /// Push message with its raw payload, if any.
    Push(Option<Bytes>),
    NotificationClick(NotificationClick),
    /// One-off sync, by tag.
    Sync(String),
    /// Periodic sync, by tag.
    PeriodicSync(String),
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Install => EventKind::Install,
            Self::Activate => EventKind::Activate,
            Self::Fetch(_) => EventKind::Fetch,
            Self::Push(_) => EventKind::Push,
            Self::NotificationClick(_) => EventKind::NotificationClick,
            Self::Sync(_) => EventKind::Sync,
            Self::PeriodicSync(_) => EventKind::PeriodicSync,
        }
    }
}

/// What a settled handler produced.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(PrecacheReport),
    Activated {
        /// Stale namespaces removed by GC.
        deleted: Vec<String>,
        /// Clients taken over.
        claimed: usize,
    },
    Responded(StrategyResponse),
    NotificationShown(NotificationDescriptor),
    NotificationClicked(ClickOutcome),
    SyncSettled {
        tag: String,
        /// False when no task is registered for the tag.
        handled: bool,
    },
}

/// Event after the synchronous part of dispatch.
enum Payload {
    Install,
    Activate,
    Fetch {
        request: Request,
        strategy: Strategy,
        namespace: Option<NamespaceKind>,
    },
    Push(Option<Bytes>),
    NotificationClick(NotificationClick),
    Sync(String),
    PeriodicSync(String),
}

type EventHandler =
    Arc<dyn Fn(Arc<WorkerScope>, Payload) -> BoxFuture<'static, SwResult<EventOutcome>> + Send + Sync>;

/// Lifetime-extension token for one dispatched event.
#[derive(Debug)]
pub struct WaitUntil {
    kind: EventKind,
    task: JoinHandle<SwResult<EventOutcome>>,
}

impl WaitUntil {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the handler to finish.
    pub async fn settled(self) -> SwResult<EventOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SwError::HandlerAborted(format!("{:?}: {e}", self.kind))),
        }
    }
}

/// Result of [`ServiceWorker::dispatch`].
#[derive(Debug)]
pub enum Dispatched {
    /// Fetch not intercepted; the host sends it to the network itself.
    Passthrough(PassthroughReason),
    /// No handler is registered for this event kind.
    Ignored,
    /// Handler running.
    Pending(WaitUntil),
}

/// Components shared by every handler of one worker.
pub struct WorkerScope {
    pub config: Arc<WorkerConfig>,
    pub registry: Arc<VersionRegistry>,
    pub store: Arc<dyn CacheStore>,
    pub router: Router,
    pub engine: Arc<StrategyEngine>,
    pub precacher: Precacher,
    pub gc: GarbageCollector,
    pub notifications: NotificationHandler,
    pub clients: Arc<dyn WindowClients>,
    pub sync: SyncRegistry,
}

/// One version of the worker.
pub struct ServiceWorker {
    id: WorkerId,
    scope: Arc<WorkerScope>,
    handlers: HashMap<EventKind, EventHandler>,
}

impl ServiceWorker {
    pub fn builder(config: WorkerConfig) -> ServiceWorkerBuilder {
        ServiceWorkerBuilder::new(config)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn version(&self) -> &str {
        self.scope.registry.version()
    }

    pub fn scope(&self) -> &Arc<WorkerScope> {
        &self.scope
    }

    /// Stop this version's cache writes, waiting for writes in flight.
    pub async fn retire(&self) {
        self.scope.engine.retire().await;
    }

    pub fn handles(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Route `event` and start its handler.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn dispatch(&self, event: WorkerEvent) -> Dispatched {
        let kind = event.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            debug!(?kind, "No handler for event");
            return Dispatched::Ignored;
        };

        let payload = match event {
            WorkerEvent::Install => Payload::Install,
            WorkerEvent::Activate => Payload::Activate,
            WorkerEvent::Fetch(request) => match self.scope.router.route(&request) {
                Route::Passthrough(reason) => {
                    debug!(url = %request.url, ?reason, "Not intercepted");
                    return Dispatched::Passthrough(reason);
                }
                Route::Handle {
                    strategy,
                    namespace,
                } => Payload::Fetch {
                    request,
                    strategy,
                    namespace,
                },
            },
            WorkerEvent::Push(data) => Payload::Push(data),
            WorkerEvent::NotificationClick(click) => Payload::NotificationClick(click),
            WorkerEvent::Sync(tag) => Payload::Sync(tag),
            WorkerEvent::PeriodicSync(tag) => Payload::PeriodicSync(tag),
        };

        let task = tokio::spawn(handler(Arc::clone(&self.scope), payload));
        Dispatched::Pending(WaitUntil { kind, task })
    }

    /// Dispatch `event` and wait for it. `None` when it was not handled.
    pub async fn dispatch_and_settle(&self, event: WorkerEvent) -> Option<SwResult<EventOutcome>> {
        match self.dispatch(event) {
            Dispatched::Pending(wait) => Some(wait.settled().await),
            Dispatched::Passthrough(_) | Dispatched::Ignored => None,
        }
    }

    /// Run the install handler to completion.
    pub async fn install(&self) -> SwResult<PrecacheReport> {
        match self.dispatch_and_settle(WorkerEvent::Install).await {
            Some(Ok(EventOutcome::Installed(report))) => Ok(report),
            Some(Ok(other)) => Err(SwError::state(format!("unexpected install outcome: {other:?}"))),
            Some(Err(e)) => Err(e),
            None => Err(SwError::state("install is not handled")),
        }
    }

    /// Run the activate handler to completion. Returns the deleted
    /// namespaces and the number of claimed clients.
    pub async fn activate(&self) -> SwResult<(Vec<String>, usize)> {
        match self.dispatch_and_settle(WorkerEvent::Activate).await {
            Some(Ok(EventOutcome::Activated { deleted, claimed })) => Ok((deleted, claimed)),
            Some(Ok(other)) => Err(SwError::state(format!("unexpected activate outcome: {other:?}"))),
            Some(Err(e)) => Err(e),
            None => Err(SwError::state("activate is not handled")),
        }
    }
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("version", &self.version())
            .finish()
    }
}

fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Arc<WorkerScope>, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SwResult<EventOutcome>> + Send + 'static,
{
    Arc::new(move |scope, payload| Box::pin(f(scope, payload)) as BoxFuture<'static, _>)
}

fn default_handlers() -> HashMap<EventKind, EventHandler> {
    let mut table = HashMap::new();
    table.insert(EventKind::Install, handler(on_install));
    table.insert(EventKind::Activate, handler(on_activate));
    table.insert(EventKind::Fetch, handler(on_fetch));
    table.insert(EventKind::Push, handler(on_push));
    table.insert(EventKind::NotificationClick, handler(on_notification_click));
    table.insert(EventKind::Sync, handler(on_sync));
    table.insert(EventKind::PeriodicSync, handler(on_periodic_sync));
    table
}

async fn on_install(scope: Arc<WorkerScope>, _: Payload) -> SwResult<EventOutcome> {
    scope.precacher.run().await.map(EventOutcome::Installed)
}

async fn on_activate(scope: Arc<WorkerScope>, _: Payload) -> SwResult<EventOutcome> {
    let deleted = scope.gc.collect().await?;
    let claimed = scope.clients.claim().await?;
    info!(
        version = scope.registry.version(),
        deleted = deleted.len(),
        claimed,
        "Activated"
    );
    Ok(EventOutcome::Activated { deleted, claimed })
}

async fn on_fetch(scope: Arc<WorkerScope>, payload: Payload) -> SwResult<EventOutcome> {
    let Payload::Fetch {
        request,
        strategy,
        namespace,
    } = payload
    else {
        return Err(mismatched(EventKind::Fetch));
    };
    let response = scope.engine.execute(strategy, namespace, request).await;
    Ok(EventOutcome::Responded(response))
}

async fn on_push(scope: Arc<WorkerScope>, payload: Payload) -> SwResult<EventOutcome> {
    let Payload::Push(data) = payload else {
        return Err(mismatched(EventKind::Push));
    };
    let shown = scope.notifications.on_push(data.as_deref()).await?;
    Ok(EventOutcome::NotificationShown(shown))
}

async fn on_notification_click(scope: Arc<WorkerScope>, payload: Payload) -> SwResult<EventOutcome> {
    let Payload::NotificationClick(click) = payload else {
        return Err(mismatched(EventKind::NotificationClick));
    };
    let outcome = scope.notifications.on_click(click).await?;
    Ok(EventOutcome::NotificationClicked(outcome))
}

async fn on_sync(scope: Arc<WorkerScope>, payload: Payload) -> SwResult<EventOutcome> {
    let Payload::Sync(tag) = payload else {
        return Err(mismatched(EventKind::Sync));
    };
    let pending = scope.sync.one_off.dispatch(&tag);
    settle_sync(tag, pending).await
}

async fn on_periodic_sync(scope: Arc<WorkerScope>, payload: Payload) -> SwResult<EventOutcome> {
    let Payload::PeriodicSync(tag) = payload else {
        return Err(mismatched(EventKind::PeriodicSync));
    };
    let pending = scope.sync.periodic.dispatch(&tag);
    settle_sync(tag, pending).await
}

fn mismatched(kind: EventKind) -> SwError {
    SwError::state(format!("{kind:?} handler received another event"))
}

async fn settle_sync(tag: String, pending: Option<SyncFuture>) -> SwResult<EventOutcome> {
    let Some(task) = pending else {
        return Ok(EventOutcome::SyncSettled {
            tag,
            handled: false,
        });
    };
    match task.await {
        Ok(()) => {
            debug!(%tag, "Sync task settled");
            Ok(EventOutcome::SyncSettled { tag, handled: true })
        }
        Err(e) => {
            warn!(%tag, error = %e, "Sync task failed");
            Err(e)
        }
    }
}

/// Builder for [`ServiceWorker`]. Unset seams fall back to in-memory
/// implementations and a `reqwest` fetcher.
pub struct ServiceWorkerBuilder {
    config: WorkerConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    store: Option<Arc<dyn CacheStore>>,
    clients: Option<Arc<dyn WindowClients>>,
    sink: Option<Arc<dyn NotificationSink>>,
    sync: SyncRegistry,
}

impl ServiceWorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            fetcher: None,
            store: None,
            clients: None,
            sink: None,
            sync: SyncRegistry::new(),
        }
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clients(mut self, clients: Arc<dyn WindowClients>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Register a one-off sync task.
    pub fn on_sync(mut self, task: SyncTask) -> Self {
        self.sync = self.sync.on_sync(task);
        self
    }

    /// Register a periodic sync task. Registering `refresh-content`
    /// replaces the built-in API refresh.
    pub fn on_periodic_sync(mut self, task: SyncTask) -> Self {
        self.sync = self.sync.on_periodic_sync(task);
        self
    }

    pub fn build(self) -> SwResult<ServiceWorker> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => {
                let loader = LoaderConfig {
                    default_timeout: config.fetch_timeout(),
                    ..LoaderConfig::default()
                };
                let http = HttpFetcher::new(loader)
                    .map_err(|e| SwError::config(format!("cannot build HTTP client: {e}")))?;
                Arc::new(http) as Arc<dyn Fetcher>
            }
        };
        let store: Arc<dyn CacheStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryCacheStore::new()),
        };
        let clients: Arc<dyn WindowClients> = match self.clients {
            Some(clients) => clients,
            None => Arc::new(Clients::new()),
        };
        let sink: Arc<dyn NotificationSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(MemoryNotificationSink::new()),
        };

        let registry = Arc::new(VersionRegistry::from_config(&config));
        let engine = Arc::new(StrategyEngine::new(
            config.clone(),
            registry.clone(),
            store.clone(),
            fetcher.clone(),
        ));

        let mut sync = self.sync;
        if !sync.periodic.contains(REFRESH_CONTENT) {
            let urls = config
                .periodic_refresh_paths
                .iter()
                .map(|path| config.resolve(path))
                .collect::<SwResult<Vec<_>>>()?;
            sync.periodic
                .register(SyncTask::refresh_api(REFRESH_CONTENT, engine.clone(), urls));
        }

        let scope = WorkerScope {
            router: Router::new(config.clone()),
            precacher: Precacher::new(config.clone(), registry.clone(), store.clone(), fetcher),
            gc: GarbageCollector::new(registry.clone(), store.clone()),
            notifications: NotificationHandler::new(config.clone(), sink, clients.clone()),
            engine,
            clients,
            sync,
            store,
            registry,
            config,
        };

        let worker = ServiceWorker {
            id: WorkerId::new(),
            scope: Arc::new(scope),
            handlers: default_handlers(),
        };
        info!(id = %worker.id, version = worker.version(), "Worker built");
        Ok(worker)
    }
}
