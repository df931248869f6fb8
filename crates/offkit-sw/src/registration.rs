//! Worker lifecycle across versions.
//!
//! ```text
//! Registration (scope)
//!     ├── installing  Parsed → Installing
//!     ├── waiting     Installed
//!     └── active      Activating → Activated
//! ```
//!
//! A worker that fails to install, or is replaced, becomes Redundant and is
//! dropped from the registration.

use std::sync::Arc;
use std::time::Instant;

use offkit_net::Request;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use crate::error::{SwError, SwResult};
use crate::router::PassthroughReason;
use crate::worker::{Dispatched, ServiceWorker, WorkerEvent, WorkerId};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Built, not yet installing.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling clients.
    Activated,
    /// Replaced or failed to install.
    Redundant,
}

/// A worker and its lifecycle state.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub worker: Arc<ServiceWorker>,
    pub state: ServiceWorkerState,
    pub state_changed_at: Instant,
}

impl WorkerSlot {
    fn new(worker: Arc<ServiceWorker>) -> Self {
        Self {
            worker,
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.worker.id()
    }

    pub fn version(&self) -> &str {
        self.worker.version()
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

/// Lifecycle notifications for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    StateChange {
        worker_id: WorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A new version started installing.
    UpdateFound { version: String },
    /// A new version took control of clients.
    ControllerChange { version: String },
}

/// The installing, waiting, and active workers of one scope.
#[derive(Debug)]
pub struct Registration {
    scope: Url,
    installing: Option<WorkerSlot>,
    waiting: Option<WorkerSlot>,
    active: Option<WorkerSlot>,
    event_tx: mpsc::UnboundedSender<RegistrationEvent>,
}

impl Registration {
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                scope,
                installing: None,
                waiting: None,
                active: None,
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn installing(&self) -> Option<&WorkerSlot> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&WorkerSlot> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&WorkerSlot> {
        self.active.as_ref()
    }

    pub fn active_version(&self) -> Option<&str> {
        self.active.as_ref().map(|slot| slot.version())
    }

    /// Install `worker` and, when it asks to skip waiting, activate it.
    ///
    /// On install failure the new worker becomes redundant and the current
    /// active worker stays in control.
    pub async fn update(&mut self, worker: ServiceWorker) -> SwResult<ServiceWorkerState> {
        if self.installing.is_some() {
            return Err(SwError::state("an install is already in progress"));
        }

        let mut slot = WorkerSlot::new(Arc::new(worker));
        let version = slot.version().to_string();
        info!(scope = %self.scope, %version, "Update found");
        let _ = self.event_tx.send(RegistrationEvent::UpdateFound {
            version: version.clone(),
        });

        self.set_state(&mut slot, ServiceWorkerState::Installing);
        let worker = Arc::clone(&slot.worker);
        self.installing = Some(slot);

        let result = worker.install().await;
        let Some(mut slot) = self.installing.take() else {
            return Err(SwError::state("installing worker disappeared"));
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    %version,
                    active = ?self.active_version(),
                    error = %e,
                    "Install failed; keeping current worker"
                );
                self.set_state(&mut slot, ServiceWorkerState::Redundant);
                return Err(e);
            }
        };

        self.set_state(&mut slot, ServiceWorkerState::Installed);
        if let Some(mut stale) = self.waiting.replace(slot) {
            self.set_state(&mut stale, ServiceWorkerState::Redundant);
        }

        if report.skip_waiting {
            self.activate_waiting().await?;
            return Ok(ServiceWorkerState::Activated);
        }
        Ok(ServiceWorkerState::Installed)
    }

    /// Promote the waiting worker. The previous active worker becomes
    /// redundant.
    ///
    /// The previous worker's cache writes are retired before the new
    /// worker collects old namespaces, so a refresh it left running cannot
    /// recreate one. A failed activate handler is logged and the worker is
    /// promoted anyway. Stale namespaces are then left for the next
    /// activation.
    pub async fn activate_waiting(&mut self) -> SwResult<()> {
        let Some(mut slot) = self.waiting.take() else {
            return Err(SwError::state("no waiting worker"));
        };
        let version = slot.version().to_string();

        if let Some(old) = &self.active {
            old.worker.retire().await;
        }
        self.set_state(&mut slot, ServiceWorkerState::Activating);
        match slot.worker.activate().await {
            Ok((deleted, claimed)) => {
                info!(%version, deleted = deleted.len(), claimed, "Worker activated");
            }
            Err(e) => warn!(%version, error = %e, "Activate handler failed"),
        }

        if let Some(mut old) = self.active.take() {
            self.set_state(&mut old, ServiceWorkerState::Redundant);
        }
        self.set_state(&mut slot, ServiceWorkerState::Activated);
        self.active = Some(slot);

        let _ = self
            .event_tx
            .send(RegistrationEvent::ControllerChange { version });
        Ok(())
    }

    /// Deliver an event to the active worker.
    pub fn dispatch(&self, event: WorkerEvent) -> Dispatched {
        match &self.active {
            Some(slot) => slot.worker.dispatch(event),
            None => Dispatched::Ignored,
        }
    }

    /// Intercept a fetch. Without an active worker the request goes to the
    /// network untouched.
    pub fn handle_fetch(&self, request: Request) -> Dispatched {
        match &self.active {
            Some(slot) => slot.worker.dispatch(WorkerEvent::Fetch(request)),
            None => Dispatched::Passthrough(PassthroughReason::NoController),
        }
    }

    /// Drop every worker.
    pub fn unregister(&mut self) {
        let slots = [
            self.active.take(),
            self.waiting.take(),
            self.installing.take(),
        ];
        for mut slot in slots.into_iter().flatten() {
            self.set_state(&mut slot, ServiceWorkerState::Redundant);
        }
        info!(scope = %self.scope, "Unregistered");
    }

    fn set_state(&self, slot: &mut WorkerSlot, state: ServiceWorkerState) {
        slot.state = state;
        slot.state_changed_at = Instant::now();
        let _ = self.event_tx.send(RegistrationEvent::StateChange {
            worker_id: slot.id(),
            version: slot.version().to_string(),
            new_state: state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Clients;
    use crate::config::WorkerConfig;
    use crate::storage::{CacheStore, MemoryCacheStore};
    use crate::testing::ScriptedFetcher;
    use http::StatusCode;

    struct Fixture {
        store: Arc<MemoryCacheStore>,
        clients: Arc<Clients>,
        fetcher: Arc<ScriptedFetcher>,
    }

    impl Fixture {
        fn new() -> Self {
            let fetcher = Arc::new(ScriptedFetcher::new());
            for path in WorkerConfig::default().precache_assets {
                fetcher.respond(&path, StatusCode::OK, "ok");
            }
            Self {
                store: Arc::new(MemoryCacheStore::new()),
                clients: Arc::new(Clients::new()),
                fetcher,
            }
        }

        fn worker(&self, version: &str) -> ServiceWorker {
            let config = WorkerConfig {
                version: version.to_string(),
                ..WorkerConfig::default()
            };
            ServiceWorker::builder(config)
                .fetcher(self.fetcher.clone())
                .store(self.store.clone())
                .clients(self.clients.clone())
                .build()
                .unwrap()
        }
    }

    fn registration() -> (Registration, mpsc::UnboundedReceiver<RegistrationEvent>) {
        Registration::new(Url::parse("http://localhost:3000/").unwrap())
    }

    #[tokio::test]
    async fn test_first_install_activates() {
        let fixture = Fixture::new();
        let (mut reg, _rx) = registration();

        let state = reg.update(fixture.worker("v1")).await.unwrap();
        assert_eq!(state, ServiceWorkerState::Activated);
        assert_eq!(reg.active_version(), Some("v1"));
        assert!(reg.active().unwrap().is_active());
        assert!(reg.waiting().is_none());
        assert!(reg.installing().is_none());
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous() {
        let fixture = Fixture::new();
        let (mut reg, _rx) = registration();
        reg.update(fixture.worker("v1")).await.unwrap();

        fixture.fetcher.fail("/offline.html");
        let err = reg.update(fixture.worker("v2")).await.unwrap_err();
        assert!(matches!(err, SwError::PrecacheFailed { .. }));
        assert_eq!(reg.active_version(), Some("v1"));

        let names = fixture.store.namespaces().await.unwrap();
        assert!(!names.iter().any(|n| n.ends_with("-v2")));
    }

    #[tokio::test]
    async fn test_new_version_replaces_old() {
        let fixture = Fixture::new();
        let (mut reg, mut rx) = registration();
        reg.update(fixture.worker("v1")).await.unwrap();
        let v1 = reg.active().unwrap().id();

        reg.update(fixture.worker("v2")).await.unwrap();
        assert_eq!(reg.active_version(), Some("v2"));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&RegistrationEvent::StateChange {
            worker_id: v1,
            version: "v1".into(),
            new_state: ServiceWorkerState::Redundant,
        }));
        assert_eq!(
            events.last(),
            Some(&RegistrationEvent::ControllerChange {
                version: "v2".into()
            })
        );
    }

    #[tokio::test]
    async fn test_fetch_without_active_worker_passes_through() {
        let (reg, _rx) = registration();
        let request = Request::get(Url::parse("http://localhost:3000/app.js").unwrap());
        assert!(matches!(
            reg.handle_fetch(request),
            Dispatched::Passthrough(PassthroughReason::NoController)
        ));
    }

    #[tokio::test]
    async fn test_activate_without_waiting_is_error() {
        let (mut reg, _rx) = registration();
        assert!(matches!(
            reg.activate_waiting().await,
            Err(SwError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_clears_workers() {
        let fixture = Fixture::new();
        let (mut reg, _rx) = registration();
        reg.update(fixture.worker("v1")).await.unwrap();

        reg.unregister();
        assert!(reg.active().is_none());
    }
}
