//! # Offkit worker
//!
//! Client-side request interception and caching for a single-origin web
//! application.
//!
//! ## Architecture
//!
//! ```text
//! Registration (scope)
//!     └── ServiceWorker (one version)
//!             ├── dispatch table: install, activate, fetch, push,
//!             │                   notificationclick, sync, periodicsync
//!             ├── Router → StrategyEngine → CacheStore / Fetcher
//!             ├── Precacher, GarbageCollector
//!             ├── NotificationHandler → NotificationSink, WindowClients
//!             └── SyncRegistry
//!
//! CacheStore
//!     └── namespace "{app}-{static|dynamic|api}-{version}"
//!             └── request key → response snapshot
//! ```

pub mod clients;
pub mod config;
pub mod error;
pub mod gc;
pub mod namespace;
pub mod notification;
pub mod precache;
pub mod registration;
pub mod router;
pub mod storage;
pub mod strategy;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;

pub use clients::{Client, ClientMatchOptions, ClientType, Clients, WindowClients};
pub use config::{PrecacheRetry, WorkerConfig};
pub use error::{SwError, SwResult};
pub use gc::GarbageCollector;
pub use namespace::{namespace_name, CacheNamespace, NamespaceKind, VersionRegistry};
pub use notification::{
    ClickOutcome, MemoryNotificationSink, NotificationAction, NotificationClick,
    NotificationDescriptor, NotificationHandler, NotificationSink, PushPayload, DISMISS_ACTION,
};
pub use precache::{PrecacheReport, Precacher};
pub use registration::{Registration, RegistrationEvent, ServiceWorkerState, WorkerSlot};
pub use router::{PassthroughReason, Route, Router, RoutingRule, RulePredicate, Strategy};
pub use storage::{CacheStore, CachedEntry, MemoryCacheStore, ResponseSnapshot, WriteGate};
pub use strategy::{ResponseSource, Revalidation, StrategyEngine, StrategyResponse};
pub use sync::{SyncRegistry, SyncTable, SyncTask, REFRESH_CONTENT, SYNC_ANALYTICS, SYNC_POSTS};
pub use worker::{
    Dispatched, EventKind, EventOutcome, ServiceWorker, ServiceWorkerBuilder, WaitUntil,
    WorkerEvent, WorkerId, WorkerScope,
};
