//! Application windows the worker can see.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::error::{SwError, SwResult};

/// A window or worker context of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Current URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Whether this worker controls it.
    pub controlled: bool,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// Options for [`WindowClients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// The host's view of open application contexts.
pub trait WindowClients: Send + Sync {
    fn match_all(&self, options: ClientMatchOptions) -> BoxFuture<'_, Vec<Client>>;

    fn focus<'a>(&'a self, id: &'a str) -> BoxFuture<'a, SwResult<Client>>;

    fn navigate<'a>(&'a self, id: &'a str, url: Url) -> BoxFuture<'a, SwResult<Client>>;

    fn open_window(&self, url: Url) -> BoxFuture<'_, SwResult<Client>>;

    /// Take control of every uncontrolled client. Returns how many were
    /// claimed.
    fn claim(&self) -> BoxFuture<'_, SwResult<usize>>;
}

/// In-memory client registry.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<String, Client>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing window (not controlled until claimed).
    pub async fn add_window(&self, url: Url) -> Client {
        self.add(url, ClientType::Window).await
    }

    /// Register a dedicated worker started by the app.
    pub async fn add_worker(&self, url: Url) -> Client {
        self.add(url, ClientType::Worker).await
    }

    async fn add(&self, url: Url, client_type: ClientType) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            client_type,
            focused: false,
            controlled: false,
        };
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        client
    }

    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

fn ensure_window(clients: &HashMap<String, Client>, id: &str) -> SwResult<()> {
    match clients.get(id) {
        None => Err(SwError::client(format!("no client {id}"))),
        Some(c) if c.client_type != ClientType::Window => Err(SwError::client(format!(
            "client {id} is not a window"
        ))),
        Some(_) => Ok(()),
    }
}

impl WindowClients for Clients {
    fn match_all(&self, options: ClientMatchOptions) -> BoxFuture<'_, Vec<Client>> {
        Box::pin(async move {
            self.clients
                .read()
                .await
                .values()
                .filter(|c| options.include_uncontrolled || c.controlled)
                .filter(|c| match options.client_type {
                    ClientType::All => true,
                    t => c.client_type == t,
                })
                .cloned()
                .collect()
        })
    }

    fn focus<'a>(&'a self, id: &'a str) -> BoxFuture<'a, SwResult<Client>> {
        Box::pin(async move {
            let mut clients = self.clients.write().await;
            ensure_window(&clients, id)?;

            let mut focused = None;
            for client in clients.values_mut() {
                client.focused = client.id == id;
                if client.focused {
                    focused = Some(client.clone());
                }
            }
            focused.ok_or_else(|| SwError::client(format!("no client {id}")))
        })
    }

    fn navigate<'a>(&'a self, id: &'a str, url: Url) -> BoxFuture<'a, SwResult<Client>> {
        Box::pin(async move {
            debug!(client = id, url = %url, "Navigating client");
            let mut clients = self.clients.write().await;
            ensure_window(&clients, id)?;
            let client = clients
                .get_mut(id)
                .ok_or_else(|| SwError::client(format!("no client {id}")))?;
            client.url = url;
            Ok(client.clone())
        })
    }

    fn open_window(&self, url: Url) -> BoxFuture<'_, SwResult<Client>> {
        Box::pin(async move {
            debug!(url = %url, "Opening window");
            let client = Client {
                id: next_client_id(),
                url,
                client_type: ClientType::Window,
                focused: true,
                controlled: true,
            };
            let mut clients = self.clients.write().await;
            for other in clients.values_mut() {
                other.focused = false;
            }
            clients.insert(client.id.clone(), client.clone());
            Ok(client)
        })
    }

    fn claim(&self) -> BoxFuture<'_, SwResult<usize>> {
        Box::pin(async move {
            let mut clients = self.clients.write().await;
            let mut claimed = 0;
            for client in clients.values_mut().filter(|c| !c.controlled) {
                client.controlled = true;
                claimed += 1;
            }
            Ok(claimed)
        })
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
