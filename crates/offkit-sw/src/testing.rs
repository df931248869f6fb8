//! Scripted network double for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use hashbrown::HashMap;
use http::StatusCode;
use offkit_net::{Fetcher, NetError, Request, Response};

/// Answers by URL path; unknown paths get a 404.
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, (StatusCode, String)>>,
    failing: Mutex<Vec<String>>,
    offline: AtomicBool,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, path: &str, status: StatusCode, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.to_string()));
    }

    /// Make a single path fail at the network level.
    pub fn fail(&self, path: &str) {
        self.failing.lock().unwrap().push(path.to_string());
    }

    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn go_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let path = request.url.path().to_string();
            if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&path) {
                return Err(NetError::Offline(path));
            }

            let routes = self.routes.lock().unwrap();
            let response = match routes.get(&path) {
                Some((status, body)) => Response::new(*status, body.clone()),
                None => Response::new(StatusCode::NOT_FOUND, "not found"),
            };
            Ok(Response {
                url: Some(request.url),
                ..response
            })
        })
    }
}
