//! Push notifications and notification clicks.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{Client, ClientMatchOptions, ClientType, WindowClients};
use crate::config::WorkerConfig;
use crate::error::SwResult;

/// Action id that closes the notification without opening anything.
pub const DISMISS_ACTION: &str = "dismiss";

/// A button shown on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Push payload as sent by the backend. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub tag: Option<String>,
    pub url: Option<String>,
    pub require_interaction: Option<bool>,
    pub actions: Option<Vec<NotificationAction>>,
}

impl PushPayload {
    /// Parse push data as a JSON object, or take the whole payload as the
    /// body text when it is not JSON.
    ///
    /// Fields are read one by one; a field with the wrong type is dropped
    /// and the rest are kept.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(data) = data else {
            return Self::default();
        };
        let value = match serde_json::from_slice::<Value>(data) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Push payload is not JSON, using it as body text");
                return Self::text(String::from_utf8_lossy(data).into_owned());
            }
        };

        match value {
            Value::Object(fields) => Self {
                title: field(&fields, "title"),
                body: field(&fields, "body"),
                icon: field(&fields, "icon"),
                badge: field(&fields, "badge"),
                tag: field(&fields, "tag"),
                url: field(&fields, "url"),
                require_interaction: field(&fields, "requireInteraction"),
                actions: field(&fields, "actions"),
            },
            Value::String(text) => Self::text(text),
            other => Self::text(other.to_string()),
        }
    }

    fn text(body: String) -> Self {
        Self {
            body: Some(body),
            ..Self::default()
        }
    }
}

fn field<T: DeserializeOwned>(fields: &Map<String, Value>, name: &str) -> Option<T> {
    let value = fields.get(name)?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!(field = name, error = %e, "Ignoring mistyped push field");
            None
        }
    }
}

/// A fully populated notification, ready to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationDescriptor {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    /// Where a click takes the user; relative to the app origin.
    pub url: String,
    pub require_interaction: bool,
    pub actions: Vec<NotificationAction>,
}

impl Default for NotificationDescriptor {
    fn default() -> Self {
        Self {
            title: "SocialBoostAI".to_string(),
            body: "You have a new update.".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/badge-72x72.png".to_string(),
            tag: "socialboost-notification".to_string(),
            url: "/".to_string(),
            require_interaction: false,
            actions: Vec::new(),
        }
    }
}

impl NotificationDescriptor {
    /// Overlay `payload` on `defaults`. A field present in the payload
    /// replaces the default; an absent one keeps it. `actions` is replaced
    /// as a whole, never merged item by item.
    pub fn merge(defaults: &Self, payload: PushPayload) -> Self {
        Self {
            title: payload.title.unwrap_or_else(|| defaults.title.clone()),
            body: payload.body.unwrap_or_else(|| defaults.body.clone()),
            icon: payload.icon.unwrap_or_else(|| defaults.icon.clone()),
            badge: payload.badge.unwrap_or_else(|| defaults.badge.clone()),
            tag: payload.tag.unwrap_or_else(|| defaults.tag.clone()),
            url: payload.url.unwrap_or_else(|| defaults.url.clone()),
            require_interaction: payload
                .require_interaction
                .unwrap_or(defaults.require_interaction),
            actions: payload.actions.unwrap_or_else(|| defaults.actions.clone()),
        }
    }
}

/// The host's OS notification surface.
pub trait NotificationSink: Send + Sync {
    fn show<'a>(&'a self, notification: &'a NotificationDescriptor) -> BoxFuture<'a, SwResult<()>>;

    fn close<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, SwResult<()>>;
}

/// Keeps shown notifications in memory.
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    visible: Mutex<Vec<NotificationDescriptor>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications currently on screen.
    pub async fn visible(&self) -> Vec<NotificationDescriptor> {
        self.visible.lock().await.clone()
    }
}

impl NotificationSink for MemoryNotificationSink {
    fn show<'a>(&'a self, notification: &'a NotificationDescriptor) -> BoxFuture<'a, SwResult<()>> {
        Box::pin(async move {
            let mut visible = self.visible.lock().await;
            // Same tag replaces the previous notification.
            visible.retain(|n| n.tag != notification.tag);
            visible.push(notification.clone());
            Ok(())
        })
    }

    fn close<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, SwResult<()>> {
        Box::pin(async move {
            self.visible.lock().await.retain(|n| n.tag != tag);
            Ok(())
        })
    }
}

/// A click on a shown notification.
#[derive(Debug, Clone)]
pub struct NotificationClick {
    pub notification: NotificationDescriptor,
    /// Action button id, `None` for a click on the body.
    pub action: Option<String>,
}

/// What a click led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// Closed only.
    Dismissed,
    /// An existing app window was navigated and focused.
    Focused(Client),
    /// No app window was open; a new one was opened.
    Opened(Client),
}

pub struct NotificationHandler {
    config: Arc<WorkerConfig>,
    sink: Arc<dyn NotificationSink>,
    clients: Arc<dyn WindowClients>,
}

impl NotificationHandler {
    pub fn new(
        config: Arc<WorkerConfig>,
        sink: Arc<dyn NotificationSink>,
        clients: Arc<dyn WindowClients>,
    ) -> Self {
        Self {
            config,
            sink,
            clients,
        }
    }

    /// Build the descriptor for a push and show it.
    pub async fn on_push(&self, data: Option<&[u8]>) -> SwResult<NotificationDescriptor> {
        let payload = PushPayload::parse(data);
        let notification = NotificationDescriptor::merge(&self.config.notification_defaults, payload);
        info!(tag = %notification.tag, title = %notification.title, "Showing notification");
        self.sink.show(&notification).await?;
        Ok(notification)
    }

    /// Close the notification and bring the app to its target URL, reusing
    /// a same-origin window when one is open.
    pub async fn on_click(&self, click: NotificationClick) -> SwResult<ClickOutcome> {
        let notification = click.notification;
        self.sink.close(&notification.tag).await?;

        if click.action.as_deref() == Some(DISMISS_ACTION) {
            debug!(tag = %notification.tag, "Notification dismissed");
            return Ok(ClickOutcome::Dismissed);
        }

        let target = self.click_target(&notification.url)?;
        let windows = self
            .clients
            .match_all(ClientMatchOptions {
                include_uncontrolled: true,
                client_type: ClientType::Window,
            })
            .await;

        let app_origin = self.config.origin.origin();
        if let Some(window) = windows.iter().find(|c| c.url.origin() == app_origin) {
            debug!(client = %window.id, url = %target, "Reusing open window");
            self.clients.navigate(&window.id, target).await?;
            let focused = self.clients.focus(&window.id).await?;
            return Ok(ClickOutcome::Focused(focused));
        }

        debug!(url = %target, "No app window open");
        let opened = self.clients.open_window(target).await?;
        Ok(ClickOutcome::Opened(opened))
    }

    /// Resolve a notification URL against the app origin. Targets on other
    /// origins are replaced by the default notification URL.
    fn click_target(&self, url: &str) -> SwResult<Url> {
        let target = self.config.resolve(url)?;
        if target.origin() == self.config.origin.origin() {
            return Ok(target);
        }
        warn!(url = %target, "Notification URL leaves the app origin, using default");
        self.config.resolve(&self.config.notification_defaults.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Clients;

    fn handler() -> (NotificationHandler, Arc<MemoryNotificationSink>, Arc<Clients>) {
        let sink = Arc::new(MemoryNotificationSink::new());
        let clients = Arc::new(Clients::new());
        let handler = NotificationHandler::new(
            Arc::new(WorkerConfig::default()),
            sink.clone(),
            clients.clone(),
        );
        (handler, sink, clients)
    }

    #[test]
    fn test_body_only_payload_keeps_defaults() {
        let payload = PushPayload::parse(Some(br#"{"body": "X"}"#));
        let merged = NotificationDescriptor::merge(&NotificationDescriptor::default(), payload);

        let expected = NotificationDescriptor {
            body: "X".to_string(),
            ..NotificationDescriptor::default()
        };
        assert_eq!(merged, expected);
        assert_eq!(merged.title, "SocialBoostAI");
    }

    #[test]
    fn test_full_payload_overrides() {
        let payload = PushPayload::parse(Some(
            br#"{
                "title": "Post published",
                "body": "Your LinkedIn post is live",
                "tag": "post-123",
                "url": "/posts/123",
                "requireInteraction": true,
                "actions": [{"action": "view", "title": "View"}]
            }"#,
        ));
        let merged = NotificationDescriptor::merge(&NotificationDescriptor::default(), payload);

        assert_eq!(merged.title, "Post published");
        assert_eq!(merged.tag, "post-123");
        assert!(merged.require_interaction);
        assert_eq!(merged.actions.len(), 1);
        assert_eq!(merged.icon, NotificationDescriptor::default().icon);
    }

    #[test]
    fn test_mistyped_field_keeps_the_others() {
        let payload = PushPayload::parse(Some(
            br#"{"title":"Post published","body":"Your post is live","tag":42}"#,
        ));
        let merged = NotificationDescriptor::merge(&NotificationDescriptor::default(), payload);

        assert_eq!(merged.title, "Post published");
        assert_eq!(merged.body, "Your post is live");
        assert_eq!(merged.tag, NotificationDescriptor::default().tag);
    }

    #[test]
    fn test_null_field_uses_default() {
        let payload = PushPayload::parse(Some(br#"{"title":null,"requireInteraction":"yes"}"#));
        assert!(payload.title.is_none());
        assert!(payload.require_interaction.is_none());
    }

    #[test]
    fn test_json_string_payload_becomes_body() {
        let payload = PushPayload::parse(Some(br#""Weekly report ready""#));
        assert_eq!(payload.body.as_deref(), Some("Weekly report ready"));
    }

    #[test]
    fn test_non_json_payload_becomes_body() {
        let payload = PushPayload::parse(Some(b"Weekly report ready"));
        assert_eq!(payload.body.as_deref(), Some("Weekly report ready"));
        assert!(payload.title.is_none());
    }

    #[test]
    fn test_missing_payload_is_all_defaults() {
        let merged =
            NotificationDescriptor::merge(&NotificationDescriptor::default(), PushPayload::parse(None));
        assert_eq!(merged, NotificationDescriptor::default());
    }

    #[tokio::test]
    async fn test_on_push_shows_notification() {
        let (handler, sink, _) = handler();
        let shown = handler.on_push(Some(b"plain text")).await.unwrap();

        assert_eq!(shown.body, "plain text");
        assert_eq!(sink.visible().await, vec![shown]);
    }

    #[tokio::test]
    async fn test_click_focuses_existing_window() {
        let (handler, sink, clients) = handler();
        let window = clients
            .add_window(Url::parse("http://localhost:3000/dashboard").unwrap())
            .await;
        let notification = handler
            .on_push(Some(br#"{"url": "/posts/9"}"#))
            .await
            .unwrap();

        let outcome = handler
            .on_click(NotificationClick {
                notification,
                action: None,
            })
            .await
            .unwrap();

        match outcome {
            ClickOutcome::Focused(client) => {
                assert_eq!(client.id, window.id);
                assert_eq!(client.url.path(), "/posts/9");
                assert!(client.focused);
            }
            other => panic!("expected focus, got {other:?}"),
        }
        assert_eq!(clients.len().await, 1);
        assert!(sink.visible().await.is_empty());
    }

    #[tokio::test]
    async fn test_click_ignores_other_origins() {
        let (handler, _, clients) = handler();
        clients
            .add_window(Url::parse("https://docs.example.com/").unwrap())
            .await;

        let outcome = handler
            .on_click(NotificationClick {
                notification: NotificationDescriptor::default(),
                action: None,
            })
            .await
            .unwrap();

        assert!(matches!(outcome, ClickOutcome::Opened(_)));
        assert_eq!(clients.len().await, 2);
    }

    #[tokio::test]
    async fn test_click_never_leaves_app_origin() {
        let (handler, _, clients) = handler();
        let window = clients
            .add_window(Url::parse("http://localhost:3000/dashboard").unwrap())
            .await;

        for url in ["//evil.example/login", "https://evil.example/login"] {
            let notification = handler
                .on_push(Some(format!(r#"{{"url":"{url}"}}"#).as_bytes()))
                .await
                .unwrap();
            let outcome = handler
                .on_click(NotificationClick {
                    notification,
                    action: None,
                })
                .await
                .unwrap();

            match outcome {
                ClickOutcome::Focused(client) => {
                    assert_eq!(client.id, window.id);
                    assert_eq!(client.url.as_str(), "http://localhost:3000/");
                }
                other => panic!("expected focus, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_dismiss_action_opens_nothing() {
        let (handler, sink, clients) = handler();
        let notification = handler.on_push(None).await.unwrap();

        let outcome = handler
            .on_click(NotificationClick {
                notification,
                action: Some(DISMISS_ACTION.to_string()),
            })
            .await
            .unwrap();

        assert_eq!(outcome, ClickOutcome::Dismissed);
        assert!(clients.is_empty().await);
        assert!(sink.visible().await.is_empty());
    }
}
