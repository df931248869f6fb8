//! Worker configuration
//!
//! Built once at worker startup and shared as `Arc<WorkerConfig>`. Nothing in
//! the worker reads cache names or patterns from anywhere else.

use std::path::Path;
use std::time::Duration;

use offkit_common::{OffkitError, RetryConfig};
use offkit_net::UrlPattern;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{SwError, SwResult};
use crate::notification::NotificationDescriptor;

const DEFAULT_ORIGIN: &str = "http://localhost:3000/";

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix of every cache namespace name
    pub app_id: String,

    /// Deployment version; changing it starts a new cache generation
    pub version: String,

    /// The application's own origin
    pub origin: Url,

    /// Path prefix of backend API calls
    pub api_prefix: String,

    /// Paths that are never intercepted (auth, billing, websocket upgrades)
    pub no_cache_patterns: Vec<UrlPattern>,

    /// File extensions (without dot, lowercase) served cache-first
    pub static_extensions: Vec<String>,

    /// API paths whose successful responses are kept for offline use
    pub cacheable_api_patterns: Vec<UrlPattern>,

    /// Static assets fetched during install
    pub precache_assets: Vec<String>,

    /// Precached document served to failed navigations
    pub offline_page: String,

    /// Message in the offline JSON error for API calls
    pub offline_message: String,

    /// Deadline for a single network fetch, in milliseconds
    pub fetch_timeout_ms: u64,

    /// Per-asset retry during precache
    pub precache_retry: PrecacheRetry,

    /// API paths re-fetched by the `refresh-content` periodic sync
    pub periodic_refresh_paths: Vec<String>,

    /// Descriptor that push payloads are merged over
    pub notification_defaults: NotificationDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecacheRetry {
    /// Attempts per asset (1 = no retries)
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    pub initial_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_id: "socialboost".to_string(),
            version: "v1".to_string(),
            origin: default_origin(),
            api_prefix: "/api/".to_string(),
            no_cache_patterns: vec![
                UrlPattern::prefix("/api/auth/"),
                UrlPattern::prefix("/api/billing/"),
                UrlPattern::prefix("/api/webhooks/"),
                UrlPattern::prefix("/ws"),
                UrlPattern::prefix("/socket.io/"),
            ],
            static_extensions: [
                "js", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2",
                "ttf", "eot",
            ]
            .iter()
            .map(|ext| ext.to_string())
            .collect(),
            cacheable_api_patterns: vec![
                UrlPattern::exact("/api/user/profile"),
                UrlPattern::prefix("/api/analytics/"),
                UrlPattern::prefix("/api/content/"),
                UrlPattern::prefix("/api/platforms"),
            ],
            precache_assets: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/offline.html".to_string(),
                "/manifest.json".to_string(),
                "/icons/icon-192x192.png".to_string(),
                "/icons/icon-512x512.png".to_string(),
            ],
            offline_page: "/offline.html".to_string(),
            offline_message:
                "You are offline. This data will be available once your connection is restored."
                    .to_string(),
            fetch_timeout_ms: 10_000,
            precache_retry: PrecacheRetry::default(),
            periodic_refresh_paths: vec![
                "/api/user/profile".to_string(),
                "/api/analytics/summary".to_string(),
            ],
            notification_defaults: NotificationDescriptor::default(),
        }
    }
}

impl Default for PrecacheRetry {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 250,
        }
    }
}

impl WorkerConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> SwResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            SwError::Common(OffkitError::config_with_source("invalid worker config", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> SwResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(OffkitError::from)?;
        tracing::debug!(path = %path.display(), "Loaded worker config");
        Self::from_json_str(&json)
    }

    /// Reject configurations the router or precache cannot work with.
    pub fn validate(&self) -> SwResult<()> {
        if self.app_id.trim().is_empty() {
            return Err(SwError::config("app_id must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(SwError::config("version must not be empty"));
        }
        if !self.api_prefix.starts_with('/') {
            return Err(SwError::config(format!(
                "api_prefix must start with '/': {}",
                self.api_prefix
            )));
        }
        if !self.precache_assets.iter().any(|a| a == &self.offline_page) {
            return Err(SwError::config(format!(
                "offline_page {} is not in precache_assets",
                self.offline_page
            )));
        }
        Ok(())
    }

    /// Resolve an app-relative path against the origin.
    pub fn resolve(&self, path: &str) -> SwResult<Url> {
        self.origin
            .join(path)
            .map_err(|e| SwError::config(format!("cannot resolve {path}: {e}")))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn precache_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.precache_retry.max_attempts,
            initial_delay: Duration::from_millis(self.precache_retry.initial_delay_ms),
            ..RetryConfig::default()
        }
    }
}

fn default_origin() -> Url {
    Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid URL")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(config.precache_retry().max_attempts, 1);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = WorkerConfig::from_json_str(
            r#"{"version": "v7", "origin": "https://app.socialboost.test/"}"#,
        )
        .unwrap();

        assert_eq!(config.version, "v7");
        assert_eq!(config.origin.as_str(), "https://app.socialboost.test/");
        assert_eq!(config.app_id, "socialboost");
        assert_eq!(config.offline_page, "/offline.html");
    }

    #[test]
    fn test_rejects_offline_page_missing_from_precache() {
        let err = WorkerConfig::from_json_str(r#"{"offline_page": "/missing.html"}"#).unwrap_err();
        assert!(matches!(err, SwError::Config(_)));
    }

    #[test]
    fn test_rejects_relative_api_prefix() {
        let config = WorkerConfig {
            api_prefix: "api/".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(WorkerConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"app_id": "boost", "version": "2024.06"}}"#).unwrap();

        let config = WorkerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.app_id, "boost");
        assert_eq!(config.version, "2024.06");
    }

    #[test]
    fn test_resolve() {
        let config = WorkerConfig::default();
        let url = config.resolve("/offline.html").unwrap();
        assert_eq!(url.as_str(), "http://localhost:3000/offline.html");
    }
}
