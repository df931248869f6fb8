//! Version registry and cache namespace naming.
//!
//! A namespace name is `{app_id}-{kind}-{version}`. Bumping the version is
//! the only way to start a new cache generation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::WorkerConfig;

/// Which partition of the cache a namespace is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// Precached and cache-first static assets.
    Static,
    /// Stale-while-revalidate responses.
    Dynamic,
    /// Network-first API responses.
    Api,
}

impl NamespaceKind {
    pub const ALL: [NamespaceKind; 3] = [Self::Static, Self::Dynamic, Self::Api];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named cache partition for one (kind, version).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamespace {
    pub name: String,
    pub version: String,
    pub kind: NamespaceKind,
}

impl CacheNamespace {
    pub fn new(app_id: &str, kind: NamespaceKind, version: &str) -> Self {
        Self {
            name: namespace_name(app_id, kind, version),
            version: version.to_string(),
            kind,
        }
    }
}

/// Derive a namespace name.
pub fn namespace_name(app_id: &str, kind: NamespaceKind, version: &str) -> String {
    format!("{app_id}-{kind}-{version}")
}

/// The current version and its three namespaces.
#[derive(Debug, Clone)]
pub struct VersionRegistry {
    app_id: String,
    version: String,
    namespaces: [CacheNamespace; 3],
}

impl VersionRegistry {
    pub fn new(app_id: &str, version: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            version: version.to_string(),
            namespaces: NamespaceKind::ALL.map(|kind| CacheNamespace::new(app_id, kind, version)),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(&config.app_id, &config.version)
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn namespace(&self, kind: NamespaceKind) -> &CacheNamespace {
        match kind {
            NamespaceKind::Static => &self.namespaces[0],
            NamespaceKind::Dynamic => &self.namespaces[1],
            NamespaceKind::Api => &self.namespaces[2],
        }
    }

    /// Name of the current namespace of `kind`.
    pub fn name(&self, kind: NamespaceKind) -> &str {
        &self.namespace(kind).name
    }

    pub fn current_names(&self) -> Vec<&str> {
        self.namespaces.iter().map(|ns| ns.name.as_str()).collect()
    }

    /// Whether `name` belongs to the current version.
    pub fn is_current(&self, name: &str) -> bool {
        self.namespaces.iter().any(|ns| ns.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_names() {
        let registry = VersionRegistry::new("socialboost", "v3");
        assert_eq!(registry.name(NamespaceKind::Static), "socialboost-static-v3");
        assert_eq!(registry.name(NamespaceKind::Dynamic), "socialboost-dynamic-v3");
        assert_eq!(registry.name(NamespaceKind::Api), "socialboost-api-v3");
    }

    #[test]
    fn test_is_current() {
        let registry = VersionRegistry::new("socialboost", "v3");
        assert!(registry.is_current("socialboost-api-v3"));
        assert!(!registry.is_current("socialboost-api-v2"));
        assert!(!registry.is_current("other-api-v3"));
    }

    #[test]
    fn test_namespace_carries_kind_and_version() {
        let registry = VersionRegistry::new("socialboost", "v3");
        let ns = registry.namespace(NamespaceKind::Dynamic);
        assert_eq!(ns.kind, NamespaceKind::Dynamic);
        assert_eq!(ns.version, "v3");
        assert_eq!(registry.current_names().len(), 3);
    }

    #[test]
    fn test_from_config() {
        let config = WorkerConfig {
            version: "2024.11".to_string(),
            ..Default::default()
        };
        let registry = VersionRegistry::from_config(&config);
        assert_eq!(registry.version(), "2024.11");
        assert_eq!(registry.app_id(), "socialboost");
    }
}
