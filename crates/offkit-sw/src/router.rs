//! Request classification.
//!
//! Every intercepted request gets exactly one [`Route`]. Rules are a priority
//! list: the first matching rule wins no matter how many later rules would
//! also match.

use std::sync::Arc;

use http::Method;
use offkit_net::{any_matches, Request};
use tracing::trace;

use crate::config::WorkerConfig;
use crate::namespace::NamespaceKind;

/// A request-handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    NavigationFallback,
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkFirst => "network-first",
            Self::NavigationFallback => "navigation-fallback",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

/// Why a request was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    /// Different origin than the application.
    CrossOrigin,
    /// Only GET requests are cached.
    NonGetMethod,
    /// Path matches a no-cache pattern.
    NoCache,
    /// No active worker controls the scope.
    NoController,
}

/// What a rule checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePredicate {
    /// Path is under the API prefix.
    ApiPath,
    /// Last path segment has a static-asset extension.
    StaticAsset,
    /// Page navigation.
    Navigation,
    /// Matches every request.
    Always,
}

/// One entry of the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingRule {
    pub predicate: RulePredicate,
    pub strategy: Strategy,
    pub namespace: Option<NamespaceKind>,
}

/// Routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted; the request goes to the network untouched.
    Passthrough(PassthroughReason),
    /// Handled by a strategy.
    Handle {
        strategy: Strategy,
        namespace: Option<NamespaceKind>,
    },
}

/// Default rule table, in priority order.
pub const DEFAULT_RULES: [RoutingRule; 4] = [
    RoutingRule {
        predicate: RulePredicate::ApiPath,
        strategy: Strategy::NetworkFirst,
        namespace: Some(NamespaceKind::Api),
    },
    RoutingRule {
        predicate: RulePredicate::StaticAsset,
        strategy: Strategy::CacheFirst,
        namespace: Some(NamespaceKind::Static),
    },
    RoutingRule {
        predicate: RulePredicate::Navigation,
        strategy: Strategy::NavigationFallback,
        namespace: None,
    },
    RoutingRule {
        predicate: RulePredicate::Always,
        strategy: Strategy::StaleWhileRevalidate,
        namespace: Some(NamespaceKind::Dynamic),
    },
];

pub struct Router {
    config: Arc<WorkerConfig>,
    rules: Vec<RoutingRule>,
}

impl Router {
    pub fn new(config: Arc<WorkerConfig>) -> Self {
        Self {
            config,
            rules: DEFAULT_RULES.to_vec(),
        }
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Classify a request. Synchronous so the decision is made before the
    /// handler first suspends.
    pub fn route(&self, request: &Request) -> Route {
        let route = self.classify(request);
        trace!(url = %request.url, ?route, "Routed request");
        route
    }

    fn classify(&self, request: &Request) -> Route {
        if request.url.origin() != self.config.origin.origin() {
            return Route::Passthrough(PassthroughReason::CrossOrigin);
        }
        if request.method != Method::GET {
            return Route::Passthrough(PassthroughReason::NonGetMethod);
        }
        if any_matches(&self.config.no_cache_patterns, &request.url) {
            return Route::Passthrough(PassthroughReason::NoCache);
        }

        self.rules
            .iter()
            .find(|rule| self.matches(rule.predicate, request))
            .map(|rule| Route::Handle {
                strategy: rule.strategy,
                namespace: rule.namespace,
            })
            .unwrap_or(Route::Handle {
                strategy: Strategy::StaleWhileRevalidate,
                namespace: Some(NamespaceKind::Dynamic),
            })
    }

    fn matches(&self, predicate: RulePredicate, request: &Request) -> bool {
        match predicate {
            RulePredicate::ApiPath => request.url.path().starts_with(&self.config.api_prefix),
            RulePredicate::StaticAsset => self.is_static_asset(request.url.path()),
            RulePredicate::Navigation => request.is_navigation(),
            RulePredicate::Always => true,
        }
    }

    fn is_static_asset(&self, path: &str) -> bool {
        let file = path.rsplit('/').next().unwrap_or_default();
        match file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                let ext = ext.to_ascii_lowercase();
                self.config.static_extensions.iter().any(|e| *e == ext)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use url::Url;

    fn router() -> Router {
        Router::new(Arc::new(WorkerConfig::default()))
    }

    fn get(path: &str) -> Request {
        Request::get(Url::parse(&format!("http://localhost:3000{path}")).unwrap())
    }

    fn handled(strategy: Strategy, namespace: Option<NamespaceKind>) -> Route {
        Route::Handle { strategy, namespace }
    }

    #[test]
    fn test_cross_origin_passthrough() {
        let request = Request::get(Url::parse("https://cdn.example.com/app.js").unwrap());
        assert_eq!(
            router().route(&request),
            Route::Passthrough(PassthroughReason::CrossOrigin)
        );
    }

    #[test]
    fn test_same_host_different_port_is_cross_origin() {
        let request = Request::get(Url::parse("http://localhost:8000/api/posts").unwrap());
        assert_eq!(
            router().route(&request),
            Route::Passthrough(PassthroughReason::CrossOrigin)
        );
    }

    #[test]
    fn test_no_cache_patterns_never_intercepted() {
        let router = router();
        for path in [
            "/api/auth/login",
            "/api/auth/refresh",
            "/api/billing/checkout",
            "/ws",
            "/socket.io/?EIO=4",
        ] {
            assert_eq!(
                router.route(&get(path)),
                Route::Passthrough(PassthroughReason::NoCache),
                "{path}"
            );
        }
    }

    #[test]
    fn test_non_get_passthrough() {
        let url = Url::parse("http://localhost:3000/api/posts").unwrap();
        let request = Request::post(url, Bytes::from_static(b"{}"));
        assert_eq!(
            router().route(&request),
            Route::Passthrough(PassthroughReason::NonGetMethod)
        );
    }

    #[test]
    fn test_api_is_network_first() {
        assert_eq!(
            router().route(&get("/api/posts?page=2")),
            handled(Strategy::NetworkFirst, Some(NamespaceKind::Api))
        );
    }

    #[test]
    fn test_api_beats_static_extension() {
        assert_eq!(
            router().route(&get("/api/exports/report.png")),
            handled(Strategy::NetworkFirst, Some(NamespaceKind::Api))
        );
    }

    #[test]
    fn test_static_assets_cache_first() {
        let router = router();
        for path in ["/assets/app.3f2a.js", "/styles/main.CSS", "/fonts/inter.woff2"] {
            assert_eq!(
                router.route(&get(path)),
                handled(Strategy::CacheFirst, Some(NamespaceKind::Static)),
                "{path}"
            );
        }
    }

    #[test]
    fn test_static_extension_beats_navigation() {
        let url = Url::parse("http://localhost:3000/icons/icon-192x192.png").unwrap();
        assert_eq!(
            router().route(&Request::navigate(url)),
            handled(Strategy::CacheFirst, Some(NamespaceKind::Static))
        );
    }

    #[test]
    fn test_navigation() {
        let url = Url::parse("http://localhost:3000/dashboard/analytics").unwrap();
        assert_eq!(
            router().route(&Request::navigate(url)),
            handled(Strategy::NavigationFallback, None)
        );
    }

    #[test]
    fn test_everything_else_is_stale_while_revalidate() {
        let router = router();
        for path in ["/dashboard", "/manifest.json", "/.well-known", "/index.html"] {
            assert_eq!(
                router.route(&get(path)),
                handled(Strategy::StaleWhileRevalidate, Some(NamespaceKind::Dynamic)),
                "{path}"
            );
        }
    }

    #[test]
    fn test_rule_table_order() {
        let strategies: Vec<_> = router().rules().iter().map(|r| r.strategy).collect();
        assert_eq!(
            strategies,
            vec![
                Strategy::NetworkFirst,
                Strategy::CacheFirst,
                Strategy::NavigationFallback,
                Strategy::StaleWhileRevalidate,
            ]
        );
    }
}
