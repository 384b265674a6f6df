//! Path-prefix routing from tunnel requests to local upstreams

use url::Url;

use crate::config::{ConfigError, ProxyRule};

#[derive(Debug, Clone)]
struct Route {
    prefix: String,
    upstream: Url,
    host: Option<String>,
    description: String,
}

impl Route {
    /// Remainder of `path` after this route's prefix, if the prefix matches
    /// on a segment boundary
    fn strip<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.prefix == "/" {
            return Some(path);
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// The matched route prefix
    pub route: String,
    /// Full upstream URL including the rewritten path and original query
    pub upstream: Url,
    /// Host header override
    pub host: Option<String>,
}

impl RouteMatch {
    /// `host:port` of the upstream, used as the connection pool key
    pub fn authority(&self) -> String {
        let host = self.upstream.host_str().unwrap_or_default();
        match self.upstream.port_or_known_default() {
            Some(port) => format!("{}://{}:{}", self.upstream.scheme(), host, port),
            None => format!("{}://{}", self.upstream.scheme(), host),
        }
    }

    /// Origin-form request target (`/path?query`)
    pub fn path_and_query(&self) -> String {
        match self.upstream.query() {
            Some(query) => format!("{}?{}", self.upstream.path(), query),
            None => self.upstream.path().to_string(),
        }
    }
}

/// Longest-prefix router over the enabled proxy rules
#[derive(Debug, Clone, Default)]
pub struct ProxyRouter {
    routes: Vec<Route>,
}

impl ProxyRouter {
    pub fn new(rules: &[ProxyRule]) -> Result<Self, ConfigError> {
        let mut routes = Vec::new();

        for (index, rule) in rules.iter().enumerate() {
            if !rule.enabled {
                continue;
            }

            let invalid = |reason: String| ConfigError::InvalidRule { index, reason };

            let prefix = normalize_prefix(&rule.route);
            let mut upstream = Url::parse(rule.local_remote.trim())
                .map_err(|e| invalid(format!("invalid localRemote: {}", e)))?;

            let scheme = match upstream.scheme() {
                "http" | "ws" => "http",
                "https" | "wss" => "https",
                other => return Err(invalid(format!("unsupported scheme {:?}", other))),
            };
            upstream
                .set_scheme(scheme)
                .map_err(|_| invalid(format!("cannot map scheme to {}", scheme)))?;

            routes.push(Route {
                prefix,
                upstream,
                host: rule.host.clone().filter(|h| !h.trim().is_empty()),
                description: rule.description.clone(),
            });
        }

        // Longest prefix first; ties keep config order
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self { routes })
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Pick the route for a request path and build its upstream URL
    pub fn resolve(&self, path: &str, query: Option<&str>) -> Option<RouteMatch> {
        let path = if path.is_empty() { "/" } else { path };

        let (route, rest) = self
            .routes
            .iter()
            .find_map(|route| route.strip(path).map(|rest| (route, rest)))?;

        let base = route.upstream.path().trim_end_matches('/');
        let rest = if rest.is_empty() { "/" } else { rest };

        let mut upstream = route.upstream.clone();
        upstream.set_path(&format!("{}{}", base, rest));
        upstream.set_query(query);
        upstream.set_fragment(None);

        tracing::trace!(
            "Routed {} via {:?} ({}) to {}",
            path,
            route.prefix,
            route.description,
            upstream
        );

        Some(RouteMatch {
            route: route.prefix.clone(),
            upstream,
            host: route.host.clone(),
        })
    }
}

fn normalize_prefix(route: &str) -> String {
    let trimmed = route.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(route: &str, remote: &str) -> ProxyRule {
        ProxyRule {
            host: None,
            route: route.to_string(),
            local_remote: remote.to_string(),
            description: String::new(),
            enabled: true,
        }
    }

    fn router(rules: Vec<ProxyRule>) -> ProxyRouter {
        ProxyRouter::new(&rules).unwrap()
    }

    #[test]
    fn test_prefix_is_stripped() {
        let router = router(vec![rule("/api", "http://127.0.0.1:8080")]);

        let m = router.resolve("/api/ping", None).unwrap();
        assert_eq!(m.upstream.as_str(), "http://127.0.0.1:8080/ping");
        assert_eq!(m.path_and_query(), "/ping");
        assert_eq!(m.authority(), "http://127.0.0.1:8080");

        let m = router.resolve("/api", Some("x=1")).unwrap();
        assert_eq!(m.path_and_query(), "/?x=1");
    }

    #[test]
    fn test_prefix_matches_on_segment_boundary() {
        let router = router(vec![rule("/api", "http://127.0.0.1:8080")]);
        assert!(router.resolve("/apix", None).is_none());
        assert!(router.resolve("/", None).is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = router(vec![
            rule("/", "http://127.0.0.1:3000"),
            rule("/api", "http://127.0.0.1:8080"),
            rule("/api/admin/", "http://127.0.0.1:9090/internal"),
        ]);

        let m = router.resolve("/api/admin/users", Some("page=2")).unwrap();
        assert_eq!(m.route, "/api/admin");
        assert_eq!(m.path_and_query(), "/internal/users?page=2");

        let m = router.resolve("/api/users", None).unwrap();
        assert_eq!(m.upstream.port(), Some(8080));

        let m = router.resolve("/index.html", None).unwrap();
        assert_eq!(m.route, "/");
        assert_eq!(m.upstream.as_str(), "http://127.0.0.1:3000/index.html");
    }

    #[test]
    fn test_upstream_base_path_is_joined() {
        let router = router(vec![rule("/", "http://127.0.0.1:3000/app/")]);
        let m = router.resolve("/static/main.js", None).unwrap();
        assert_eq!(m.path_and_query(), "/app/static/main.js");
    }

    #[test]
    fn test_websocket_remote_maps_to_http() {
        let router = router(vec![
            rule("/ws", "ws://127.0.0.1:4000"),
            rule("/wss", "wss://backend.local"),
        ]);

        let m = router.resolve("/ws/live", None).unwrap();
        assert_eq!(m.upstream.scheme(), "http");

        let m = router.resolve("/wss/live", None).unwrap();
        assert_eq!(m.upstream.scheme(), "https");
        assert_eq!(m.authority(), "https://backend.local:443");
    }

    #[test]
    fn test_disabled_rules_and_host_override() {
        let mut disabled = rule("/old", "http://127.0.0.1:1");
        disabled.enabled = false;
        let mut with_host = rule("/", "http://127.0.0.1:3000");
        with_host.host = Some("frontend.local".to_string());

        let router = router(vec![disabled, with_host]);
        let m = router.resolve("/old/page", None).unwrap();
        assert_eq!(m.route, "/");
        assert_eq!(m.host.as_deref(), Some("frontend.local"));
    }

    #[test]
    fn test_empty_router() {
        let router = ProxyRouter::default();
        assert!(router.is_empty());
        assert!(router.resolve("/", None).is_none());
    }
}
