//! Ordered route table with deterministic matching.
//!
//! A route matches when every configured predicate passes: method in the
//! method set (or the set is absent), host matches the host pattern (or
//! absent), and the path matches the path pattern. Among multiple matches,
//! highest priority wins, ties break on longest literal path prefix, and
//! remaining ties on lexicographic route id — so the table is pre-sorted
//! once on that key and matching is a first-hit scan. The table never
//! changes while the runtime is running.

use http::Method;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    /// `/api/*` — matches `/api` and everything under `/api/`.
    Prefix(String),
}

impl PathPattern {
    /// Parse an exact path or a `/*`-suffixed prefix pattern.
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix("/*") {
            Some(base) => PathPattern::Prefix(base.to_string()),
            None => PathPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(p) => path == p,
            PathPattern::Prefix(base) => {
                if base.is_empty() {
                    return path.starts_with('/');
                }
                path == base
                    || (path.len() > base.len()
                        && path.starts_with(base.as_str())
                        && path.as_bytes()[base.len()] == b'/')
            }
        }
    }

    /// Length of the literal portion, the second tie-break key.
    pub fn literal_prefix_len(&self) -> usize {
        match self {
            PathPattern::Exact(p) => p.len(),
            PathPattern::Prefix(base) => base.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub pattern: PathPattern,
    pub methods: Option<HashSet<Method>>,
    pub host_pattern: Option<String>,
    pub priority: i32,
    pub enabled: bool,
    pub group_id: String,
    pub metadata: HashMap<String, String>,
}

impl Route {
    fn matches(&self, host: &str, path: &str, method: &Method) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.contains(method) {
                return false;
            }
        }
        if let Some(pattern) = &self.host_pattern {
            if !host_matches(host, pattern) {
                return false;
            }
        }
        self.pattern.matches(path)
    }
}

pub struct RouteTable {
    /// Sorted by (priority desc, literal prefix len desc, id asc).
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        let mut routes: Vec<Arc<Route>> = routes
            .into_iter()
            .filter(|r| r.enabled)
            .map(Arc::new)
            .collect();
        routes.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| {
                    b.pattern
                        .literal_prefix_len()
                        .cmp(&a.pattern.literal_prefix_len())
                })
                .then_with(|| a.id.cmp(&b.id))
        });
        info!("routing: compiled route table, count={}", routes.len());
        Self { routes }
    }

    /// Deterministic first match in precedence order.
    pub fn match_route(&self, host: &str, path: &str, method: &Method) -> Option<Arc<Route>> {
        let host = host.split(':').next().unwrap_or(host);
        self.routes
            .iter()
            .find(|r| r.matches(host, path, method))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}

/// Host pattern match: exact (case-insensitive), `*.example.com` suffix
/// wildcard, or `api.*` prefix wildcard.
fn host_matches(req_host: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        req_host.len() >= suffix.len()
            && req_host[req_host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        req_host.len() >= prefix.len() && req_host[..prefix.len()].eq_ignore_ascii_case(prefix)
    } else {
        req_host.eq_ignore_ascii_case(pattern)
    }
}
