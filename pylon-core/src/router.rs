use crate::route::Route;
use dashmap::DashMap;
use matchit::Router as MatchitRouter;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Method key used for routes with no method constraint.
const ANY_METHOD: &str = "*";

/// High-performance router: exact-match hash maps for literal patterns,
/// radix tries (via `matchit`) for parameterized and wildcard patterns.
///
/// Match precedence at any depth is literal > parameter > wildcard: the
/// static maps are probed before the tries, and within a trie `matchit`
/// prefers static segments over `{param}` over `{*catch_all}`.
///
/// The compiled tree sits behind an `arc_swap::ArcSwap` so the hot path
/// never takes a lock; registration rebuilds and swaps atomically.
pub struct Router {
    /// Current compiled route tree
    inner: arc_swap::ArcSwap<CompiledRouter>,

    /// Source of truth: registered routes keyed by (method, pattern).
    /// Re-registering the same key overwrites (last wins).
    routes: DashMap<(String, String), StoredRoute>,

    /// Registration sequence, used for deterministic rebuild order.
    seq: AtomicU64,

    /// Monotonically-increasing version, bumped on every rebuild.
    /// Used by workers to invalidate their per-thread caches.
    version: AtomicU64,
}

#[derive(Clone)]
struct StoredRoute {
    route: Arc<Route>,
    seq: u64,
}

struct CompiledRouter {
    /// Literal patterns: method -> full path -> route. O(1) probe.
    static_by_method: HashMap<String, HashMap<String, Arc<Route>>>,
    static_any: HashMap<String, Arc<Route>>,

    /// Parameterized + wildcard patterns.
    dynamic_by_method: HashMap<String, MatchitRouter<Arc<Route>>>,
    dynamic_any: MatchitRouter<Arc<Route>>,
}

impl CompiledRouter {
    fn empty() -> Self {
        Self {
            static_by_method: HashMap::new(),
            static_any: HashMap::new(),
            dynamic_by_method: HashMap::new(),
            dynamic_any: MatchitRouter::new(),
        }
    }
}

/// Result of a route match.
#[derive(Debug)]
pub struct RouteMatch {
    pub route: Arc<Route>,

    /// Extracted path parameters. Empty (no allocation) for literal and
    /// parameter-free matches.
    pub params: Vec<(String, String)>,
}

/// Convert the route pattern syntax (`:name`, trailing `*`) into matchit
/// syntax (`{name}`, `{*rest}`).
fn to_matchit_pattern(pattern: &str) -> String {
    let (body, wildcard) = match pattern.strip_suffix('*') {
        Some(prefix) => (prefix, true),
        None => (pattern, false),
    };

    let mut out = String::with_capacity(pattern.len() + 8);
    for segment in body.split('/') {
        if segment.is_empty() {
            continue;
        }
        out.push('/');
        if let Some(name) = segment.strip_prefix(':') {
            out.push('{');
            out.push_str(name);
            out.push('}');
        } else {
            out.push_str(segment);
        }
    }
    if wildcard {
        out.push_str("/{*rest}");
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

impl Router {
    pub fn new() -> Self {
        Self {
            inner: arc_swap::ArcSwap::new(Arc::new(CompiledRouter::empty())),
            routes: DashMap::new(),
            seq: AtomicU64::new(0),
            version: AtomicU64::new(0),
        }
    }

    /// Build a router from a route list in one pass (startup path).
    pub fn build(routes: Vec<Route>) -> Self {
        let router = Self::new();
        for route in routes {
            router.insert_route(route);
        }
        router.rebuild();
        router
    }

    /// Returns the current route table version.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Register a route. Duplicate (method, pattern) pairs overwrite the
    /// earlier registration. Triggers recompilation of the route tree.
    pub fn register(&self, route: Route) {
        info!(route_id = %route.id, path = %route.path, "Registering route");
        self.insert_route(route);
        self.rebuild();
    }

    /// Remove every (method, pattern) entry belonging to a route id.
    pub fn remove(&self, route_id: &str) {
        self.routes.retain(|_, stored| stored.route.id != route_id);
        self.rebuild();
    }

    /// Number of (method, pattern) entries currently registered.
    pub fn entry_count(&self) -> usize {
        self.routes.len()
    }

    fn insert_route(&self, route: Route) {
        let route = Arc::new(route);
        let methods: Vec<String> = if route.methods.is_empty() {
            vec![ANY_METHOD.to_string()]
        } else {
            route.methods.iter().map(|m| m.as_str().to_string()).collect()
        };
        for method in methods {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            self.routes.insert(
                (method, route.path.clone()),
                StoredRoute {
                    route: Arc::clone(&route),
                    seq,
                },
            );
        }
    }

    /// Match an incoming request.
    ///
    /// Paths are compared byte-for-byte (case-sensitive); the caller is
    /// responsible for normalizing the method to uppercase at the wire
    /// parsing boundary.
    #[inline]
    pub fn match_route(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let compiled = self.inner.load();

        // 1. Literal, method-specific
        if let Some(map) = compiled.static_by_method.get(method)
            && let Some(route) = map.get(path)
        {
            return Some(RouteMatch {
                route: Arc::clone(route),
                params: Vec::new(),
            });
        }

        // 2. Literal, any-method
        if let Some(route) = compiled.static_any.get(path) {
            return Some(RouteMatch {
                route: Arc::clone(route),
                params: Vec::new(),
            });
        }

        // 3. Radix trie, method-specific
        if let Some(trie) = compiled.dynamic_by_method.get(method)
            && let Ok(matched) = trie.at(path)
        {
            return Some(RouteMatch {
                route: Arc::clone(matched.value),
                params: collect_params(&matched.params),
            });
        }

        // 4. Radix trie, any-method
        if let Ok(matched) = compiled.dynamic_any.at(path) {
            return Some(RouteMatch {
                route: Arc::clone(matched.value),
                params: collect_params(&matched.params),
            });
        }

        None
    }

    /// Rebuild the compiled tree from the route table and swap it in.
    ///
    /// Ordering: priority descending, then registration order. The first
    /// insertion of a conflicting pattern wins, so higher-priority routes
    /// shadow lower-priority ones.
    pub fn rebuild(&self) {
        let mut entries: Vec<((String, String), StoredRoute)> = self
            .routes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| {
            b.1.route
                .priority
                .cmp(&a.1.route.priority)
                .then(a.1.seq.cmp(&b.1.seq))
        });

        let mut compiled = CompiledRouter::empty();

        for ((method, pattern), stored) in entries {
            let route = stored.route;
            if !route.enabled {
                continue;
            }

            if route.is_literal() {
                let map = if method == ANY_METHOD {
                    &mut compiled.static_any
                } else {
                    compiled.static_by_method.entry(method).or_default()
                };
                map.entry(pattern).or_insert(route);
            } else {
                let converted = to_matchit_pattern(&pattern);
                let trie = if method == ANY_METHOD {
                    &mut compiled.dynamic_any
                } else {
                    compiled
                        .dynamic_by_method
                        .entry(method)
                        .or_insert_with(MatchitRouter::new)
                };
                if let Err(e) = trie.insert(&converted, route) {
                    warn!(pattern = %pattern, error = %e, "Failed to insert route into trie");
                }
            }
        }

        self.inner.store(Arc::new(compiled));
        self.version.fetch_add(1, Ordering::Release);
        info!(entries = self.routes.len(), "Router rebuilt");
    }
}

#[inline]
fn collect_params(params: &matchit::Params<'_, '_>) -> Vec<(String, String)> {
    if params.is_empty() {
        return Vec::new();
    }
    params
        .iter()
        .filter(|(k, _)| *k != "rest")
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
