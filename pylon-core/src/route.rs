use serde::{Deserialize, Serialize};

/// A Route defines how incoming requests are matched and dispatched.
///
/// Patterns support three forms:
///   - literal:       `/api/health`
///   - parameterized: `/users/:id` (each `:name` binds one path segment)
///   - wildcard:      `/static/*` (trailing `*` matches the remainder)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Unique route identifier
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Path pattern (see module docs for syntax)
    pub path: String,

    /// Allowed HTTP methods (empty = all methods)
    #[serde(default)]
    pub methods: Vec<HttpMethod>,

    /// Priority (higher = matched first when rebuilding, default 0)
    #[serde(default)]
    pub priority: i32,

    /// Whether this route is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Pin dispatch to a single named upstream; `None` = load-balance
    /// across the whole upstream set.
    #[serde(default)]
    pub upstream_id: Option<String>,

    /// Response caching policy for this route
    #[serde(default)]
    pub cache: Option<RouteCachePolicy>,

    /// Per-route timeout overrides (milliseconds)
    #[serde(default)]
    pub timeout: Option<RouteTimeouts>,
}

/// HTTP methods supported by routes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// Per-route response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCachePolicy {
    /// Time-to-live in seconds.
    pub ttl_secs: u64,

    /// Stale-while-revalidate grace window in seconds.
    #[serde(default)]
    pub stale_while_revalidate_secs: Option<u64>,
}

/// Per-route timeout overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTimeouts {
    /// End-to-end request budget, including retries.
    #[serde(default)]
    pub request_ms: Option<u64>,

    /// Single upstream attempt budget.
    #[serde(default)]
    pub upstream_ms: Option<u64>,
}

impl Route {
    /// Check if a given HTTP method is allowed by this route.
    pub fn method_allowed(&self, method: &str) -> bool {
        if self.methods.is_empty() {
            return true;
        }
        self.methods.iter().any(|m| m.as_str() == method)
    }

    /// True if the pattern contains no `:param` segments and no wildcard.
    pub fn is_literal(&self) -> bool {
        !self.path.contains(':') && !self.path.ends_with('*')
    }

    /// True if the pattern ends in a `*` wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.path.ends_with('*')
    }
}

fn default_enabled() -> bool {
    true
}
