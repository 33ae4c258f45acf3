use pylon_core::error::GatewayError;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The distinct operations that carry their own budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Waiting for a pooled/new connection.
    Connection,
    /// End-to-end request, including retries.
    Request,
    /// A single upstream attempt.
    Upstream,
    /// One plugin hook.
    Plugin,
    /// Keep-alive idle.
    Idle,
}

impl TimeoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::Connection => "connection",
            TimeoutKind::Request => "request",
            TimeoutKind::Upstream => "upstream",
            TimeoutKind::Plugin => "plugin",
            TimeoutKind::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub connection: Duration,
    pub request: Duration,
    pub upstream: Duration,
    pub plugin: Duration,
    pub idle: Duration,

    /// Handles older than this are reported as leaks.
    pub leak_threshold: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection: Duration::from_secs(5),
            request: Duration::from_secs(30),
            upstream: Duration::from_secs(15),
            plugin: Duration::from_secs(1),
            idle: Duration::from_secs(65),
            leak_threshold: Duration::from_secs(120),
        }
    }
}

// ── Cancellation ──────────────────────────────────────────────

#[derive(Default)]
struct CancelInner {
    cancelled: bool,
    wakers: Vec<Waker>,
}

/// Worker-local cooperative cancellation signal.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Rc<RefCell<CancelInner>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let wakers = {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            std::mem::take(&mut inner.wakers)
        };
        for w in wakers {
            w.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.borrow().cancelled
    }

    /// Resolves when the token is cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
        }
    }
}

pub struct Cancelled {
    token: CancelToken,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.token.inner.borrow_mut();
        if inner.cancelled {
            Poll::Ready(())
        } else {
            inner.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// A tracked cancellation handle for one long-running operation.
pub struct CancelHandle {
    pub id: u64,
    pub token: CancelToken,
}

struct TrackedHandle {
    kind: TimeoutKind,
    created_at: Instant,
    token: CancelToken,
}

// ── Timeout manager ───────────────────────────────────────────

/// Hierarchical timeout driver. Wraps operations in the budget for
/// their kind and maps expiry to the typed error taxonomy.
#[derive(Clone)]
pub struct TimeoutManager {
    config: Rc<TimeoutConfig>,
    handles: Rc<RefCell<HashMap<u64, TrackedHandle>>>,
    next_id: Rc<Cell<u64>>,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config: Rc::new(config),
            handles: Rc::new(RefCell::new(HashMap::new())),
            next_id: Rc::new(Cell::new(0)),
        }
    }

    pub fn duration(&self, kind: TimeoutKind) -> Duration {
        match kind {
            TimeoutKind::Connection => self.config.connection,
            TimeoutKind::Request => self.config.request,
            TimeoutKind::Upstream => self.config.upstream,
            TimeoutKind::Plugin => self.config.plugin,
            TimeoutKind::Idle => self.config.idle,
        }
    }

    /// Run `fut` under the budget for `kind` (or `custom`), mapping
    /// expiry to the matching typed error.
    pub async fn execute<T, F>(
        &self,
        kind: TimeoutKind,
        custom: Option<Duration>,
        fut: F,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = T>,
    {
        let budget = custom.unwrap_or_else(|| self.duration(kind));
        match monoio::time::timeout(budget, fut).await {
            Ok(v) => Ok(v),
            Err(_) => Err(timeout_error(kind, budget)),
        }
    }

    /// Create a tracked cancellation handle for a long operation.
    pub fn create_handle(&self, kind: TimeoutKind) -> CancelHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let token = CancelToken::new();
        self.handles.borrow_mut().insert(
            id,
            TrackedHandle {
                kind,
                created_at: Instant::now(),
                token: token.clone(),
            },
        );
        CancelHandle { id, token }
    }

    /// Mark a handle finished; it stops being tracked.
    pub fn complete(&self, id: u64) {
        self.handles.borrow_mut().remove(&id);
    }

    /// Cancel a single handle.
    pub fn cancel(&self, id: u64) {
        if let Some(h) = self.handles.borrow_mut().remove(&id) {
            h.token.cancel();
            debug!(id, kind = h.kind.as_str(), "Handle cancelled");
        }
    }

    /// Cancel everything (shutdown path).
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<TrackedHandle> =
            self.handles.borrow_mut().drain().map(|(_, h)| h).collect();
        for h in &drained {
            h.token.cancel();
        }
        drained.len()
    }

    pub fn active_handles(&self) -> usize {
        self.handles.borrow().len()
    }

    /// Report handle ids older than the leak threshold.
    pub fn leaked(&self) -> Vec<u64> {
        let now = Instant::now();
        let leaked: Vec<u64> = self
            .handles
            .borrow()
            .iter()
            .filter(|(_, h)| now.saturating_duration_since(h.created_at) > self.config.leak_threshold)
            .map(|(id, _)| *id)
            .collect();
        if !leaked.is_empty() {
            warn!(count = leaked.len(), "Leaked timeout handles detected");
        }
        leaked
    }
}

fn timeout_error(kind: TimeoutKind, budget: Duration) -> GatewayError {
    let ms = budget.as_millis() as u64;
    match kind {
        TimeoutKind::Connection | TimeoutKind::Idle => GatewayError::ConnectionTimeout { ms },
        TimeoutKind::Request => GatewayError::RequestTimeout { ms },
        TimeoutKind::Upstream => GatewayError::UpstreamTimeout { ms },
        TimeoutKind::Plugin => GatewayError::PluginTimeout {
            plugin: "unnamed".to_string(),
            hook: "execute".to_string(),
            ms,
        },
    }
}

// ── Cleanup manager ───────────────────────────────────────────

/// Kinds of per-request resources the cleanup manager tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Timer,
    Stream,
    Listener,
    Controller,
}

struct TrackedResource {
    kind: ResourceKind,
    token: CancelToken,
}

/// Tracks cancellable resources per request id and releases them all on
/// every exit path. The contract: no resource outlives its request.
#[derive(Clone, Default)]
pub struct CleanupManager {
    resources: Rc<RefCell<HashMap<String, Vec<TrackedResource>>>>,
}

impl CleanupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str, kind: ResourceKind, token: CancelToken) {
        self.resources
            .borrow_mut()
            .entry(request_id.to_string())
            .or_default()
            .push(TrackedResource { kind, token });
    }

    /// Cancel and forget every resource owned by `request_id`.
    pub fn cleanup_request(&self, request_id: &str) -> usize {
        match self.resources.borrow_mut().remove(request_id) {
            Some(resources) => {
                for r in &resources {
                    r.token.cancel();
                }
                resources.len()
            }
            None => 0,
        }
    }

    /// Cancel everything across all requests.
    pub fn shutdown(&self) -> usize {
        let all: Vec<TrackedResource> = self
            .resources
            .borrow_mut()
            .drain()
            .flat_map(|(_, v)| v)
            .collect();
        for r in &all {
            r.token.cancel();
        }
        all.len()
    }

    pub fn tracked_requests(&self) -> usize {
        self.resources.borrow().len()
    }

    /// Count of tracked resources of one kind (diagnostics).
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.resources
            .borrow()
            .values()
            .flat_map(|v| v.iter())
            .filter(|r| r.kind == kind)
            .count()
    }
}
