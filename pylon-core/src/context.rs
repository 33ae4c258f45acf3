use crate::route::Route;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

// ── Headers ───────────────────────────────────────────────────

/// Case-insensitive header multimap. Keys are stored lowercase; values
/// keep their wire form. Repeated headers accumulate into a list.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    map: HashMap<String, HeaderEntry>,
}

#[derive(Debug, Clone)]
pub enum HeaderEntry {
    One(String),
    Many(Vec<String>),
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for a header, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        match self.lookup(name)? {
            HeaderEntry::One(v) => Some(v.as_str()),
            HeaderEntry::Many(vs) => vs.first().map(String::as_str),
        }
    }

    /// All values for a header.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        match self.lookup(name) {
            Some(HeaderEntry::One(v)) => vec![v.as_str()],
            Some(HeaderEntry::Many(vs)) => vs.iter().map(String::as_str).collect(),
            None => Vec::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<&HeaderEntry> {
        if name.chars().all(|c| c.is_ascii_lowercase() || !c.is_ascii_alphabetic()) {
            return self.map.get(name);
        }
        self.map.get(&name.to_ascii_lowercase())
    }

    /// Replace any existing values for `name`.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.map
            .insert(name.to_ascii_lowercase(), HeaderEntry::One(value.into()));
    }

    /// Append a value, keeping existing ones.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let key = name.to_ascii_lowercase();
        match self.map.get_mut(&key) {
            Some(HeaderEntry::One(existing)) => {
                let first = std::mem::take(existing);
                self.map
                    .insert(key, HeaderEntry::Many(vec![first, value.into()]));
            }
            Some(HeaderEntry::Many(vs)) => vs.push(value.into()),
            None => {
                self.map.insert(key, HeaderEntry::One(value.into()));
            }
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.map.remove(&name.to_ascii_lowercase());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Iterate `(name, first_value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| {
            let val = match v {
                HeaderEntry::One(s) => s.as_str(),
                HeaderEntry::Many(vs) => vs.first().map(String::as_str).unwrap_or(""),
            };
            (k.as_str(), val)
        })
    }
}

// ── Request context ───────────────────────────────────────────

/// Lifecycle milestones recorded per request.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timestamps {
    pub route_match: Option<Instant>,
    pub plugin_start: Option<Instant>,
    pub plugin_end: Option<Instant>,
    pub upstream_start: Option<Instant>,
    pub upstream_end: Option<Instant>,
}

impl Timestamps {
    fn reset(&mut self) {
        *self = Timestamps::default();
    }
}

/// Response being assembled for the client.
#[derive(Debug, Default)]
pub struct ResponseState {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponseState {
    fn reset(&mut self) {
        self.status = 0;
        self.headers.clear();
        self.body = Bytes::new();
    }
}

type StateBag = HashMap<String, serde_json::Value>;

/// Name of the cross-plugin shared state bag.
pub const SHARED_BAG: &str = "__shared";

/// Per-request record. Pool-allocated and recycled; every field returns
/// to its zero value on release.
#[derive(Debug, Default)]
pub struct RequestContext {
    /// Correlation id, stable for the lifetime of the request.
    pub correlation_id: String,

    /// High-resolution request start.
    pub started_at: Option<Instant>,

    pub method: String,
    pub path: String,

    /// Parsed query string; keys are unique (last occurrence wins).
    pub query: HashMap<String, String>,

    /// Path parameters captured by the route match.
    pub params: HashMap<String, String>,

    pub headers: Headers,

    /// Request body, if one was read.
    pub body: Option<Bytes>,

    /// Matched route; `None` until routing completes.
    pub route: Option<Arc<Route>>,

    /// Selected upstream id; `None` until dispatch.
    pub upstream_id: Option<Arc<str>>,

    pub client_ip: String,

    /// Per-plugin state bags, keyed by plugin name. Plugins touch only
    /// their own bag plus [`SHARED_BAG`].
    state: HashMap<String, StateBag>,

    /// Once set, the response is frozen: further mutation attempts are
    /// ignored and the remaining hook chain is skipped.
    pub responded: bool,

    pub response: ResponseState,

    pub timestamps: Timestamps,
}

impl RequestContext {
    /// Initialize the context for a new request. Called right after
    /// acquisition from the pool.
    pub fn begin(&mut self, method: &str, path_and_query: &str, client_ip: &str) {
        self.started_at = Some(Instant::now());
        self.method.push_str(method);
        self.client_ip.push_str(client_ip);

        match path_and_query.split_once('?') {
            Some((path, query)) => {
                self.path.push_str(path);
                parse_query(query, &mut self.query);
            }
            None => self.path.push_str(path_and_query),
        }
    }

    /// Plugin-scoped state bag (created on first access).
    pub fn state_bag(&mut self, plugin: &str) -> &mut StateBag {
        self.state.entry(plugin.to_string()).or_default()
    }

    /// The cross-plugin shared bag.
    pub fn shared_bag(&mut self) -> &mut StateBag {
        self.state_bag(SHARED_BAG)
    }

    /// Read a value from a named bag without creating it.
    pub fn state_get(&self, plugin: &str, key: &str) -> Option<&serde_json::Value> {
        self.state.get(plugin)?.get(key)
    }

    /// Produce a response and freeze it. Returns `false` (and leaves the
    /// existing response untouched) if one was already produced.
    pub fn respond(
        &mut self,
        status: u16,
        headers: Vec<(String, String)>,
        body: impl Into<Bytes>,
    ) -> bool {
        if self.responded {
            return false;
        }
        self.response.status = status;
        self.response.headers = headers;
        self.response.body = body.into();
        self.responded = true;
        true
    }

    /// Upsert a response header. No-op once the response is frozen.
    pub fn set_response_header(&mut self, name: &str, value: impl Into<String>) {
        if self.responded {
            return;
        }
        let value = value.into();
        for (k, v) in self.response.headers.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.response.headers.push((name.to_string(), value));
    }

    /// Elapsed time since request start, in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.started_at
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    /// Return every field to its zero value, keeping allocations where
    /// the containers support it.
    pub fn reset(&mut self) {
        self.correlation_id.clear();
        self.started_at = None;
        self.method.clear();
        self.path.clear();
        self.query.clear();
        self.params.clear();
        self.headers.clear();
        self.body = None;
        self.route = None;
        self.upstream_id = None;
        self.client_ip.clear();
        self.state.clear();
        self.responded = false;
        self.response.reset();
        self.timestamps.reset();
    }
}

/// Parse `a=1&b=2` into the map; keys are unique, last occurrence wins.
fn parse_query(query: &str, out: &mut HashMap<String, String>) {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => out.insert(k.to_string(), v.to_string()),
            None => out.insert(pair.to_string(), String::new()),
        };
    }
}

// ── Context pool ──────────────────────────────────────────────

/// Handle to a pooled context: `(generation, index)`. Release bumps the
/// slot generation, so stale handles are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Context parked in the slot, ready for reuse.
    Idle,
    /// Context checked out to a request.
    CheckedOut,
    /// Context dropped (free list was full); index reusable.
    Retired,
}

struct Slot {
    generation: u32,
    state: SlotState,
    parked: Option<Box<RequestContext>>,
}

/// Observable pool counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub acquired: u64,
    pub released: u64,
    pub dropped: u64,
    pub ignored_releases: u64,
}

impl PoolStats {
    pub fn in_use(&self) -> u64 {
        self.acquired - self.released
    }

    pub fn hit_rate(&self) -> f64 {
        if self.acquired == 0 {
            return 0.0;
        }
        self.hits as f64 / self.acquired as f64
    }
}

/// Fixed-capacity arena of recycled request contexts.
///
/// Contexts are checked out by value (boxed) so async handlers can hold
/// them across suspension points; the arena keeps the slot bookkeeping
/// and invalidates handles generationally on release.
pub struct ContextPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    retired: Vec<u32>,
    max_parked: usize,
    stats: PoolStats,
}

impl ContextPool {
    /// Create a pool pre-populated with `capacity` contexts. At most
    /// `capacity` released contexts are retained; the rest are dropped.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                generation: 0,
                state: SlotState::Idle,
                parked: Some(Box::default()),
            });
            free.push(i as u32);
        }
        // Pop order: lowest index first.
        free.reverse();
        Self {
            slots,
            free,
            retired: Vec::new(),
            max_parked: capacity,
            stats: PoolStats::default(),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1_000)
    }

    /// Check out a context. Pops the free list on a hit; allocates a
    /// fresh context (miss) when the free list is empty.
    pub fn acquire(&mut self) -> (ContextHandle, Box<RequestContext>) {
        self.stats.acquired += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert_eq!(slot.state, SlotState::Idle);
            slot.state = SlotState::CheckedOut;
            let ctx = slot.parked.take().unwrap_or_default();
            self.stats.hits += 1;
            return (
                ContextHandle {
                    index,
                    generation: slot.generation,
                },
                ctx,
            );
        }

        self.stats.misses += 1;
        let index = match self.retired.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.state = SlotState::CheckedOut;
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::CheckedOut,
                    parked: None,
                });
                index
            }
        };
        (
            ContextHandle {
                index,
                generation: self.slots[index as usize].generation,
            },
            Box::default(),
        )
    }

    /// Return a context. Idempotent: stale handles (already released) and
    /// handles that never came from this pool are ignored.
    pub fn release(&mut self, handle: ContextHandle, mut ctx: Box<RequestContext>) -> bool {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            self.stats.ignored_releases += 1;
            return false;
        };
        if slot.generation != handle.generation || slot.state != SlotState::CheckedOut {
            self.stats.ignored_releases += 1;
            return false;
        }

        ctx.reset();
        slot.generation = slot.generation.wrapping_add(1);
        self.stats.released += 1;

        if self.free.len() < self.max_parked {
            slot.state = SlotState::Idle;
            slot.parked = Some(ctx);
            self.free.push(handle.index);
        } else {
            slot.state = SlotState::Retired;
            self.retired.push(handle.index);
            self.stats.dropped += 1;
        }
        true
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Number of contexts currently parked and ready.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}
