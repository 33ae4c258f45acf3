use crate::lru::LruIndex;
use bytes::Bytes;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::debug;

/// A cached HTTP response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub cached_at: Instant,
    pub ttl: Duration,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Accounted byte size: body plus header text.
    pub size: usize,
    pub stale_while_revalidate: Option<Duration>,
    pub last_access: Instant,
    pub hits: u64,
}

impl CacheEntry {
    pub fn new(
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
        ttl: Duration,
        stale_while_revalidate: Option<Duration>,
        now: Instant,
    ) -> Self {
        let size = body.len()
            + headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>();
        let etag = Some(generate_etag(&body));
        let last_modified = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("last-modified"))
            .map(|(_, v)| v.clone());
        Self {
            status,
            headers,
            body,
            cached_at: now,
            ttl,
            etag,
            last_modified,
            size,
            stale_while_revalidate,
            last_access: now,
            hits: 0,
        }
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.cached_at)
    }
}

/// Whether a hit is within TTL or being served on the
/// stale-while-revalidate grace path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Expired but within the grace window: serve it, and revalidate.
    Stale,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_size_bytes: usize,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_size_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(60),
        }
    }
}

/// In-memory LRU response cache with HTTP freshness semantics.
///
/// Worker-local: eviction runs inline on `set`, no locks anywhere.
pub struct ResponseCache {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    lru: LruIndex,
    current_size: usize,
    stats: CacheStats,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            lru: LruIndex::new(),
            current_size: 0,
            stats: CacheStats::default(),
        }
    }

    /// Look up `key`, applying TTL and stale-while-revalidate rules.
    pub fn get(&mut self, key: &str) -> Option<(&CacheEntry, Freshness)> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &str, now: Instant) -> Option<(&CacheEntry, Freshness)> {
        let Some(entry) = self.entries.get(key) else {
            self.stats.misses += 1;
            return None;
        };

        let age = entry.age(now);
        let freshness = if age <= entry.ttl {
            Freshness::Fresh
        } else if let Some(swr) = entry.stale_while_revalidate
            && age <= entry.ttl + swr
        {
            Freshness::Stale
        } else {
            // Past TTL and grace: the entry is dead.
            let dead = self.entries.remove(key).expect("entry present above");
            self.lru.remove(key);
            self.current_size -= dead.size;
            self.stats.misses += 1;
            return None;
        };

        self.lru.touch(key);
        self.stats.hits += 1;
        let entry = self.entries.get_mut(key).expect("entry present above");
        entry.last_access = now;
        entry.hits += 1;
        Some((&*entry, freshness))
    }

    /// Insert an entry, evicting LRU victims until both the entry-count
    /// and byte-size bounds hold. Refuses entries that could never fit.
    pub fn set(&mut self, key: &str, entry: CacheEntry) -> bool {
        if entry.size > self.config.max_size_bytes {
            debug!(key = %key, size = entry.size, "Entry exceeds cache capacity, refused");
            return false;
        }

        if let Some(old) = self.entries.remove(key) {
            self.lru.remove(key);
            self.current_size -= old.size;
        }

        while !self.entries.is_empty()
            && (self.entries.len() >= self.config.max_entries
                || self.current_size + entry.size > self.config.max_size_bytes)
        {
            let Some(victim) = self.lru.pop_lru() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&victim) {
                self.current_size -= evicted.size;
                self.stats.evictions += 1;
            }
        }

        self.current_size += entry.size;
        self.entries.insert(key.to_string(), entry);
        self.lru.touch(key);
        true
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn delete(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.lru.remove(key);
                self.current_size -= entry.size;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
        self.current_size = 0;
    }

    /// Delete every entry whose key matches `pattern`. Returns the count.
    pub fn purge(&mut self, pattern: &Regex) -> usize {
        let victims: Vec<String> = self
            .entries
            .keys()
            .filter(|k| pattern.is_match(k))
            .cloned()
            .collect();
        for key in &victims {
            self.delete(key);
        }
        victims.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[cfg(test)]
    fn size_invariant_holds(&self) -> bool {
        self.current_size == self.entries.values().map(|e| e.size).sum::<usize>()
            && self.lru.len() == self.entries.len()
    }
}

// ── HTTP cache semantics helpers ──────────────────────────────

/// Parsed `Cache-Control` directives (the subset the gateway honors).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
    pub public: bool,
    pub must_revalidate: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub stale_while_revalidate: Option<u64>,
}

impl CacheControl {
    pub fn parse(header: &str) -> Self {
        let mut cc = CacheControl::default();
        for directive in header.split(',') {
            let directive = directive.trim();
            let (name, value) = match directive.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
                None => (directive, None),
            };
            match name.to_ascii_lowercase().as_str() {
                "no-store" => cc.no_store = true,
                "no-cache" => cc.no_cache = true,
                "private" => cc.private = true,
                "public" => cc.public = true,
                "must-revalidate" => cc.must_revalidate = true,
                "max-age" => cc.max_age = value.and_then(|v| v.parse().ok()),
                "s-maxage" => cc.s_maxage = value.and_then(|v| v.parse().ok()),
                "stale-while-revalidate" => {
                    cc.stale_while_revalidate = value.and_then(|v| v.parse().ok())
                }
                _ => {}
            }
        }
        cc
    }

    /// Serialize back to a header value in canonical directive order.
    pub fn to_header_value(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.public {
            parts.push("public".into());
        }
        if self.private {
            parts.push("private".into());
        }
        if self.no_store {
            parts.push("no-store".into());
        }
        if self.no_cache {
            parts.push("no-cache".into());
        }
        if self.must_revalidate {
            parts.push("must-revalidate".into());
        }
        if let Some(v) = self.s_maxage {
            parts.push(format!("s-maxage={}", v));
        }
        if let Some(v) = self.max_age {
            parts.push(format!("max-age={}", v));
        }
        if let Some(v) = self.stale_while_revalidate {
            parts.push(format!("stale-while-revalidate={}", v));
        }
        parts.join(", ")
    }

    /// Effective TTL: `s-maxage` over `max-age` over the configured default.
    pub fn ttl(&self, default: Duration) -> Duration {
        self.s_maxage
            .or(self.max_age)
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// Only GET/HEAD 2xx responses without forbidding directives are cached.
pub fn is_cacheable(method: &str, status: u16, headers: &[(String, String)]) -> bool {
    if method != "GET" && method != "HEAD" {
        return false;
    }
    if !(200..300).contains(&status) {
        return false;
    }
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("cache-control") {
            let cc = CacheControl::parse(value);
            if cc.no_store || cc.private || cc.no_cache {
                return false;
            }
        }
    }
    true
}

/// Stable cache key: method, URL, and the sorted Vary header pairs,
/// hashed to a fixed-width hex string.
pub fn generate_key(method: &str, url: &str, vary: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(String, &str)> = vary
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), *v))
        .collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    for (name, value) in &sorted {
        hasher.update(b"|");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hex(&hasher.finalize())
}

/// ETag for a body: quoted hex digest. A pure function of the bytes.
pub fn generate_etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let mut out = String::with_capacity(2 + digest.len() * 2);
    out.push('"');
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out.push('"');
    out
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Evaluate request conditionals against a cached entry. Returns `true`
/// when the client's copy is still valid (respond 304).
pub fn check_conditional(
    if_none_match: Option<&str>,
    if_modified_since: Option<&str>,
    entry: &CacheEntry,
) -> bool {
    if let Some(inm) = if_none_match {
        if inm.trim() == "*" {
            return true;
        }
        if let Some(ref etag) = entry.etag {
            return inm
                .split(',')
                .map(|t| t.trim().trim_start_matches("W/"))
                .any(|t| t == etag);
        }
        return false;
    }
    if let (Some(ims), Some(lm)) = (if_modified_since, &entry.last_modified) {
        // Exact-match comparison: upstreams echo the header value they
        // were served, which is the common validator flow.
        return ims.trim() == lm.as_str();
    }
    false
}
