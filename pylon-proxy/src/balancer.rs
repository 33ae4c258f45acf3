use pylon_core::upstream::Upstream;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Load balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    IpHash,
    Random,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::IpHash => "ip_hash",
            Strategy::Random => "random",
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            "weighted_round_robin" => Ok(Strategy::WeightedRoundRobin),
            "ip_hash" => Ok(Strategy::IpHash),
            "random" => Ok(Strategy::Random),
            other => Err(format!("unknown balancing strategy '{}'", other)),
        }
    }
}

/// Per-request selection hints.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectionHints<'a> {
    pub client_ip: Option<&'a str>,
}

struct Slot {
    upstream: Arc<Upstream>,
    healthy: bool,
    active_connections: u32,
    requests: u64,
    errors: u64,
    latency_sum_ms: f64,
    latency_count: u64,
}

impl Slot {
    fn new(upstream: Arc<Upstream>) -> Self {
        Self {
            upstream,
            healthy: true,
            active_connections: 0,
            requests: 0,
            errors: 0,
            latency_sum_ms: 0.0,
            latency_count: 0,
        }
    }
}

/// Worker-local load balancer over the configured upstream set.
///
/// Health state is mirrored in from the health table by the worker loop;
/// the balancer itself never talks to the checker (one-way data flow).
pub struct LoadBalancer {
    strategy: Strategy,
    health_aware: bool,
    slots: Vec<Slot>,
    /// Round-robin cursor over the healthy subset.
    cursor: usize,
    /// Weighted schedule: slot indices repeated by weight, declaration order.
    schedule: Vec<usize>,
    schedule_cursor: usize,
    total_requests: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancerMetrics {
    pub total_requests: u64,
    pub upstreams: Vec<UpstreamShare>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamShare {
    pub id: String,
    pub healthy: bool,
    pub active_connections: u32,
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub share_pct: f64,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy, health_aware: bool) -> Self {
        Self {
            strategy,
            health_aware,
            slots: Vec::new(),
            cursor: 0,
            schedule: Vec::new(),
            schedule_cursor: 0,
            total_requests: 0,
        }
    }

    /// Replace the upstream set. Cursors reset; health flags start true
    /// until the health mirror says otherwise.
    pub fn set_upstreams(&mut self, upstreams: Vec<Arc<Upstream>>) {
        self.schedule.clear();
        for (idx, up) in upstreams.iter().enumerate() {
            for _ in 0..up.weight {
                self.schedule.push(idx);
            }
        }
        self.slots = upstreams.into_iter().map(Slot::new).collect();
        self.cursor = 0;
        self.schedule_cursor = 0;
    }

    /// Switch strategy; internal cursors reset.
    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
        self.cursor = 0;
        self.schedule_cursor = 0;
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick an upstream for this request, or `None` when every candidate
    /// is unhealthy.
    pub fn select(&mut self, hints: SelectionHints<'_>) -> Option<Arc<Upstream>> {
        let eligible: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !self.health_aware || s.healthy)
            .map(|(i, _)| i)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let idx = match self.strategy {
            Strategy::RoundRobin => self.pick_round_robin(&eligible),
            Strategy::LeastConnections => self.pick_least_connections(&eligible),
            Strategy::WeightedRoundRobin => self.pick_weighted(&eligible),
            Strategy::IpHash => match hints.client_ip {
                Some(ip) => eligible[ip_hash(ip) as usize % eligible.len()],
                None => self.pick_round_robin(&eligible),
            },
            Strategy::Random => eligible[rand::thread_rng().gen_range(0..eligible.len())],
        };

        self.total_requests += 1;
        let slot = &mut self.slots[idx];
        slot.requests += 1;
        Some(Arc::clone(&slot.upstream))
    }

    fn pick_round_robin(&mut self, eligible: &[usize]) -> usize {
        let idx = eligible[self.cursor % eligible.len()];
        self.cursor = self.cursor.wrapping_add(1);
        idx
    }

    fn pick_least_connections(&self, eligible: &[usize]) -> usize {
        let mut best = eligible[0];
        for &i in &eligible[1..] {
            // Strict less: ties keep the earliest-declared upstream.
            if self.slots[i].active_connections < self.slots[best].active_connections {
                best = i;
            }
        }
        best
    }

    fn pick_weighted(&mut self, eligible: &[usize]) -> usize {
        if self.schedule.is_empty() {
            return self.pick_round_robin(eligible);
        }
        for _ in 0..self.schedule.len() {
            let idx = self.schedule[self.schedule_cursor % self.schedule.len()];
            self.schedule_cursor = self.schedule_cursor.wrapping_add(1);
            if eligible.contains(&idx) {
                return idx;
            }
        }
        // Schedule contains no eligible slot (weights 0 or all unhealthy
        // entries); fall back to round-robin over the eligible set.
        self.pick_round_robin(eligible)
    }

    pub fn record_error(&mut self, upstream_id: &str) {
        if let Some(slot) = self.slot_mut(upstream_id) {
            slot.errors += 1;
        }
    }

    pub fn record_latency(&mut self, upstream_id: &str, latency_ms: f64) {
        if let Some(slot) = self.slot_mut(upstream_id) {
            slot.latency_sum_ms += latency_ms;
            slot.latency_count += 1;
        }
    }

    pub fn update_health(&mut self, upstream_id: &str, healthy: bool) {
        if let Some(slot) = self.slot_mut(upstream_id) {
            slot.healthy = healthy;
        }
    }

    pub fn connection_opened(&mut self, upstream_id: &str) {
        if let Some(slot) = self.slot_mut(upstream_id) {
            slot.active_connections = slot.active_connections.saturating_add(1);
        }
    }

    pub fn connection_closed(&mut self, upstream_id: &str) {
        if let Some(slot) = self.slot_mut(upstream_id) {
            slot.active_connections = slot.active_connections.saturating_sub(1);
        }
    }

    pub fn is_healthy(&self, upstream_id: &str) -> bool {
        self.slots
            .iter()
            .find(|s| s.upstream.id == upstream_id)
            .map(|s| s.healthy)
            .unwrap_or(false)
    }

    pub fn upstream(&self, upstream_id: &str) -> Option<Arc<Upstream>> {
        self.slots
            .iter()
            .find(|s| s.upstream.id == upstream_id)
            .map(|s| Arc::clone(&s.upstream))
    }

    pub fn metrics(&self) -> BalancerMetrics {
        let total = self.total_requests;
        BalancerMetrics {
            total_requests: total,
            upstreams: self
                .slots
                .iter()
                .map(|s| UpstreamShare {
                    id: s.upstream.id.clone(),
                    healthy: s.healthy,
                    active_connections: s.active_connections,
                    requests: s.requests,
                    errors: s.errors,
                    avg_latency_ms: if s.latency_count == 0 {
                        0.0
                    } else {
                        s.latency_sum_ms / s.latency_count as f64
                    },
                    share_pct: if total == 0 {
                        0.0
                    } else {
                        s.requests as f64 * 100.0 / total as f64
                    },
                })
                .collect(),
        }
    }

    fn slot_mut(&mut self, upstream_id: &str) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.upstream.id == upstream_id)
    }
}

/// Deterministic hash for ip-hash affinity (fixed-key SipHash via the
/// std default hasher, stable within a process).
fn ip_hash(ip: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    ip.hash(&mut hasher);
    hasher.finish()
}
