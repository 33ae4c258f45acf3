use dashmap::DashMap;
use pylon_core::upstream::{HealthCheckMode, Upstream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-upstream health state. Written only by the health checker;
/// everything else reads.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub healthy: bool,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_probes: u64,
    pub total_failures: u64,
    pub avg_response_ms: f64,
    pub last_result: Option<bool>,
    /// Last result produced by an *active* probe (hybrid fallback anchor).
    pub last_active_result: Option<bool>,
    registered_at: Instant,
    /// Outcomes recorded by live traffic since the last passive evaluation.
    passive_successes: u64,
    passive_failures: u64,
}

impl HealthState {
    fn new(now: Instant) -> Self {
        Self {
            healthy: true,
            consecutive_successes: 0,
            consecutive_failures: 0,
            total_probes: 0,
            total_failures: 0,
            avg_response_ms: 0.0,
            last_result: None,
            last_active_result: None,
            registered_at: now,
            passive_successes: 0,
            passive_failures: 0,
        }
    }
}

/// Shared upstream health table.
///
/// The checker applies probe outcomes here and bumps `version` on every
/// flip; worker loops watch the version and mirror the healthy set into
/// their balancers. The data plane contributes passive outcomes through
/// [`HealthTable::record_passive`].
pub struct HealthTable {
    entries: DashMap<String, HealthState>,
    version: AtomicU64,
}

impl HealthTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    pub fn register(&self, upstream_id: &str) {
        self.entries
            .entry(upstream_id.to_string())
            .or_insert_with(|| HealthState::new(Instant::now()));
    }

    /// Unknown upstreams are assumed healthy.
    pub fn is_healthy(&self, upstream_id: &str) -> bool {
        self.entries
            .get(upstream_id)
            .map(|e| e.healthy)
            .unwrap_or(true)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Vec<(String, bool)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.healthy))
            .collect()
    }

    pub fn state(&self, upstream_id: &str) -> Option<HealthState> {
        self.entries.get(upstream_id).map(|e| e.clone())
    }

    /// Record a live-traffic outcome (passive checking input).
    pub fn record_passive(&self, upstream_id: &str, success: bool) {
        if let Some(mut e) = self.entries.get_mut(upstream_id) {
            if success {
                e.passive_successes += 1;
            } else {
                e.passive_failures += 1;
            }
        }
    }

    /// Drain the passive counters accumulated since the last evaluation.
    pub fn take_passive(&self, upstream_id: &str) -> (u64, u64) {
        match self.entries.get_mut(upstream_id) {
            Some(mut e) => {
                let out = (e.passive_successes, e.passive_failures);
                e.passive_successes = 0;
                e.passive_failures = 0;
                out
            }
            None => (0, 0),
        }
    }

    /// Apply one probe outcome through the two-threshold machine.
    ///
    /// Returns `true` if the healthy flag flipped (version bumped).
    pub fn apply_probe(
        &self,
        upstream_id: &str,
        success: bool,
        response_ms: Option<f64>,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
        grace_period: Duration,
    ) -> bool {
        self.apply_probe_at(
            upstream_id,
            success,
            response_ms,
            healthy_threshold,
            unhealthy_threshold,
            grace_period,
            Instant::now(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn apply_probe_at(
        &self,
        upstream_id: &str,
        success: bool,
        response_ms: Option<f64>,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
        grace_period: Duration,
        now: Instant,
    ) -> bool {
        let Some(mut e) = self.entries.get_mut(upstream_id) else {
            return false;
        };

        e.total_probes += 1;
        e.last_result = Some(success);
        if let Some(ms) = response_ms {
            // Cumulative moving average over all probes.
            let n = e.total_probes as f64;
            e.avg_response_ms += (ms - e.avg_response_ms) / n;
        }

        if success {
            e.consecutive_successes += 1;
            e.consecutive_failures = 0;
        } else {
            e.total_failures += 1;
            e.consecutive_failures += 1;
            e.consecutive_successes = 0;
        }

        let in_grace = now.saturating_duration_since(e.registered_at) < grace_period;
        let was_healthy = e.healthy;
        if in_grace {
            e.healthy = true;
        } else if e.healthy && e.consecutive_failures >= unhealthy_threshold {
            e.healthy = false;
        } else if !e.healthy && e.consecutive_successes >= healthy_threshold {
            e.healthy = true;
        }

        let flipped = e.healthy != was_healthy;
        drop(e);
        if flipped {
            self.version.fetch_add(1, Ordering::Release);
            if success {
                info!(upstream = %upstream_id, "Upstream marked healthy");
            } else {
                warn!(upstream = %upstream_id, "Upstream marked unhealthy");
            }
        }
        flipped
    }
}

impl Default for HealthTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic prober. Runs on the control-plane tokio runtime, never on
/// the data-plane workers.
pub struct HealthChecker {
    table: Arc<HealthTable>,
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(table: Arc<HealthTable>) -> Self {
        Self {
            table,
            client: reqwest::Client::new(),
        }
    }

    /// Spawn one probe loop per health-checked upstream.
    pub fn spawn_all(&self, upstreams: &[Arc<Upstream>]) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for up in upstreams {
            if !up.health_check.enabled {
                continue;
            }
            self.table.register(&up.id);
            let table = Arc::clone(&self.table);
            let client = self.client.clone();
            let up = Arc::clone(up);
            handles.push(tokio::spawn(async move {
                probe_loop(table, client, up).await;
            }));
        }
        handles
    }
}

async fn probe_loop(table: Arc<HealthTable>, client: reqwest::Client, up: Arc<Upstream>) {
    let hc = &up.health_check;
    let mut tick = tokio::time::interval(Duration::from_millis(hc.interval_ms));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let grace = Duration::from_millis(hc.grace_period_ms);

    loop {
        tick.tick().await;

        let (outcome, response_ms) = match hc.mode {
            HealthCheckMode::Active => match probe_http(&client, &up).await {
                ProbeOutcome::Result(ok, ms) => (ok, Some(ms)),
                ProbeOutcome::TransportError => (false, None),
            },
            HealthCheckMode::Passive => (evaluate_passive(&table, &up.id), None),
            HealthCheckMode::Hybrid => match probe_http(&client, &up).await {
                ProbeOutcome::Result(ok, ms) => (ok, Some(ms)),
                // Active probe could not run at all: fall back to what
                // live traffic says.
                ProbeOutcome::TransportError => (evaluate_passive(&table, &up.id), None),
            },
        };

        table.apply_probe(
            &up.id,
            outcome,
            response_ms,
            hc.healthy_threshold,
            hc.unhealthy_threshold,
            grace,
        );
        if let Some(mut e) = table.entries.get_mut(&up.id)
            && response_ms.is_some()
        {
            e.last_active_result = Some(outcome);
        }
        debug!(upstream = %up.id, outcome, "Health probe applied");
    }
}

enum ProbeOutcome {
    /// Probe completed; status compared against `expected_status`.
    Result(bool, f64),
    /// Probe could not reach the upstream at all.
    TransportError,
}

async fn probe_http(client: &reqwest::Client, up: &Upstream) -> ProbeOutcome {
    let started = Instant::now();
    let fut = client
        .get(up.probe_url())
        .timeout(Duration::from_millis(up.health_check.timeout_ms))
        .send();
    match fut.await {
        Ok(resp) => ProbeOutcome::Result(
            resp.status().as_u16() == up.health_check.expected_status,
            started.elapsed().as_secs_f64() * 1000.0,
        ),
        Err(_) => ProbeOutcome::TransportError,
    }
}

/// Plain TCP reachability probe.
pub async fn probe_tcp(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Passive evaluation: failures observed since the last tick fail the
/// probe; traffic with no failures passes; no traffic falls back to the
/// last active result, else assumes healthy.
fn evaluate_passive(table: &HealthTable, upstream_id: &str) -> bool {
    let (successes, failures) = table.take_passive(upstream_id);
    if failures > 0 {
        return false;
    }
    if successes > 0 {
        return true;
    }
    table
        .entries
        .get(upstream_id)
        .and_then(|e| e.last_active_result)
        .unwrap_or(true)
}
