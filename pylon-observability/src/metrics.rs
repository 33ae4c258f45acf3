use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Buckets per distribution.
const BUCKETS: usize = 100;

/// Recent-window bounds for the high-accuracy percentile path.
const RECENT_CAP: usize = 10_000;
const RECENT_MAX_AGE: Duration = Duration::from_secs(60);

/// Fixed-bucket log-spaced histogram. Each update is one relaxed atomic
/// increment, so the struct is safely shared across workers.
pub struct LogHistogram {
    /// Upper bound of each bucket (exclusive except the last).
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicU64,
}

impl LogHistogram {
    /// Buckets spanning `[1, max_value]`, geometrically spaced.
    pub fn new(max_value: f64) -> Self {
        let growth = max_value.powf(1.0 / (BUCKETS as f64 - 1.0));
        let mut bounds = Vec::with_capacity(BUCKETS);
        let mut bound = 1.0f64;
        for _ in 0..BUCKETS {
            bounds.push(bound);
            bound *= growth;
        }
        Self {
            bounds,
            buckets: (0..BUCKETS).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record(&self, value: u64) {
        let idx = self
            .bounds
            .partition_point(|&b| b < value as f64)
            .min(BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Approximate percentile by cumulative bucket scan. Returns the
    /// bucket's upper bound.
    pub fn percentile(&self, p: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let target = ((p / 100.0) * total as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return self.bounds[i].round() as u64;
            }
        }
        self.bounds[BUCKETS - 1].round() as u64
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn reset(&self) {
        for b in &self.buckets {
            b.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
    }
}

/// Bounded sliding window of recent samples for exact percentiles over
/// the last minute.
struct RecentWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl RecentWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(RECENT_CAP),
        }
    }

    fn push(&mut self, now: Instant, value: u64) {
        self.prune(now);
        if self.samples.len() == RECENT_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back((now, value));
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.saturating_duration_since(t) > RECENT_MAX_AGE {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn percentile(&mut self, now: Instant, p: f64) -> u64 {
        self.prune(now);
        if self.samples.is_empty() {
            return 0;
        }
        let mut values: Vec<u64> = self.samples.iter().map(|&(_, v)| v).collect();
        values.sort_unstable();
        let rank = ((p / 100.0) * (values.len() - 1) as f64).round() as usize;
        values[rank.min(values.len() - 1)]
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Shared request metrics: atomic counters plus three log-bucket
/// histograms (latency µs, request bytes, response bytes).
///
/// This is the one structure shared between workers; every hot-path
/// update is a relaxed atomic add. The recent window sits behind a mutex
/// and is only touched on record + snapshot, with short critical
/// sections.
pub struct MetricsAggregator {
    started_at: Instant,

    requests: AtomicU64,
    errors: AtomicU64,
    active_connections: AtomicI64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,

    latency_us: LogHistogram,
    request_bytes: LogHistogram,
    response_bytes: LogHistogram,

    recent_latency: Mutex<RecentWindow>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            // 60s ceiling on latency, 1GiB on sizes.
            latency_us: LogHistogram::new(60_000_000.0),
            request_bytes: LogHistogram::new(1_073_741_824.0),
            response_bytes: LogHistogram::new(1_073_741_824.0),
            recent_latency: Mutex::new(RecentWindow::new()),
        }
    }

    /// Record one completed request.
    pub fn record_request(&self, latency_us: u64, bytes_in: u64, bytes_out: u64, is_error: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        self.latency_us.record(latency_us);
        self.request_bytes.record(bytes_in);
        self.response_bytes.record(bytes_out);
        if let Ok(mut recent) = self.recent_latency.lock() {
            recent.push(Instant::now(), latency_us);
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let (recent_p50, recent_p95, recent_p99) = match self.recent_latency.lock() {
            Ok(mut recent) => (
                recent.percentile(now, 50.0),
                recent.percentile(now, 95.0),
                recent.percentile(now, 99.0),
            ),
            Err(_) => (0, 0, 0),
        };

        MetricsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed).max(0),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            latency_us: DistributionSnapshot::from(&self.latency_us),
            request_bytes: DistributionSnapshot::from(&self.request_bytes),
            response_bytes: DistributionSnapshot::from(&self.response_bytes),
            recent_latency_us: RecentSnapshot {
                p50: recent_p50,
                p95: recent_p95,
                p99: recent_p99,
            },
        }
    }

    /// Zero every counter and clear the windows.
    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.latency_us.reset();
        self.request_bytes.reset();
        self.response_bytes.reset();
        if let Ok(mut recent) = self.recent_latency.lock() {
            recent.clear();
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub requests: u64,
    pub errors: u64,
    pub active_connections: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub latency_us: DistributionSnapshot,
    pub request_bytes: DistributionSnapshot,
    pub response_bytes: DistributionSnapshot,
    pub recent_latency_us: RecentSnapshot,
}

#[derive(Debug, Serialize)]
pub struct DistributionSnapshot {
    pub count: u64,
    pub mean: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

impl From<&LogHistogram> for DistributionSnapshot {
    fn from(h: &LogHistogram) -> Self {
        Self {
            count: h.count(),
            mean: h.mean(),
            p50: h.percentile(50.0),
            p95: h.percentile(95.0),
            p99: h.percentile(99.0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecentSnapshot {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentile_ordering() {
        let h = LogHistogram::new(1_000_000.0);
        for v in [100u64; 90] {
            h.record(v);
        }
        for v in [10_000u64; 10] {
            h.record(v);
        }
        let p50 = h.percentile(50.0);
        let p99 = h.percentile(99.0);
        assert!(p50 < p99, "p50={} p99={}", p50, p99);
        // Log buckets are approximate; p50 must land near 100.
        assert!((50..=200).contains(&p50), "p50={}", p50);
        assert!(p99 >= 10_000 / 2, "p99={}", p99);
    }

    #[test]
    fn test_histogram_empty() {
        let h = LogHistogram::new(1_000.0);
        assert_eq!(h.percentile(50.0), 0);
        assert_eq!(h.count(), 0);
        assert_eq!(h.mean(), 0.0);
    }

    #[test]
    fn test_histogram_values_beyond_max_clamp() {
        let h = LogHistogram::new(1_000.0);
        h.record(5_000_000);
        assert_eq!(h.count(), 1);
        assert!(h.percentile(99.0) <= 1_001);
    }

    #[test]
    fn test_aggregator_counters() {
        let m = MetricsAggregator::new();
        m.record_request(1_000, 100, 500, false);
        m.record_request(2_000, 200, 800, true);
        m.connection_opened();

        let snap = m.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.bytes_in, 300);
        assert_eq!(snap.bytes_out, 1_300);
        assert_eq!(snap.latency_us.count, 2);
        assert!(snap.recent_latency_us.p99 >= snap.recent_latency_us.p50);

        m.connection_closed();
        assert_eq!(m.snapshot().active_connections, 0);
    }

    #[test]
    fn test_recent_window_exact_percentiles() {
        let m = MetricsAggregator::new();
        for v in 1..=100 {
            m.record_request(v * 10, 0, 0, false);
        }
        let snap = m.snapshot();
        assert_eq!(snap.recent_latency_us.p50, 510);
        assert_eq!(snap.recent_latency_us.p99, 990);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let m = MetricsAggregator::new();
        m.record_request(1_000, 10, 10, true);
        m.reset();
        let snap = m.snapshot();
        assert_eq!(snap.requests, 0);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.latency_us.count, 0);
        assert_eq!(snap.recent_latency_us.p99, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = MetricsAggregator::new();
        m.record_request(500, 1, 2, false);
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert!(json["requests"].is_u64());
        assert!(json["latency_us"]["p99"].is_u64());
        assert!(json["recent_latency_us"]["p50"].is_u64());
    }
}
