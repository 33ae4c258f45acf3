use pylon_core::error::GatewayError;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within a full window that trip the circuit.
    pub failure_threshold: u32,

    /// Consecutive half-open successes required to close. Also bounds
    /// concurrent half-open probes.
    pub success_threshold: u32,

    /// Outcomes kept in the sliding window.
    pub window_size: usize,

    /// How long an open circuit rejects before probing.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            window_size: 10,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerEventKind {
    Opened,
    HalfOpened,
    Closed,
    Rejected,
}

/// Payload delivered to transition listeners.
#[derive(Debug, Clone)]
pub struct BreakerEvent {
    pub upstream: String,
    pub kind: BreakerEventKind,
    pub state: CircuitState,
}

type Listener = Box<dyn Fn(&BreakerEvent)>;

#[derive(Debug, Default, Clone, Copy)]
pub struct BreakerStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

/// Per-upstream circuit breaker.
///
/// Single-writer: lives on one worker and is driven by that worker's
/// request outcomes. Open-state rejection is a state check plus a clock
/// read, nothing else.
pub struct CircuitBreaker {
    upstream_id: String,
    config: BreakerConfig,
    state: CircuitState,
    /// Last N outcomes: (success, at).
    window: VecDeque<(bool, Instant)>,
    consecutive_successes: u32,
    consecutive_failures: u32,
    half_open_inflight: u32,
    half_open_successes: u32,
    next_half_open: Option<Instant>,
    stats: BreakerStats,
    listeners: HashMap<BreakerEventKind, Vec<Listener>>,
}

impl CircuitBreaker {
    pub fn new(upstream_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            upstream_id: upstream_id.into(),
            config,
            state: CircuitState::Closed,
            window: VecDeque::new(),
            consecutive_successes: 0,
            consecutive_failures: 0,
            half_open_inflight: 0,
            half_open_successes: 0,
            next_half_open: None,
            stats: BreakerStats::default(),
            listeners: HashMap::new(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn stats(&self) -> BreakerStats {
        self.stats
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Register a listener for one event kind.
    pub fn subscribe(&mut self, kind: BreakerEventKind, listener: impl Fn(&BreakerEvent) + 'static) {
        self.listeners.entry(kind).or_default().push(Box::new(listener));
    }

    /// Admission gate. `Err(CircuitOpen)` is the fast-fail path.
    pub fn try_acquire(&mut self) -> Result<(), GatewayError> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), GatewayError> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.next_half_open.is_some_and(|t| now >= t) {
                    self.transition(CircuitState::HalfOpen, BreakerEventKind::HalfOpened);
                    self.half_open_inflight = 1;
                    self.half_open_successes = 0;
                    return Ok(());
                }
                self.stats.rejections += 1;
                self.emit(BreakerEventKind::Rejected);
                Err(GatewayError::CircuitOpen {
                    upstream: self.upstream_id.clone(),
                })
            }
            CircuitState::HalfOpen => {
                if self.half_open_inflight < self.config.success_threshold {
                    self.half_open_inflight += 1;
                    return Ok(());
                }
                self.stats.rejections += 1;
                self.emit(BreakerEventKind::Rejected);
                Err(GatewayError::CircuitOpen {
                    upstream: self.upstream_id.clone(),
                })
            }
        }
    }

    pub fn on_success(&mut self) {
        self.on_success_at(Instant::now())
    }

    pub fn on_success_at(&mut self, now: Instant) {
        self.stats.total += 1;
        self.stats.successes += 1;
        match self.state {
            CircuitState::Closed => {
                self.push_outcome(true, now);
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_inflight = self.half_open_inflight.saturating_sub(1);
                self.half_open_successes += 1;
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
                if self.half_open_successes >= self.config.success_threshold {
                    self.window.clear();
                    self.consecutive_successes = 0;
                    self.half_open_inflight = 0;
                    self.half_open_successes = 0;
                    self.next_half_open = None;
                    self.transition(CircuitState::Closed, BreakerEventKind::Closed);
                    info!(upstream = %self.upstream_id, "Circuit closed");
                }
            }
            // A probe completing after the circuit reopened: discarded.
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&mut self) {
        self.on_failure_at(Instant::now())
    }

    pub fn on_failure_at(&mut self, now: Instant) {
        self.stats.total += 1;
        self.stats.failures += 1;
        match self.state {
            CircuitState::Closed => {
                self.push_outcome(false, now);
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;

                let window_full = self.window.len() == self.config.window_size;
                let window_failures =
                    self.window.iter().filter(|(ok, _)| !ok).count() as u32;
                if window_full && window_failures >= self.config.failure_threshold {
                    self.open_at(now);
                }
            }
            CircuitState::HalfOpen => {
                // Any half-open failure reopens immediately.
                self.open_at(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Wrap one operation: gate, run, record.
    pub async fn execute<T, Fut>(&mut self, fut: Fut) -> Result<T, GatewayError>
    where
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.try_acquire()?;
        match fut.await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Test hook: force a state without touching counters.
    pub fn force_state(&mut self, state: CircuitState) {
        self.state = state;
        if state == CircuitState::Open && self.next_half_open.is_none() {
            self.next_half_open = Some(Instant::now() + self.config.open_timeout);
        }
    }

    /// Clear all counters and return to CLOSED.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.window.clear();
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
        self.half_open_inflight = 0;
        self.half_open_successes = 0;
        self.next_half_open = None;
        self.stats = BreakerStats::default();
    }

    fn open_at(&mut self, now: Instant) {
        self.next_half_open = Some(now + self.config.open_timeout);
        self.half_open_inflight = 0;
        self.half_open_successes = 0;
        self.transition(CircuitState::Open, BreakerEventKind::Opened);
        warn!(
            upstream = %self.upstream_id,
            reopen_ms = self.config.open_timeout.as_millis() as u64,
            "Circuit opened"
        );
    }

    fn push_outcome(&mut self, success: bool, now: Instant) {
        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back((success, now));
    }

    fn transition(&mut self, to: CircuitState, kind: BreakerEventKind) {
        self.state = to;
        self.emit(kind);
    }

    fn emit(&self, kind: BreakerEventKind) {
        if let Some(listeners) = self.listeners.get(&kind) {
            let event = BreakerEvent {
                upstream: self.upstream_id.clone(),
                kind,
                state: self.state,
            };
            for l in listeners {
                l(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn breaker(failure_threshold: u32, window: usize, success_threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "u1",
            BreakerConfig {
                failure_threshold,
                success_threshold,
                window_size: window,
                open_timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    #[test]
    fn test_opens_after_threshold_then_half_opens_then_closes() {
        let mut cb = breaker(3, 5, 2, 50);
        let t0 = Instant::now();

        // Five failing calls fill the window past the threshold.
        for i in 0..5 {
            cb.try_acquire_at(t0).unwrap();
            cb.on_failure_at(t0 + Duration::from_millis(i));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Sixth call rejects immediately.
        let err = cb.try_acquire_at(t0 + Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        assert_eq!(cb.stats().rejections, 1);

        // After the open timeout the next call is admitted as a probe.
        let t1 = t0 + Duration::from_millis(65);
        cb.try_acquire_at(t1).unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success_at(t1);

        // A second success closes the circuit and clears the window.
        cb.try_acquire_at(t1).unwrap();
        cb.on_success_at(t1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.window.is_empty());
    }

    #[test]
    fn test_closed_requires_full_window() {
        let mut cb = breaker(3, 5, 2, 50);
        let t0 = Instant::now();
        // Three failures meet the threshold but the window is not full.
        for _ in 0..3 {
            cb.on_failure_at(t0);
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.on_success_at(t0);
        cb.on_failure_at(t0);
        // Window now full with 4 failures >= 3.
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = breaker(2, 2, 2, 50);
        let t0 = Instant::now();
        cb.on_failure_at(t0);
        cb.on_failure_at(t0);
        assert_eq!(cb.state(), CircuitState::Open);

        let t1 = t0 + Duration::from_millis(60);
        cb.try_acquire_at(t1).unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_failure_at(t1);
        assert_eq!(cb.state(), CircuitState::Open);

        // Rejection resumes until the new deadline passes.
        assert!(cb.try_acquire_at(t1 + Duration::from_millis(10)).is_err());
        assert!(cb.try_acquire_at(t1 + Duration::from_millis(60)).is_ok());
    }

    #[test]
    fn test_half_open_probe_bound() {
        let mut cb = breaker(1, 1, 2, 10);
        let t0 = Instant::now();
        cb.on_failure_at(t0);
        assert_eq!(cb.state(), CircuitState::Open);

        let t1 = t0 + Duration::from_millis(20);
        cb.try_acquire_at(t1).unwrap(); // probe 1
        cb.try_acquire_at(t1).unwrap(); // probe 2 (== success_threshold)
        let err = cb.try_acquire_at(t1).unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
    }

    #[test]
    fn test_late_probe_success_after_reopen_is_discarded() {
        let mut cb = breaker(1, 1, 2, 10);
        let t0 = Instant::now();
        cb.on_failure_at(t0);
        let t1 = t0 + Duration::from_millis(20);
        cb.try_acquire_at(t1).unwrap();
        cb.try_acquire_at(t1).unwrap();
        // First probe fails: reopen.
        cb.on_failure_at(t1);
        assert_eq!(cb.state(), CircuitState::Open);
        // Second probe completes successfully afterwards: ignored.
        cb.on_success_at(t1);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut cb = breaker(3, 10, 2, 50);
        let t0 = Instant::now();
        cb.on_failure_at(t0);
        cb.on_failure_at(t0);
        assert_eq!(cb.consecutive_failures(), 2);
        cb.on_success_at(t0);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_force_state_and_reset() {
        let mut cb = breaker(3, 5, 2, 50);
        cb.force_state(CircuitState::Open);
        assert!(cb.try_acquire_at(Instant::now()).is_err());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().rejections, 0);
        assert!(cb.try_acquire_at(Instant::now()).is_ok());
    }

    #[test]
    fn test_listeners_fire_on_transitions() {
        let mut cb = breaker(1, 1, 1, 10);
        let opened = Rc::new(RefCell::new(0));
        let o = Rc::clone(&opened);
        cb.subscribe(BreakerEventKind::Opened, move |e| {
            assert_eq!(e.upstream, "u1");
            assert_eq!(e.state, CircuitState::Open);
            *o.borrow_mut() += 1;
        });
        let closed = Rc::new(RefCell::new(0));
        let c = Rc::clone(&closed);
        cb.subscribe(BreakerEventKind::Closed, move |_| *c.borrow_mut() += 1);

        let t0 = Instant::now();
        cb.on_failure_at(t0);
        assert_eq!(*opened.borrow(), 1);

        let t1 = t0 + Duration::from_millis(20);
        cb.try_acquire_at(t1).unwrap();
        cb.on_success_at(t1);
        assert_eq!(*closed.borrow(), 1);
    }

    #[test]
    fn test_execute_wraps_outcomes() {
        let mut cb = breaker(1, 1, 1, 10_000);

        let mut rt = monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
            .build()
            .unwrap();
        rt.block_on(async {
            let ok: Result<u32, GatewayError> =
                cb.execute(async { Ok(7) }).await;
            assert_eq!(ok.unwrap(), 7);
            assert_eq!(cb.stats().successes, 1);

            let err: Result<u32, GatewayError> = cb
                .execute(async { Err(GatewayError::Upstream("boom".into())) })
                .await;
            assert!(err.is_err());
            assert_eq!(cb.state(), CircuitState::Open);

            // Fast-fail while open.
            let err: Result<u32, GatewayError> = cb.execute(async { Ok(1) }).await;
            assert!(matches!(err, Err(GatewayError::CircuitOpen { .. })));
            assert_eq!(cb.stats().rejections, 1);
        });
    }
}
