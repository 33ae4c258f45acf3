use pylon_core::error::GatewayError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Opens transport connections for the pool. Abstracted so the pool's
/// bookkeeping is testable without sockets.
pub trait Connector {
    type Conn;

    fn connect(&self, addr: &str) -> impl Future<Output = std::io::Result<Self::Conn>>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle age beyond which a pooled connection is discarded.
    pub idle_timeout: Duration,

    /// How long an acquire waits on a saturated pool before failing.
    pub connection_timeout: Duration,

    /// Saturated-pool polling period (>= 100 Hz).
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }
}

struct Slot<T> {
    id: u64,
    /// `None` while checked out or still connecting.
    conn: Option<T>,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    in_use: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total_requests: u64,
    reused: u64,
    created: u64,
    errors: u64,
    timeouts: u64,
}

/// Pool metrics snapshot.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active: usize,
    pub idle: usize,
    pub total_requests: u64,
    pub reused: u64,
    pub created: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub reuse_rate: f64,
}

struct PoolInner<T> {
    conns: HashMap<String, Vec<Slot<T>>>,
    next_id: u64,
    config: PoolConfig,
    counters: Counters,
}

enum Plan {
    Create(u64),
    Wait,
}

impl<T> PoolInner<T> {
    /// Take the first live idle connection for `addr`, discarding stale
    /// ones on the way.
    fn try_take(&mut self, addr: &str, now: Instant) -> Option<(u64, T)> {
        let idle_timeout = self.config.idle_timeout;
        let slots = self.conns.get_mut(addr)?;
        slots.retain(|s| {
            s.in_use
                || s.conn.is_none()
                || now.saturating_duration_since(s.last_used) < idle_timeout
        });
        for slot in slots.iter_mut() {
            if !slot.in_use && slot.conn.is_some() {
                slot.in_use = true;
                slot.use_count += 1;
                return Some((slot.id, slot.conn.take().expect("checked above")));
            }
        }
        None
    }

    fn live_count(&self, addr: &str) -> usize {
        self.conns.get(addr).map(|v| v.len()).unwrap_or(0)
    }

    /// Reserve capacity for a connection that is about to be opened.
    fn reserve(&mut self, addr: &str, now: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.conns.entry(addr.to_string()).or_default().push(Slot {
            id,
            conn: None,
            created_at: now,
            last_used: now,
            use_count: 1,
            in_use: true,
        });
        id
    }

    fn remove(&mut self, addr: &str, id: u64) {
        if let Some(slots) = self.conns.get_mut(addr) {
            slots.retain(|s| s.id != id);
            if slots.is_empty() {
                self.conns.remove(addr);
            }
        }
    }
}

/// A checked-out connection. Return it with [`ConnectionPool::release`]
/// or drop it from the pool with [`ConnectionPool::discard`].
#[derive(Debug)]
pub struct ConnLease<T> {
    pub conn: T,
    addr: String,
    id: u64,
    /// False when the connection was reused from the pool.
    pub fresh: bool,
}

impl<T> ConnLease<T> {
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// Keep-alive connection pool, one per worker.
///
/// `acquire` prefers a live idle connection, opens a fresh one while the
/// per-upstream limit allows, and otherwise polls for a release until
/// `connection_timeout` elapses (unordered dispatch: whichever waiter
/// polls first after a release wins).
pub struct ConnectionPool<C: Connector> {
    connector: Rc<C>,
    inner: Rc<RefCell<PoolInner<C::Conn>>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Rc::clone(&self.connector),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector: Rc::new(connector),
            inner: Rc::new(RefCell::new(PoolInner {
                conns: HashMap::new(),
                next_id: 0,
                config,
                counters: Counters::default(),
            })),
        }
    }

    /// Check out a connection to `addr`, keeping at most `limit`
    /// connections alive for that address.
    pub async fn acquire(
        &self,
        addr: &str,
        limit: usize,
        wait_timeout: Option<Duration>,
    ) -> Result<ConnLease<C::Conn>, GatewayError> {
        let started = Instant::now();
        let (deadline, poll_interval) = {
            let mut inner = self.inner.borrow_mut();
            inner.counters.total_requests += 1;
            (
                wait_timeout.unwrap_or(inner.config.connection_timeout),
                inner.config.poll_interval,
            )
        };

        loop {
            let plan = {
                let mut inner = self.inner.borrow_mut();
                let now = Instant::now();
                if let Some((id, conn)) = inner.try_take(addr, now) {
                    inner.counters.reused += 1;
                    return Ok(ConnLease {
                        conn,
                        addr: addr.to_string(),
                        id,
                        fresh: false,
                    });
                } else if inner.live_count(addr) < limit {
                    Plan::Create(inner.reserve(addr, now))
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Create(id) => {
                    return match self.connector.connect(addr).await {
                        Ok(conn) => {
                            let mut inner = self.inner.borrow_mut();
                            inner.counters.created += 1;
                            Ok(ConnLease {
                                conn,
                                addr: addr.to_string(),
                                id,
                                fresh: true,
                            })
                        }
                        Err(e) => {
                            let mut inner = self.inner.borrow_mut();
                            inner.remove(addr, id);
                            inner.counters.errors += 1;
                            warn!(addr = %addr, error = %e, "Upstream connect failed");
                            Err(GatewayError::Connection(format!(
                                "connect to {} failed: {}",
                                addr, e
                            )))
                        }
                    };
                }
                Plan::Wait => {
                    if started.elapsed() >= deadline {
                        self.inner.borrow_mut().counters.timeouts += 1;
                        return Err(GatewayError::ConnectionTimeout {
                            ms: deadline.as_millis() as u64,
                        });
                    }
                    monoio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    /// Return a healthy connection for reuse.
    pub fn release(&self, lease: ConnLease<C::Conn>) {
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner
            .conns
            .get_mut(&lease.addr)
            .and_then(|slots| slots.iter_mut().find(|s| s.id == lease.id))
        {
            slot.conn = Some(lease.conn);
            slot.in_use = false;
            slot.last_used = Instant::now();
        }
        // No slot: the pool was destroyed while this lease was out. The
        // connection drops here and closes.
    }

    /// Drop a poisoned or mid-stream-canceled connection entirely.
    pub fn discard(&self, lease: ConnLease<C::Conn>) {
        let mut inner = self.inner.borrow_mut();
        inner.remove(&lease.addr, lease.id);
        debug!(addr = %lease.addr, "Pooled connection discarded");
    }

    /// Remove idle connections past the idle timeout. Returns the count.
    pub fn reap_idle(&self) -> usize {
        let mut inner = self.inner.borrow_mut();
        let now = Instant::now();
        let idle_timeout = inner.config.idle_timeout;
        let mut reaped = 0;
        for slots in inner.conns.values_mut() {
            let before = slots.len();
            slots.retain(|s| {
                s.in_use || now.saturating_duration_since(s.last_used) < idle_timeout
            });
            reaped += before - slots.len();
        }
        inner.conns.retain(|_, v| !v.is_empty());
        if reaped > 0 {
            debug!(reaped, "Idle connections reaped");
        }
        reaped
    }

    /// Close every connection. Outstanding leases are dropped on release.
    pub fn destroy(&self) {
        self.inner.borrow_mut().conns.clear();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.borrow();
        let total: usize = inner.conns.values().map(|v| v.len()).sum();
        let active: usize = inner
            .conns
            .values()
            .flat_map(|v| v.iter())
            .filter(|s| s.in_use)
            .count();
        let c = inner.counters;
        PoolStats {
            total_connections: total,
            active,
            idle: total - active,
            total_requests: c.total_requests,
            reused: c.reused,
            created: c.created,
            errors: c.errors,
            timeouts: c.timeouts,
            reuse_rate: if c.total_requests == 0 {
                0.0
            } else {
                c.reused as f64 / c.total_requests as f64
            },
        }
    }

    /// Open up to `count` connections per address ahead of traffic.
    pub async fn warm(&self, addrs: &[String], count: usize, limit: usize) {
        for addr in addrs {
            let mut leases = Vec::new();
            for _ in 0..count.min(limit) {
                match self.acquire(addr, limit, Some(Duration::from_millis(1))).await {
                    Ok(lease) => leases.push(lease),
                    Err(_) => break, // upstream not up yet, stop trying this addr
                }
            }
            let warmed = leases.len();
            for lease in leases {
                self.release(lease);
            }
            if warmed > 0 {
                tracing::info!(addr = %addr, conns = warmed, "Pool pre-warmed");
            }
        }
    }
}
