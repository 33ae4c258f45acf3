use crate::Decision;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SlidingWindowConfig {
    pub window: Duration,
    pub max_requests: usize,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

/// Per-key sliding-window limiter: an ordered list of request timestamps,
/// pruned on every touch so all entries satisfy `now - ts < window`.
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    windows: HashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: SlidingWindowConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    pub fn consume(&mut self, key: &str) -> Decision {
        self.consume_at(key, Instant::now())
    }

    pub fn consume_at(&mut self, key: &str, now: Instant) -> Decision {
        let window = self.config.window;
        let max = self.config.max_requests;
        let timestamps = self.windows.entry(key.to_string()).or_default();

        while let Some(&oldest) = timestamps.front() {
            if now.saturating_duration_since(oldest) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        let count = timestamps.len();
        if count < max {
            timestamps.push_back(now);
            Decision {
                allowed: true,
                remaining: (max - count - 1) as u64,
                limit: max as u64,
                reset_in_secs: reset_in(timestamps.front(), window, now),
                retry_after_secs: None,
            }
        } else {
            let retry = timestamps
                .front()
                .map(|&oldest| {
                    (oldest + window)
                        .saturating_duration_since(now)
                        .as_secs_f64()
                })
                .unwrap_or(0.0);
            Decision {
                allowed: false,
                remaining: 0,
                limit: max as u64,
                reset_in_secs: retry,
                retry_after_secs: Some(retry),
            }
        }
    }

    pub fn reset(&mut self, key: &str) {
        self.windows.remove(key);
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }

    pub fn stats(&self) -> crate::token_bucket::LimiterStats {
        let approx_bytes = self
            .windows
            .iter()
            .map(|(k, v)| k.len() + v.len() * std::mem::size_of::<Instant>())
            .sum();
        crate::token_bucket::LimiterStats {
            tracked_keys: self.windows.len(),
            approx_bytes,
        }
    }
}

fn reset_in(oldest: Option<&Instant>, window: Duration, now: Instant) -> f64 {
    oldest
        .map(|&o| (o + window).saturating_duration_since(now).as_secs_f64())
        .unwrap_or(0.0)
}
