use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Rolling executions kept per plugin for percentile estimates.
const HISTORY_CAP: usize = 1_000;

/// Per-plugin execution counters and latency distribution.
///
/// Collection is cheap by construction: a handful of integer updates and
/// one bounded ring-buffer push per invocation.
#[derive(Debug)]
pub struct PluginMetrics {
    pub invocations: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    min_us: u64,
    max_us: u64,
    sum_us: u64,
    history: VecDeque<u64>,
    last_execution: Option<DateTime<Utc>>,
    last_error: Option<DateTime<Utc>>,
}

impl Default for PluginMetrics {
    fn default() -> Self {
        Self {
            invocations: 0,
            successes: 0,
            errors: 0,
            timeouts: 0,
            min_us: u64::MAX,
            max_us: 0,
            sum_us: 0,
            history: VecDeque::with_capacity(HISTORY_CAP),
            last_execution: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    Error,
    Timeout,
}

impl PluginMetrics {
    pub fn record(&mut self, elapsed_us: u64, outcome: ExecOutcome) {
        self.invocations += 1;
        match outcome {
            ExecOutcome::Success => self.successes += 1,
            ExecOutcome::Error => {
                self.errors += 1;
                self.last_error = Some(Utc::now());
            }
            ExecOutcome::Timeout => {
                self.timeouts += 1;
                self.last_error = Some(Utc::now());
            }
        }
        self.last_execution = Some(Utc::now());

        self.min_us = self.min_us.min(elapsed_us);
        self.max_us = self.max_us.max(elapsed_us);
        self.sum_us += elapsed_us;

        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(elapsed_us);
    }

    /// Percentile over the rolling history (nearest-rank).
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.history.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.history.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }

    pub fn avg_us(&self) -> u64 {
        if self.invocations == 0 {
            return 0;
        }
        self.sum_us / self.invocations
    }

    pub fn snapshot(&self) -> PluginMetricsSnapshot {
        PluginMetricsSnapshot {
            invocations: self.invocations,
            successes: self.successes,
            errors: self.errors,
            timeouts: self.timeouts,
            min_us: if self.min_us == u64::MAX { 0 } else { self.min_us },
            avg_us: self.avg_us(),
            max_us: self.max_us,
            p50_us: self.percentile(50.0).unwrap_or(0),
            p95_us: self.percentile(95.0).unwrap_or(0),
            p99_us: self.percentile(99.0).unwrap_or(0),
            last_execution: self
                .last_execution
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            last_error: self
                .last_error
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginMetricsSnapshot {
    pub invocations: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub min_us: u64,
    pub avg_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub last_execution: Option<String>,
    pub last_error: Option<String>,
}
