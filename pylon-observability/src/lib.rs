pub mod access_log;
pub mod metrics;
pub mod pii;
pub mod prometheus_exporter;
