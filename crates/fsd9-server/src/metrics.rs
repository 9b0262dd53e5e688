//! Server metrics
//!
//! Counters for connections, lines and logins. Values are mirrored into the
//! `metrics` facade so a Prometheus exporter installed by the binary picks
//! them up; the local atomics back `snapshot()` for logs and tests.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct ServerMetrics {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    connections_denied: AtomicU64,
    lines_processed: AtomicU64,
    auth_failures: AtomicU64,
    logins: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_denied: u64,
    pub lines_processed: u64,
    pub auth_failures: u64,
    pub logins: u64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        describe_counter!("fsd9_connections_accepted_total", "Connections that got a session");
        describe_counter!(
            "fsd9_connections_rejected_total",
            "Connections refused because the server was full"
        );
        describe_counter!("fsd9_connections_denied_total", "Connections dropped by the denylist");
        describe_gauge!("fsd9_connections_active", "Sessions currently open");
        describe_counter!("fsd9_lines_processed_total", "Inbound protocol lines");
        describe_counter!("fsd9_auth_failures_total", "Rejected add-client credentials");
        describe_counter!("fsd9_logins_total", "Clients that completed login");

        Self {
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            connections_denied: AtomicU64::new(0),
            lines_processed: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            logins: AtomicU64::new(0),
        }
    }

    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        counter!("fsd9_connections_accepted_total").increment(1);
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
        counter!("fsd9_connections_rejected_total").increment(1);
    }

    pub fn record_denied(&self) {
        self.connections_denied.fetch_add(1, Ordering::Relaxed);
        counter!("fsd9_connections_denied_total").increment(1);
    }

    pub fn set_active(&self, active: u64) {
        gauge!("fsd9_connections_active").set(active as f64);
    }

    pub fn record_line(&self) {
        self.lines_processed.fetch_add(1, Ordering::Relaxed);
        counter!("fsd9_lines_processed_total").increment(1);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
        counter!("fsd9_auth_failures_total").increment(1);
    }

    pub fn record_login(&self) {
        self.logins.fetch_add(1, Ordering::Relaxed);
        counter!("fsd9_logins_total").increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connections_denied: self.connections_denied.load(Ordering::Relaxed),
            lines_processed: self.lines_processed.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            logins: self.logins.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ServerMetrics::new();
        metrics.record_accepted();
        metrics.record_accepted();
        metrics.record_denied();
        metrics.record_line();
        metrics.record_auth_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.connections_denied, 1);
        assert_eq!(snapshot.connections_rejected, 0);
        assert_eq!(snapshot.lines_processed, 1);
        assert_eq!(snapshot.auth_failures, 1);
        assert_eq!(snapshot.logins, 0);
    }
}
