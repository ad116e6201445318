//! Metrics Collector

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};

/// Prometheus metrics of one connection manager
pub struct ManagerMetrics {
    prometheus_registry: Registry,

    physical_open: IntGauge,
    logical_open: IntGauge,
    physical_connects_total: IntCounter,
    connect_failures_total: IntCounter,
    physical_purged_total: IntCounter,
    unsolicited_messages_total: IntCounter,
    protocol_errors_total: IntCounter,
}

impl ManagerMetrics {
    /// Create the metrics and register them in a private registry
    pub fn new() -> prometheus::Result<Self> {
        let prometheus_registry = Registry::new();

        let physical_open = IntGauge::new(
            "connmux_physical_connections",
            "Number of physical connections held by the registry",
        )?;
        let logical_open = IntGauge::new(
            "connmux_logical_connections",
            "Number of open logical connections",
        )?;
        let physical_connects_total = IntCounter::new(
            "connmux_physical_connects_total",
            "Total physical connections established",
        )?;
        let connect_failures_total = IntCounter::new(
            "connmux_connect_failures_total",
            "Total failed attempts to establish a physical connection",
        )?;
        let physical_purged_total = IntCounter::new(
            "connmux_physical_purged_total",
            "Total physical connections reclaimed by the garbage collector",
        )?;
        let unsolicited_messages_total = IntCounter::new(
            "connmux_unsolicited_messages_total",
            "Total unsolicited messages fanned out",
        )?;
        let protocol_errors_total = IntCounter::new(
            "connmux_protocol_errors_total",
            "Total malformed inbound frames",
        )?;

        prometheus_registry.register(Box::new(physical_open.clone()))?;
        prometheus_registry.register(Box::new(logical_open.clone()))?;
        prometheus_registry.register(Box::new(physical_connects_total.clone()))?;
        prometheus_registry.register(Box::new(connect_failures_total.clone()))?;
        prometheus_registry.register(Box::new(physical_purged_total.clone()))?;
        prometheus_registry.register(Box::new(unsolicited_messages_total.clone()))?;
        prometheus_registry.register(Box::new(protocol_errors_total.clone()))?;

        Ok(Self {
            prometheus_registry,
            physical_open,
            logical_open,
            physical_connects_total,
            connect_failures_total,
            physical_purged_total,
            unsolicited_messages_total,
            protocol_errors_total,
        })
    }

    /// Mirror the current registry occupancy
    pub fn set_open(&self, physical: usize, logical: usize) {
        self.physical_open.set(physical as i64);
        self.logical_open.set(logical as i64);
    }

    pub fn physical_connected(&self) {
        self.physical_connects_total.inc();
    }

    pub fn connect_failed(&self) {
        self.connect_failures_total.inc();
    }

    pub fn physical_purged(&self, count: usize) {
        self.physical_purged_total.inc_by(count as u64);
    }

    pub fn unsolicited_message(&self) {
        self.unsolicited_messages_total.inc();
    }

    pub fn protocol_error(&self) {
        self.protocol_errors_total.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            physical_open: self.physical_open.get(),
            logical_open: self.logical_open.get(),
            physical_connects_total: self.physical_connects_total.get(),
            connect_failures_total: self.connect_failures_total.get(),
            physical_purged_total: self.physical_purged_total.get(),
            unsolicited_messages_total: self.unsolicited_messages_total.get(),
            protocol_errors_total: self.protocol_errors_total.get(),
        }
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather_text(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&self.prometheus_registry.gather())
    }
}

/// Point-in-time copy of the metric values
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub physical_open: i64,
    pub logical_open: i64,
    pub physical_connects_total: u64,
    pub connect_failures_total: u64,
    pub physical_purged_total: u64,
    pub unsolicited_messages_total: u64,
    pub protocol_errors_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_exposition() {
        let metrics = ManagerMetrics::new().unwrap();
        metrics.physical_connected();
        metrics.physical_purged(2);
        metrics.set_open(1, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.physical_connects_total, 1);
        assert_eq!(snapshot.physical_purged_total, 2);
        assert_eq!(snapshot.logical_open, 3);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("connmux_physical_purged_total 2"));
        assert!(text.contains("connmux_logical_connections 3"));
    }
}
