//! Metrics Module
//!
//! Prometheus metrics describing registry occupancy and connection churn.

pub mod collector;

pub use collector::{ManagerMetrics, MetricsSnapshot};
