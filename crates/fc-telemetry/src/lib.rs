//! Logging setup and in-process metrics for the fleet control plane.

pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
