//! Prometheus metrics and structured logging for gum-boards.
//!
//! - Prometheus metrics for the multi-tab transport (roles, relay, heartbeats)
//! - Structured JSON logging with tracing

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
