//! HTTP server for health and metrics endpoints
//!
//! Provides Kubernetes health probes:
//! - `/healthz` - Liveness probe (process is running)
//! - `/readyz` - Readiness probe (controller is ready to serve)
//! - `/metrics` - Prometheus scrape endpoint
//!
//! Also hosts lease-based leader election and graceful shutdown handling
//! for SIGTERM/SIGINT.

mod health;
pub mod leader;
pub mod metrics;
pub mod shutdown;

pub use health::{run_health_server, ReadinessState};
pub use leader::{
    run_leader_election, LeaderConfig, LeaderState, DEFAULT_LEASE_TTL, DEFAULT_RENEW_INTERVAL,
};
pub use metrics::{create_metrics, ControllerMetrics, MetricsError, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownSignal, ShutdownTrigger};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "leader_test.rs"]
mod leader_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
