//! Prometheus metrics for the controllers
//!
//! Reconciliation outcomes per controller plus per-ExtendedDaemonSet rollout
//! gauges, all registered on a private registry served at `/metrics`.

use crate::crd::extended_daemon_set::{EdsState, ExtendedDaemonSetStatus};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Every state an ExtendedDaemonSet can report, one gauge series each
const STATES: &[EdsState] = &[
    EdsState::Running,
    EdsState::Canary,
    EdsState::CanaryPaused,
    EdsState::RollingUpdatePaused,
    EdsState::RolloutFrozen,
    EdsState::Failed,
];

fn state_label(state: EdsState) -> &'static str {
    match state {
        EdsState::Running => "running",
        EdsState::Canary => "canary",
        EdsState::CanaryPaused => "canary_paused",
        EdsState::RollingUpdatePaused => "rolling_update_paused",
        EdsState::RolloutFrozen => "rollout_frozen",
        EdsState::Failed => "canary_failed",
    }
}

/// Pod counter series published for every ExtendedDaemonSet
fn pod_counters(status: &ExtendedDaemonSetStatus) -> [(&'static str, i32); 7] {
    [
        ("desired", status.desired),
        ("current", status.current),
        ("ready", status.ready),
        ("available", status.available),
        ("up_to_date", status.up_to_date),
        ("ignored_unresponsive_nodes", status.ignored_unresponsive_nodes),
        (
            "canary_nodes",
            status.canary.as_ref().map_or(0, |c| c.nodes.len() as i32),
        ),
    ]
}

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: HistogramVec,
    pods: IntGaugeVec,
    state: IntGaugeVec,
}

pub type SharedMetrics = Arc<ControllerMetrics>;

impl ControllerMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "extendeddaemonset_reconciliations_total",
                "Reconciliation passes by controller and result",
            ),
            &["controller", "result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "extendeddaemonset_reconcile_duration_seconds",
                "Duration of reconciliation passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["controller"],
        )?;
        let pods = IntGaugeVec::new(
            Opts::new(
                "extendeddaemonset_pods",
                "Daemon pods of an ExtendedDaemonSet by counter",
            ),
            &["namespace", "name", "counter"],
        )?;
        let state = IntGaugeVec::new(
            Opts::new(
                "extendeddaemonset_state",
                "1 for the current rollout state of an ExtendedDaemonSet",
            ),
            &["namespace", "name", "state"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(pods.clone()))?;
        registry.register(Box::new(state.clone()))?;

        Ok(ControllerMetrics {
            registry,
            reconciliations,
            reconcile_duration,
            pods,
            state,
        })
    }

    pub fn record_reconciliation_success(&self, controller: &str, duration_secs: f64) {
        self.reconciliations
            .with_label_values(&[controller, "success"])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(duration_secs);
    }

    pub fn record_reconciliation_error(&self, controller: &str, duration_secs: f64) {
        self.reconciliations
            .with_label_values(&[controller, "error"])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(duration_secs);
    }

    /// Pass skipped because this replica does not hold the lease
    pub fn record_reconciliation_skipped(&self, controller: &str) {
        self.reconciliations
            .with_label_values(&[controller, "skipped"])
            .inc();
    }

    /// Publish pod counters and the rollout state of one ExtendedDaemonSet
    pub fn observe_extended_daemon_set(
        &self,
        namespace: &str,
        name: &str,
        status: &ExtendedDaemonSetStatus,
    ) {
        for (counter, value) in pod_counters(status) {
            self.pods
                .with_label_values(&[namespace, name, counter])
                .set(i64::from(value));
        }

        let current = status.state.unwrap_or_default();
        for state in STATES {
            self.state
                .with_label_values(&[namespace, name, state_label(*state)])
                .set(i64::from(*state == current));
        }
    }

    /// Drop every series of a deleted ExtendedDaemonSet
    pub fn forget_extended_daemon_set(&self, namespace: &str, name: &str) {
        for (counter, _) in pod_counters(&ExtendedDaemonSetStatus::default()) {
            let _ = self.pods.remove_label_values(&[namespace, name, counter]);
        }
        for state in STATES {
            let _ = self
                .state
                .remove_label_values(&[namespace, name, state_label(*state)]);
        }
    }

    /// Registry contents in the Prometheus text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

pub fn create_metrics() -> Result<SharedMetrics, MetricsError> {
    Ok(Arc::new(ControllerMetrics::new()?))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_reconciliation_counters_are_encoded() {
        let metrics = create_metrics().unwrap();

        metrics.record_reconciliation_success("extendeddaemonset", 0.2);
        metrics.record_reconciliation_error("ExtendedDaemonSetReplicaSet", 0.0);
        metrics.record_reconciliation_skipped("extendeddaemonsetreplicaset");

        let text = metrics.encode().unwrap();
        assert!(text.contains(
            "extendeddaemonset_reconciliations_total{controller=\"extendeddaemonset\",result=\"success\"} 1"
        ));
        assert!(text.contains("result=\"error\""));
        assert!(text.contains("result=\"skipped\""));
        assert!(text.contains("extendeddaemonset_reconcile_duration_seconds_bucket"));
    }

    #[test]
    fn test_state_gauge_marks_only_current_state() {
        let metrics = create_metrics().unwrap();
        let status = ExtendedDaemonSetStatus {
            desired: 3,
            up_to_date: 1,
            state: Some(EdsState::Canary),
            ..Default::default()
        };

        metrics.observe_extended_daemon_set("monitoring", "agent", &status);

        let text = metrics.encode().unwrap();
        assert!(text.contains(
            "extendeddaemonset_state{name=\"agent\",namespace=\"monitoring\",state=\"canary\"} 1"
        ));
        assert!(text.contains(
            "extendeddaemonset_state{name=\"agent\",namespace=\"monitoring\",state=\"running\"} 0"
        ));
        assert!(text.contains(
            "extendeddaemonset_pods{counter=\"desired\",name=\"agent\",namespace=\"monitoring\"} 3"
        ));
    }

    #[test]
    fn test_forget_removes_only_the_deleted_object() {
        let metrics = create_metrics().unwrap();
        let status = ExtendedDaemonSetStatus {
            desired: 3,
            state: Some(EdsState::Running),
            ..Default::default()
        };
        metrics.observe_extended_daemon_set("monitoring", "agent", &status);
        metrics.observe_extended_daemon_set("monitoring", "logs", &status);

        metrics.forget_extended_daemon_set("monitoring", "agent");
        // Unknown objects are ignored
        metrics.forget_extended_daemon_set("monitoring", "missing");

        let text = metrics.encode().unwrap();
        assert!(!text.contains("name=\"agent\""));
        assert!(text.contains(
            "extendeddaemonset_pods{counter=\"desired\",name=\"logs\",namespace=\"monitoring\"} 3"
        ));
        assert!(text.contains(
            "extendeddaemonset_state{name=\"logs\",namespace=\"monitoring\",state=\"running\"} 1"
        ));
    }
}
