//! State shared by the ExtendedDaemonSet, replica set and setting controllers

use crate::controller::clock::Clock;
use crate::controller::intent::PolicyViolation;
use crate::controller::pod_control::{KubePodControl, PodControl};
use crate::controller::strategies::StrategyError;
use crate::crd::extended_daemon_set::CanaryValidationMode;
use crate::server::{LeaderState, SharedMetrics};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Requeue delay after a transient failure
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Requeue delay after a failure that needs operator action
pub const BLOCKED_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Requeue delay while another replica holds the leader lease
pub const NOT_LEADER_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{0} missing namespace")]
    MissingNamespace(&'static str),

    #[error("Replica set {0} has no ExtendedDaemonSet owner")]
    MissingOwner(String),

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid ExtendedDaemonSet spec: {0}")]
    ValidationError(String),

    #[error("Strategy planning failed: {0}")]
    StrategyError(#[from] StrategyError),

    #[error("Rejected operator action: {0}")]
    PolicyViolation(#[from] PolicyViolation),

    /// A generation whose canary failed became active anyway
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),
}

impl ReconcileError {
    /// Transient errors are retried quickly; the rest wait for a spec or
    /// annotation change from the operator
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::KubeError(_)
            | ReconcileError::MissingOwner(_)
            | ReconcileError::SerializationError(_) => true,
            ReconcileError::StrategyError(e) => {
                matches!(e, StrategyError::MissingCanaryPolicy(_))
            }
            ReconcileError::MissingNamespace(_)
            | ReconcileError::ValidationError(_)
            | ReconcileError::PolicyViolation(_)
            | ReconcileError::IntegrityViolation(_) => false,
        }
    }
}

/// Start-up settings read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Validation mode applied to canaries that do not set one
    pub default_validation_mode: CanaryValidationMode,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            default_validation_mode: CanaryValidationMode::Auto,
        }
    }
}

impl ControllerConfig {
    /// `EDS_DEFAULT_VALIDATION_MODE`: auto (default) or manual
    pub fn from_env() -> Self {
        let default_validation_mode = match std::env::var("EDS_DEFAULT_VALIDATION_MODE")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "manual" => CanaryValidationMode::Manual,
            _ => CanaryValidationMode::Auto,
        };
        ControllerConfig {
            default_validation_mode,
        }
    }
}

pub struct Context {
    pub client: kube::Client,
    pub pod_control: Arc<dyn PodControl>,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
    /// When Some, reconciliation is skipped unless this replica leads
    pub leader_state: Option<LeaderState>,
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    /// Context without leader election (single instance mode)
    pub fn new(
        client: kube::Client,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            pod_control: Arc::new(KubePodControl::new(client.clone())),
            client,
            clock,
            config,
            leader_state: None,
            metrics,
        }
    }

    /// Context that only reconciles while `leader_state` holds the lease
    pub fn new_with_leader(
        client: kube::Client,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
        leader_state: LeaderState,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            leader_state: Some(leader_state),
            ..Self::new(client, clock, config, metrics)
        }
    }

    pub fn should_reconcile(&self) -> bool {
        match &self.leader_state {
            None => true,
            Some(state) => state.is_leader(),
        }
    }

    /// Common entry check; returns the requeue action when not leading
    pub(crate) fn skip_unless_leader(&self, controller: &str, name: &str) -> Option<Action> {
        if self.should_reconcile() {
            return None;
        }
        debug!(controller, name, "Skipping reconciliation - not leader");
        if let Some(metrics) = &self.metrics {
            metrics.record_reconciliation_skipped(controller);
        }
        Some(Action::requeue(NOT_LEADER_INTERVAL))
    }

    pub(crate) fn record_success(&self, controller: &str, started: std::time::Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_reconciliation_success(controller, started.elapsed().as_secs_f64());
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub fn new_mock(
        pod_control: Arc<dyn PodControl>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        // The client is never reached by unit tests
        let mut config = kube::Config::new("https://localhost:8080".parse().unwrap());
        config.default_namespace = "default".to_string();
        config.accept_invalid_certs = true;
        let client = kube::Client::try_from(config).unwrap();

        Context {
            client,
            pod_control,
            clock,
            config: ControllerConfig::default(),
            leader_state: None,
            metrics: None,
        }
    }
}

/// Requeue policy shared by the three controllers
pub fn error_policy<K>(object: Arc<K>, err: &ReconcileError, ctx: Arc<Context>) -> Action
where
    K: kube::Resource,
    K::DynamicType: Default,
{
    let kind = K::kind(&Default::default()).to_string();
    let name = object.name_any();

    if let Some(metrics) = &ctx.metrics {
        metrics.record_reconciliation_error(&kind.to_lowercase(), 0.0);
    }

    if err.is_retryable() {
        warn!(kind = %kind, name = %name, error = %err, "Reconciliation failed, retrying");
        Action::requeue(RETRY_INTERVAL)
    } else {
        error!(kind = %kind, name = %name, error = %err, "Reconciliation blocked until the object changes");
        Action::requeue(BLOCKED_INTERVAL)
    }
}
