//! Strategy pattern for replica set reconciliation
//!
//! Each role an ExtendedDaemonSetReplicaSet can hold maps to a strategy:
//! - RollingUpdateStrategy: the active generation, paced by the rolling update policy
//! - CanaryStrategy: the candidate generation, evaluated for auto pause/fail
//! - UnknownStrategy: a retired generation waiting for its pods to be replaced
//!
//! Strategies are pure planners: they read the node/pod snapshot of one pass
//! and return the pods to create and delete together with the new status.
//! The ERS reconciler executes the plan.

pub mod canary;
pub mod limits;
pub mod rolling_update;
pub mod unknown;

use crate::controller::conditions::{self, UpdateOptions};
use crate::controller::intent::OperatorIntent;
use crate::controller::settings::NodeOverrides;
use crate::controller::validation::StrategyPolicy;
use crate::controller::pod::is_unschedulable;
use crate::crd::condition::{ConditionStatus, ConditionType};
use crate::crd::keys::{ERS_NAME_LABEL, RESOURCES_HASH_ANNOTATION, TEMPLATE_HASH_ANNOTATION};
use crate::crd::replica_set::{
    ExtendedDaemonSetReplicaSet, ExtendedDaemonSetReplicaSetStatus, ReplicaSetRole,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use std::time::Duration;
use thiserror::Error;

/// Requeue delay used while pods are still converging
pub const REQUEUE_PROMPTLY: Duration = Duration::from_secs(1);

/// Errors specific to strategy planning
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StrategyError {
    #[error("Invalid rolling update parameter: {0}")]
    InvalidRollingUpdate(String),

    #[error("Invalid unready pods annotation: {0}")]
    InvalidUnreadyPods(String),

    #[error("Replica set {0} is a canary but the ExtendedDaemonSet has no canary strategy")]
    MissingCanaryPolicy(String),
}

/// One node of the desired set with the pod currently running on it
#[derive(Debug, Clone)]
pub struct NodeItem {
    pub node: Node,
    pub pod: Option<Pod>,
    pub overrides: NodeOverrides,
    /// Digest the pod on this node must carry as `resourceshash`
    pub resources_hash: Option<String>,
}

impl NodeItem {
    pub fn name(&self) -> &str {
        crate::controller::node::node_name(&self.node)
    }
}

/// Snapshot handed to a strategy for one pass
pub struct StrategyParams<'a> {
    pub replica_set: &'a ExtendedDaemonSetReplicaSet,
    pub policy: &'a StrategyPolicy,
    pub intent: &'a OperatorIntent,
    /// Desired node set, sorted by node name
    pub nodes: &'a [NodeItem],
    /// Nodes assigned to the in-flight canary
    pub canary_nodes: &'a [String],
    /// Status the strategy starts from; role conditions already applied
    pub status: ExtendedDaemonSetReplicaSetStatus,
    pub now: DateTime<Utc>,
}

/// Plan returned by a strategy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyResult {
    pub status: ExtendedDaemonSetReplicaSetStatus,
    /// Node names that need a pod of this generation
    pub pods_to_create: Vec<String>,
    /// Pod names to delete
    pub pods_to_delete: Vec<String>,
    /// Pods of this generation missing the canary label
    pub pods_to_label: Vec<String>,
    /// Pods of this generation still carrying the canary label
    pub pods_to_unlabel: Vec<String>,
    /// Nodes whose pod the scheduler reports as unschedulable
    pub unscheduled_nodes: Vec<String>,
    pub requeue_after: Option<Duration>,
    pub is_paused: bool,
    pub is_frozen: bool,
    pub is_failed: bool,
}

impl StrategyResult {
    pub fn requeue(&mut self, after: Duration) {
        self.requeue_after = Some(match self.requeue_after {
            Some(current) => current.min(after),
            None => after,
        });
    }
}

/// Strategy trait for the roles of a replica set
///
/// # Purity
/// `plan` has no side effects and returns the same plan for the same snapshot,
/// which makes a pass safe to rerun from any intermediate state.
pub trait ReplicaSetStrategy: Send + Sync {
    /// Strategy name for logging
    fn name(&self) -> &'static str;

    fn plan(&self, params: StrategyParams<'_>) -> Result<StrategyResult, StrategyError>;
}

/// Select the strategy handler for a replica set role
///
/// `New` never reaches a strategy: the role is derived from the owning
/// ExtendedDaemonSet status, which only knows active, canary or neither.
pub fn select_strategy(role: ReplicaSetRole) -> Box<dyn ReplicaSetStrategy> {
    use self::{
        canary::CanaryStrategy, rolling_update::RollingUpdateStrategy, unknown::UnknownStrategy,
    };

    match role {
        ReplicaSetRole::Active => Box::new(RollingUpdateStrategy),
        ReplicaSetRole::Canary => Box::new(CanaryStrategy),
        ReplicaSetRole::New | ReplicaSetRole::Unknown => Box::new(UnknownStrategy),
    }
}

/// Record the role of a replica set in its conditions before planning
pub fn apply_role_conditions(
    status: &mut ExtendedDaemonSetReplicaSetStatus,
    role: ReplicaSetRole,
    now: DateTime<Utc>,
) {
    let updates: &[(ConditionType, bool)] = match role {
        ReplicaSetRole::Active => &[
            (ConditionType::Canary, false),
            (ConditionType::CanaryPaused, false),
            (ConditionType::CanaryFailed, false),
        ],
        ReplicaSetRole::Canary => &[(ConditionType::Canary, true), (ConditionType::Active, false)],
        ReplicaSetRole::New | ReplicaSetRole::Unknown => {
            &[(ConditionType::Canary, false), (ConditionType::Active, false)]
        }
    };
    for (type_, value) in updates {
        conditions::upsert(
            &mut status.conditions,
            now,
            *type_,
            ConditionStatus::from_bool(*value),
            "",
            "",
            UpdateOptions::default(),
        );
    }
}

/// Fingerprint of the template a replica set runs
pub fn replica_set_hash(replica_set: &ExtendedDaemonSetReplicaSet) -> &str {
    replica_set
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(TEMPLATE_HASH_ANNOTATION))
        .map(String::as_str)
        .unwrap_or(replica_set.spec.template_generation.as_str())
}

/// Whether the pod runs this generation's template with this node's overrides
pub fn is_pod_up_to_date(
    replica_set: &ExtendedDaemonSetReplicaSet,
    pod: &Pod,
    node: &NodeItem,
) -> bool {
    let annotations = pod.metadata.annotations.as_ref();
    let template_hash = annotations.and_then(|a| a.get(TEMPLATE_HASH_ANNOTATION));
    let resources_hash = annotations.and_then(|a| a.get(RESOURCES_HASH_ANNOTATION));

    template_hash.map(String::as_str) == Some(replica_set_hash(replica_set))
        && resources_hash == node.resources_hash.as_ref()
}

/// Label lookup; `None` matches any value
pub(crate) fn pod_has_label(pod: &Pod, key: &str, value: Option<&str>) -> bool {
    match pod.metadata.labels.as_ref().and_then(|l| l.get(key)) {
        Some(current) => value.map(|v| v == current).unwrap_or(true),
        None => false,
    }
}

/// Whether the pod was created by this replica set
pub(crate) fn is_owned_by(pod: &Pod, replica_set: &ExtendedDaemonSetReplicaSet) -> bool {
    let name = replica_set.metadata.name.as_deref().unwrap_or_default();
    pod_has_label(pod, ERS_NAME_LABEL, Some(name))
}

/// Nodes whose pod the scheduler cannot place
pub(crate) fn unscheduled_nodes<'a>(nodes: impl Iterator<Item = &'a NodeItem>) -> Vec<String> {
    nodes
        .filter(|item| item.pod.as_ref().map(is_unschedulable).unwrap_or(false))
        .map(|item| item.name().to_string())
        .collect()
}

#[cfg(test)]
#[path = "strategies_test.rs"]
mod tests;
