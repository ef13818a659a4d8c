use super::filters::{desired_nodes, map_pods_to_nodes};
use super::pods::build_pod;
use crate::controller::clock::to_std_duration;
use crate::controller::conditions::{self, UpdateOptions};
use crate::controller::context::{Context, ReconcileError, RETRY_INTERVAL};
use crate::controller::intent::OperatorIntent;
use crate::controller::pod_control::PodControl;
use crate::controller::strategies::{
    apply_role_conditions, select_strategy, StrategyParams, StrategyResult,
};
use crate::controller::validation::{validate_extended_daemon_set, StrategyPolicy};
use crate::crd::condition::{ConditionStatus, ConditionType};
use crate::crd::extended_daemon_set::ExtendedDaemonSet;
use crate::crd::keys::{EDS_NAME_LABEL, ERS_CANARY_LABEL, TRUE_VALUE};
use crate::crd::replica_set::{
    ExtendedDaemonSetReplicaSet, ExtendedDaemonSetReplicaSetStatus, ReplicaSetRole,
};
use crate::crd::setting::ExtendedDaemonsetSetting;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const CONTROLLER_NAME: &str = "extendeddaemonsetreplicaset";

/// Snapshot read at the start of a pass
pub struct PassInput<'a> {
    pub replica_set: &'a ExtendedDaemonSetReplicaSet,
    pub eds: &'a ExtendedDaemonSet,
    pub policy: &'a StrategyPolicy,
    pub nodes: &'a [Node],
    pub pods: &'a [Pod],
    pub settings: &'a [ExtendedDaemonsetSetting],
    pub now: DateTime<Utc>,
}

/// Everything a pass intends to do, before any API call
#[derive(Debug)]
pub struct PassPlan {
    pub role: ReplicaSetRole,
    pub result: StrategyResult,
    /// Evicted, duplicate and stray pods; deleted without pacing
    pub cleanup: Vec<String>,
    /// Pods built for `result.pods_to_create`, in the same order
    pub creations: Vec<Pod>,
}

/// Name of the ExtendedDaemonSet controlling this replica set
pub fn owner_name(replica_set: &ExtendedDaemonSetReplicaSet) -> Option<String> {
    replica_set
        .owner_references()
        .iter()
        .find(|r| r.kind == "ExtendedDaemonSet")
        .map(|r| r.name.clone())
}

/// Role as recorded by the owner; a replica set is never both
pub fn replica_set_role(eds: &ExtendedDaemonSet, replica_set_name: &str) -> ReplicaSetRole {
    match eds.active_replica_set() {
        None | Some("") => ReplicaSetRole::Unknown,
        Some(active) if active == replica_set_name => ReplicaSetRole::Active,
        Some(_) if eds.canary_replica_set() == Some(replica_set_name) => ReplicaSetRole::Canary,
        Some(_) => ReplicaSetRole::Unknown,
    }
}

/// Time left before the next full pass is allowed
pub fn full_sync_wait(
    status: Option<&ExtendedDaemonSetReplicaSetStatus>,
    frequency: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    throttle_remaining(status?, ConditionType::LastFullSync, frequency, now)
}

fn throttle_remaining(
    status: &ExtendedDaemonSetReplicaSetStatus,
    type_: ConditionType,
    frequency: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let next = conditions::last_update(&status.conditions, type_)? + frequency;
    (next > now).then(|| to_std_duration(next - now))
}

/// Build the plan of one pass without touching the API
pub fn plan_pass(input: PassInput<'_>) -> Result<PassPlan, ReconcileError> {
    let replica_set = input.replica_set;
    let name = replica_set.name_any();
    let namespace = replica_set
        .namespace()
        .ok_or(ReconcileError::MissingNamespace("ExtendedDaemonSetReplicaSet"))?;
    let eds_name = input.eds.name_any();

    let role = replica_set_role(input.eds, &name);
    let canary_nodes: Vec<String> = input
        .eds
        .status
        .as_ref()
        .and_then(|s| s.canary.as_ref())
        .map(|c| c.nodes.clone())
        .unwrap_or_default();
    // The canary generation owns its nodes while it is in flight
    let ignored_nodes: &[String] = if role == ReplicaSetRole::Active {
        &canary_nodes
    } else {
        &[]
    };

    let (intent, _) = OperatorIntent::from_annotations(&input.eds.annotations_map())
        .effective(input.eds.canary_replica_set());

    let desired = desired_nodes(replica_set, input.nodes);
    let mapping = map_pods_to_nodes(
        replica_set,
        &namespace,
        &eds_name,
        desired,
        input.pods,
        input.settings,
        ignored_nodes,
    )?;

    let mut status = replica_set.status.clone().unwrap_or_default();
    apply_role_conditions(&mut status, role, input.now);

    let strategy = select_strategy(role);
    debug!(replicaset = %name, role = role.as_str(), strategy = strategy.name(), "Planning pass");
    let result = strategy.plan(StrategyParams {
        replica_set,
        policy: input.policy,
        intent: &intent,
        nodes: &mapping.items,
        canary_nodes: &canary_nodes,
        status,
        now: input.now,
    })?;

    let creations = result
        .pods_to_create
        .iter()
        .filter_map(|node| mapping.items.iter().find(|item| item.name() == node))
        .map(|item| build_pod(replica_set, &eds_name, role, item))
        .collect();

    let cleanup = match role {
        ReplicaSetRole::Active | ReplicaSetRole::Canary => mapping.to_cleanup,
        ReplicaSetRole::New | ReplicaSetRole::Unknown => Vec::new(),
    };

    Ok(PassPlan {
        role,
        result,
        cleanup,
        creations,
    })
}

/// Outcome of executing a plan
#[derive(Debug)]
pub struct PassOutcome {
    pub status: ExtendedDaemonSetReplicaSetStatus,
    pub requeue_after: Option<Duration>,
    pub errors: Vec<String>,
}

/// Execute a plan and record what happened in the status conditions
///
/// Paced deletions and creations each wait for `frequency` since their
/// previous batch; cleanup of stray pods is never delayed.
pub async fn execute_plan(
    pod_control: &dyn PodControl,
    namespace: &str,
    plan: PassPlan,
    frequency: chrono::Duration,
    now: DateTime<Utc>,
) -> PassOutcome {
    let PassPlan {
        result, cleanup, creations, ..
    } = plan;
    let mut status = result.status;
    let mut requeue_after = result.requeue_after;
    let mut errors = Vec::new();
    let tracked_true = UpdateOptions {
        ignore_false_if_not_exist: false,
        support_last_update: true,
    };

    for pod in &cleanup {
        if let Err(e) = pod_control.delete_pod(namespace, pod).await {
            errors.push(format!("delete pod {}: {}", pod, e));
        }
    }

    if !result.pods_to_delete.is_empty() {
        match throttle_remaining(&status, ConditionType::PodDeletion, frequency, now) {
            Some(wait) => {
                debug!(pending = result.pods_to_delete.len(), "Pod deletion throttled");
                requeue_after = Some(requeue_after.map_or(wait, |r| r.min(wait)));
            }
            None => {
                for pod in &result.pods_to_delete {
                    if let Err(e) = pod_control.delete_pod(namespace, pod).await {
                        errors.push(format!("delete pod {}: {}", pod, e));
                    }
                }
                info!(count = result.pods_to_delete.len(), "Deleted outdated pods");
                conditions::upsert(
                    &mut status.conditions,
                    now,
                    ConditionType::PodDeletion,
                    ConditionStatus::True,
                    "",
                    "pods deleted",
                    tracked_true,
                );
            }
        }
    }

    if !creations.is_empty() {
        match throttle_remaining(&status, ConditionType::PodCreation, frequency, now) {
            Some(wait) => {
                debug!(pending = creations.len(), "Pod creation throttled");
                requeue_after = Some(requeue_after.map_or(wait, |r| r.min(wait)));
            }
            None => {
                for (node, pod) in result.pods_to_create.iter().zip(&creations) {
                    if let Err(e) = pod_control.create_pod(namespace, pod).await {
                        errors.push(format!("create pod on node {}: {}", node, e));
                    }
                }
                info!(count = creations.len(), "Created pods");
                conditions::upsert(
                    &mut status.conditions,
                    now,
                    ConditionType::PodCreation,
                    ConditionStatus::True,
                    "",
                    "pods created",
                    tracked_true,
                );
            }
        }
    }

    for pod in &result.pods_to_label {
        if let Err(e) = pod_control
            .set_pod_label(namespace, pod, ERS_CANARY_LABEL, Some(TRUE_VALUE))
            .await
        {
            errors.push(format!("label pod {}: {}", pod, e));
        }
    }
    for pod in &result.pods_to_unlabel {
        if let Err(e) = pod_control
            .set_pod_label(namespace, pod, ERS_CANARY_LABEL, None)
            .await
        {
            errors.push(format!("unlabel pod {}: {}", pod, e));
        }
    }

    if result.unscheduled_nodes.is_empty() {
        conditions::upsert(
            &mut status.conditions,
            now,
            ConditionType::Unschedule,
            ConditionStatus::False,
            "",
            "",
            UpdateOptions::default(),
        );
    } else {
        conditions::upsert(
            &mut status.conditions,
            now,
            ConditionType::Unschedule,
            ConditionStatus::True,
            "",
            &format!("nodes:{}", result.unscheduled_nodes.join(";")),
            UpdateOptions::default(),
        );
    }

    if errors.is_empty() {
        conditions::upsert(
            &mut status.conditions,
            now,
            ConditionType::ReconcileError,
            ConditionStatus::False,
            "",
            "",
            UpdateOptions::tracked(),
        );
    } else {
        conditions::upsert(
            &mut status.conditions,
            now,
            ConditionType::ReconcileError,
            ConditionStatus::True,
            "",
            &errors.join("; "),
            tracked_true,
        );
        requeue_after = Some(requeue_after.map_or(RETRY_INTERVAL, |r| r.min(RETRY_INTERVAL)));
    }

    conditions::upsert(
        &mut status.conditions,
        now,
        ConditionType::LastFullSync,
        ConditionStatus::True,
        "",
        "full sync",
        UpdateOptions::tracked(),
    );

    PassOutcome {
        status,
        requeue_after,
        errors,
    }
}

/// Main reconciliation function for an ExtendedDaemonSetReplicaSet
///
/// Reads the owner, nodes, pods and settings, plans the pass with the
/// strategy of the replica set's role, executes the plan and writes the
/// status once at the end.
pub async fn reconcile(
    replica_set: Arc<ExtendedDaemonSetReplicaSet>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = replica_set.name_any();
    if let Some(action) = ctx.skip_unless_leader(CONTROLLER_NAME, &name) {
        return Ok(action);
    }
    let started = Instant::now();

    let namespace = replica_set
        .namespace()
        .ok_or(ReconcileError::MissingNamespace("ExtendedDaemonSetReplicaSet"))?;
    let eds_name = owner_name(&replica_set).ok_or_else(|| ReconcileError::MissingOwner(name.clone()))?;

    let eds_api: Api<ExtendedDaemonSet> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(eds) = eds_api.get_opt(&eds_name).await? else {
        debug!(replicaset = %name, eds = %eds_name, "Owner gone, waiting for garbage collection");
        return Ok(Action::await_change());
    };

    let now = ctx.clock.now();
    let policy = validate_extended_daemon_set(&eds, ctx.config.default_validation_mode)
        .map_err(ReconcileError::ValidationError)?;

    if let Some(wait) = full_sync_wait(replica_set.status.as_ref(), policy.reconcile_frequency, now) {
        debug!(replicaset = %name, wait_secs = wait.as_secs(), "Full sync throttled");
        return Ok(Action::requeue(wait));
    }

    let nodes = Api::<Node>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await?
        .items;
    let pods = Api::<Pod>::namespaced(ctx.client.clone(), &namespace)
        .list(&ListParams::default().labels(&format!("{}={}", EDS_NAME_LABEL, eds_name)))
        .await?
        .items;
    let settings: Vec<ExtendedDaemonsetSetting> =
        Api::<ExtendedDaemonsetSetting>::namespaced(ctx.client.clone(), &namespace)
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|s| s.reference_name() == Some(eds_name.as_str()))
            .collect();

    let plan = plan_pass(PassInput {
        replica_set: &replica_set,
        eds: &eds,
        policy: &policy,
        nodes: &nodes,
        pods: &pods,
        settings: &settings,
        now,
    })?;
    let role = plan.role;

    let outcome = execute_plan(
        ctx.pod_control.as_ref(),
        &namespace,
        plan,
        policy.reconcile_frequency,
        now,
    )
    .await;

    if !outcome.errors.is_empty() {
        warn!(
            replicaset = %name,
            errors = %outcome.errors.join("; "),
            "Some pod operations failed"
        );
    }

    if replica_set.status.as_ref() != Some(&outcome.status) {
        let api: Api<ExtendedDaemonSetReplicaSet> =
            Api::namespaced(ctx.client.clone(), &namespace);
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": outcome.status })),
        )
        .await?;
        debug!(replicaset = %name, role = role.as_str(), "Status updated");
    }

    ctx.record_success(CONTROLLER_NAME, started);

    Ok(match outcome.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}
