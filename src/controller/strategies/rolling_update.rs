//! Rolling update of the active generation
//!
//! Replaces outdated pods node by node within the unavailability budget and
//! admits pod creations in slow-start waves.

use super::limits::{compute_pod_to_create_and_delete, max_creation, LimitParams};
use super::{
    is_owned_by, is_pod_up_to_date, pod_has_label, unscheduled_nodes, ReplicaSetStrategy,
    StrategyError, StrategyParams, StrategyResult,
};
use crate::controller::clock::to_std_duration;
use crate::controller::conditions::{self, UpdateOptions};
use crate::controller::pod::{has_scheduler_issue, is_pod_available, is_pod_ready, is_terminating, pod_name};
use crate::controller::validation::resolve_int_or_percent;
use crate::crd::condition::{ConditionStatus, ConditionType};
use crate::crd::keys::{ERS_CANARY_LABEL, UNREADY_PODS_ANNOTATION};
use crate::crd::replica_set::{ExtendedDaemonSetReplicaSet, ReplicaSetRole};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Canary labels are removed only during the first minutes of the rolling update
const CLEAN_CANARY_LABELS_WINDOW_SECS: i64 = 5 * 60;

pub struct RollingUpdateStrategy;

impl ReplicaSetStrategy for RollingUpdateStrategy {
    fn name(&self) -> &'static str {
        "rolling-update"
    }

    fn plan(&self, params: StrategyParams<'_>) -> Result<StrategyResult, StrategyError> {
        let now = params.now;
        let policy = &params.policy.rolling_update;
        let is_paused = params.intent.is_rolling_update_paused();
        let is_frozen = params.intent.is_frozen();

        let mut status = params.status.clone();
        status.status = ReplicaSetRole::Active;
        let opts = UpdateOptions::default();
        for (type_, value) in [
            (ConditionType::RollingUpdatePaused, is_paused),
            (ConditionType::RolloutFrozen, is_frozen),
            (ConditionType::Active, !is_paused && !is_frozen),
        ] {
            conditions::upsert(
                &mut status.conditions,
                now,
                type_,
                ConditionStatus::from_bool(value),
                "",
                "",
                opts,
            );
        }

        let nodes: Vec<_> = params
            .nodes
            .iter()
            .filter(|item| !params.canary_nodes.iter().any(|c| c == item.name()))
            .collect();
        let nb_nodes = nodes.len() as i32;

        let max_unschedulable = resolve_int_or_percent(&policy.max_pod_scheduler_failure, nb_nodes)
            .map_err(StrategyError::InvalidRollingUpdate)?;

        let mut counts = LimitParams {
            nb_nodes,
            max_unschedulable,
            ..Default::default()
        };
        let mut ready = 0;
        let mut to_create = Vec::new();
        let mut to_delete = Vec::new();

        for item in &nodes {
            let Some(pod) = &item.pod else {
                to_create.push(item.name().to_string());
                continue;
            };
            if has_scheduler_issue(pod, now) {
                counts.nb_unresponsive += 1;
                continue;
            }

            counts.nb_pods += 1;
            if !is_pod_up_to_date(params.replica_set, pod, item) {
                if is_terminating(pod) {
                    continue;
                }
                to_delete.push(pod_name(pod).to_string());
                if is_pod_available(pod, 0, now) {
                    counts.nb_old_available += 1;
                }
            } else {
                counts.nb_created += 1;
                if is_pod_available(pod, 0, now) {
                    counts.nb_available += 1;
                }
                if is_pod_ready(pod) {
                    ready += 1;
                }
            }
        }

        counts.max_unavailable = resolve_int_or_percent(&policy.max_unavailable, nb_nodes)
            .map_err(StrategyError::InvalidRollingUpdate)?;
        let started = rolling_update_start(params.replica_set, now);
        counts.max_creation = max_creation(policy, nb_nodes, started, now)
            .map_err(StrategyError::InvalidRollingUpdate)?;
        counts.nb_unready = unready_pods(params.replica_set)?;

        let (nb_create, nb_delete) = compute_pod_to_create_and_delete(&counts);
        let nb_create = nb_create.min(to_create.len());
        let nb_delete = nb_delete.min(to_delete.len());

        debug!(
            replicaset = ?params.replica_set.metadata.name,
            nodes = nb_nodes,
            created = counts.nb_created,
            available = counts.nb_available,
            old_available = counts.nb_old_available,
            max_creation = counts.max_creation,
            max_unavailable = counts.max_unavailable,
            to_create = nb_create,
            to_delete = nb_delete,
            paused = is_paused,
            frozen = is_frozen,
            "Rolling update limits"
        );

        let mut result = StrategyResult {
            is_paused,
            is_frozen,
            ..Default::default()
        };

        // Paused only stops replacing pods; new nodes still get one
        if !is_paused && !is_frozen {
            to_delete.truncate(nb_delete);
            result.pods_to_delete = to_delete;
        }
        if !is_frozen {
            to_create.truncate(nb_create);
            result.pods_to_create = to_create;
        }

        status.desired = nb_nodes;
        status.current = counts.nb_created;
        status.ready = ready;
        status.available = counts.nb_available;
        status.ignored_unresponsive_nodes = counts.nb_unresponsive;
        result.unscheduled_nodes = unscheduled_nodes(nodes.iter().copied());

        if (now - started).num_seconds() < CLEAN_CANARY_LABELS_WINDOW_SECS {
            result.pods_to_unlabel = params
                .nodes
                .iter()
                .filter_map(|item| item.pod.as_ref())
                .filter(|pod| {
                    is_owned_by(pod, params.replica_set) && pod_has_label(pod, ERS_CANARY_LABEL, None)
                })
                .map(|pod| pod_name(pod).to_string())
                .collect();
        }

        if status.desired != status.ready {
            result.requeue(to_std_duration(params.policy.reconcile_frequency));
        }
        result.status = status;

        Ok(result)
    }
}

/// When the rolling update of this generation started
///
/// The `Active` condition flips to True when the generation starts rolling;
/// while it is False (paused, frozen or never active) the wave restarts from now.
pub fn rolling_update_start(
    replica_set: &ExtendedDaemonSetReplicaSet,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    conditions::true_since(replica_set.conditions(), ConditionType::Active).unwrap_or(now)
}

fn unready_pods(replica_set: &ExtendedDaemonSetReplicaSet) -> Result<i32, StrategyError> {
    match replica_set
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(UNREADY_PODS_ANNOTATION))
    {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i32>()
            .map_err(|_| StrategyError::InvalidUnreadyPods(raw.clone())),
    }
}
