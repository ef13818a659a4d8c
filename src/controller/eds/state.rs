//! Canary predicates and status derivation
//!
//! The ExtendedDaemonSet status is recomputed from scratch every pass out of
//! the replica set statuses, the operator intent and the canary policy. Only
//! the condition list carries over from the previous status.

use crate::controller::clock::time_to_utc;
use crate::controller::conditions::{self, UpdateOptions};
use crate::controller::intent::{CanaryIntent, OperatorIntent};
use crate::controller::validation::CanaryPolicy;
use crate::crd::condition::{ConditionStatus, ConditionType};
use crate::crd::extended_daemon_set::{CanaryStatus, EdsState, ExtendedDaemonSetStatus};
use crate::crd::replica_set::ExtendedDaemonSetReplicaSet;
use chrono::{DateTime, Duration, Utc};
use kube::ResourceExt;

/// Signed time left before the canary may be promoted automatically
///
/// The later of `creation + duration` and `last restart + noRestartsDuration`
/// wins. `None` when the policy has no duration (manual validation).
pub fn canary_remaining(
    canary: &CanaryPolicy,
    replica_set: &ExtendedDaemonSetReplicaSet,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let duration = canary.duration?;
    let created = replica_set
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(time_to_utc)
        .unwrap_or(now);
    let mut remaining = created + duration - now;

    if let Some(no_restarts) = canary.no_restarts_duration {
        if let Some(last_restart) =
            conditions::last_update(replica_set.conditions(), ConditionType::PodRestarting)
        {
            remaining = remaining.max(last_restart + no_restarts - now);
        }
    }
    Some(remaining)
}

/// Whether the canary window is over, with the time left when it is not
pub fn canary_ended(
    canary: Option<&CanaryPolicy>,
    replica_set: &ExtendedDaemonSetReplicaSet,
    now: DateTime<Utc>,
) -> (bool, Option<Duration>) {
    let Some(canary) = canary else {
        return (true, None);
    };
    match canary_remaining(canary, replica_set, now) {
        Some(remaining) => (remaining <= Duration::zero(), Some(remaining)),
        None => (false, None),
    }
}

/// Pause flag and reason; the annotation wins over the replica set condition
///
/// Removing the `canary-paused` annotation does not resume the canary: the
/// pause lives on in the replica set's `CanaryPaused` condition until the
/// operator sets `canary-unpaused`.
pub fn canary_paused(
    intent: &OperatorIntent,
    replica_set: &ExtendedDaemonSetReplicaSet,
) -> (bool, String) {
    match &intent.canary {
        CanaryIntent::Paused { reason } => (true, reason.clone()),
        CanaryIntent::Unpaused => (false, String::new()),
        CanaryIntent::None => match replica_set.condition(ConditionType::CanaryPaused) {
            Some(c) if c.is_true() => (true, c.reason.clone()),
            _ => (false, String::new()),
        },
    }
}

pub fn canary_failed(replica_set: &ExtendedDaemonSetReplicaSet) -> bool {
    replica_set.is_condition_true(ConditionType::CanaryFailed)
}

/// A generation whose canary failed must never serve the fleet
///
/// A newly selected generation carrying `CanaryFailed=True` was promoted
/// despite the failure. A generation that already served as active may keep
/// the condition only if it was created before the failure was recorded.
pub fn check_promotion_integrity(
    current: &ExtendedDaemonSetReplicaSet,
    previous_active: Option<&str>,
) -> Result<(), String> {
    let name = current.name_any();
    let Some(failed_at) = conditions::true_since(current.conditions(), ConditionType::CanaryFailed)
    else {
        return Ok(());
    };

    let created = current
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(time_to_utc);
    let was_active = previous_active == Some(name.as_str());
    let created_before_failure = created.map(|c| c <= failed_at).unwrap_or(false);

    if was_active && created_before_failure {
        return Ok(());
    }
    Err(format!(
        "replica set {} was promoted after its canary failed at {}",
        name,
        failed_at.to_rfc3339()
    ))
}

/// Inputs of the status derivation
pub struct StatusInput<'a> {
    pub previous: Option<&'a ExtendedDaemonSetStatus>,
    pub replica_sets: &'a [ExtendedDaemonSetReplicaSet],
    pub current: &'a ExtendedDaemonSetReplicaSet,
    pub up_to_date: &'a ExtendedDaemonSetReplicaSet,
    pub canary: Option<&'a CanaryPolicy>,
    /// Intent after policy violations were dropped
    pub intent: &'a OperatorIntent,
    pub canary_nodes: Vec<String>,
    pub now: DateTime<Utc>,
}

/// Canary facts for one pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanaryView {
    pub failed: bool,
    pub paused: bool,
    pub paused_reason: String,
    /// A candidate generation is in flight and not failed
    pub active: bool,
}

impl CanaryView {
    pub fn new(
        canary: Option<&CanaryPolicy>,
        intent: &OperatorIntent,
        current: &ExtendedDaemonSetReplicaSet,
        up_to_date: &ExtendedDaemonSetReplicaSet,
    ) -> Self {
        if canary.is_none() {
            return CanaryView::default();
        }
        let failed = canary_failed(up_to_date);
        let (paused, paused_reason) = canary_paused(intent, up_to_date);
        CanaryView {
            failed,
            paused,
            paused_reason,
            active: !failed && current.name_any() != up_to_date.name_any(),
        }
    }
}

/// Recompute the ExtendedDaemonSet status for this pass
pub fn derive_status(input: &StatusInput<'_>, view: &CanaryView) -> ExtendedDaemonSetStatus {
    let mut status = ExtendedDaemonSetStatus {
        conditions: input
            .previous
            .map(|s| s.conditions.clone())
            .unwrap_or_default(),
        ..Default::default()
    };

    for replica_set in input.replica_sets {
        if let Some(rs) = &replica_set.status {
            status.current += rs.current;
            status.ready += rs.ready;
            status.available += rs.available;
        }
    }

    let current = input.current.status.clone().unwrap_or_default();
    status.active_replica_set = Some(input.current.name_any());
    status.desired = current.desired;
    status.up_to_date = current.current;
    status.ignored_unresponsive_nodes = current.ignored_unresponsive_nodes;
    status.state = Some(input.intent.non_canary_state());

    if input.canary.is_none() {
        return status;
    }

    let up_to_date_name = input.up_to_date.name_any();
    write_canary_conditions(&mut status, view, &up_to_date_name, input.now);

    if view.failed {
        status.state = Some(EdsState::Failed);
    } else if view.active {
        let candidate = input.up_to_date.status.clone().unwrap_or_default();
        status.desired += candidate.desired;
        status.up_to_date = candidate.current;
        status.ignored_unresponsive_nodes += candidate.ignored_unresponsive_nodes;
        if view.paused {
            status.state = Some(EdsState::CanaryPaused);
            status.reason = Some(view.paused_reason.clone());
        } else {
            status.state = Some(EdsState::Canary);
        }
        status.canary = Some(CanaryStatus {
            replica_set: up_to_date_name,
            nodes: input.canary_nodes.clone(),
        });
    }

    status
}

fn write_canary_conditions(
    status: &mut ExtendedDaemonSetStatus,
    view: &CanaryView,
    replica_set: &str,
    now: DateTime<Utc>,
) {
    let opts = UpdateOptions::default();

    let (failed, failed_reason, failed_message) = if view.failed {
        (
            ConditionStatus::True,
            "CanaryFailed",
            format!("canary failed with ers: {}", replica_set),
        )
    } else {
        (ConditionStatus::False, "", String::new())
    };
    conditions::upsert(
        &mut status.conditions,
        now,
        ConditionType::CanaryFailed,
        failed,
        failed_reason,
        &failed_message,
        opts,
    );

    let paused = view.paused && !view.failed;
    let message = if paused {
        format!("canary paused with ers: {}", replica_set)
    } else {
        String::new()
    };
    conditions::upsert(
        &mut status.conditions,
        now,
        ConditionType::CanaryPaused,
        ConditionStatus::from_bool(paused),
        &view.paused_reason,
        &message,
        opts,
    );
}
