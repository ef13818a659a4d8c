//! Pod health signals
//!
//! Readiness, restart tracking and start-failure classification read from
//! pod status. Canary evaluation and rolling-update pacing both build on
//! these; none of them touch the API.

use super::clock::time_to_utc;
use super::node::NODE_NAME_FIELD;
use crate::crd::extended_daemon_set::CanaryReason;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodCondition};

/// Pods left unscheduled this long are treated as stuck
const UNSCHEDULED_GRACE_SECS: i64 = 10 * 60;

/// Waiting reasons meaning the container will not start without intervention
const CANNOT_START_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "ImageInspectError",
    "ErrImageNeverPull",
    "RegistryUnavailable",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "PreStartHookError",
    "PostStartHookError",
    "PreCreateHookError",
];

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

fn condition<'a>(pod: &'a Pod, type_: &str) -> Option<&'a PodCondition> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == type_))
}

fn container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    let status = pod.status.as_ref();
    let regular = status.and_then(|s| s.container_statuses.as_deref());
    let init = status.and_then(|s| s.init_container_statuses.as_deref());
    let ephemeral = status.and_then(|s| s.ephemeral_container_statuses.as_deref());
    regular
        .unwrap_or_default()
        .iter()
        .chain(init.unwrap_or_default())
        .chain(ephemeral.unwrap_or_default())
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    condition(pod, "Ready")
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

/// Ready, and ready for at least `min_ready_seconds`
pub fn is_pod_available(pod: &Pod, min_ready_seconds: i64, now: DateTime<Utc>) -> bool {
    if !is_pod_ready(pod) {
        return false;
    }
    if min_ready_seconds == 0 {
        return true;
    }
    condition(pod, "Ready")
        .and_then(|c| c.last_transition_time.as_ref())
        .and_then(time_to_utc)
        .map(|since| since + chrono::Duration::seconds(min_ready_seconds) < now)
        .unwrap_or(false)
}

/// Highest container restart count and the reason of its last termination
pub fn highest_restart_count(pod: &Pod) -> (i32, String) {
    let mut count = 0;
    let mut reason = CanaryReason::Unknown.to_string();

    for status in container_statuses(pod) {
        if status.restart_count > count {
            count = status.restart_count;
            reason = last_termination_reason(status)
                .unwrap_or_else(|| CanaryReason::Unknown.to_string());
        }
    }

    (count, reason)
}

/// Most recent container restart, with the reason of that termination
pub fn most_recent_restart(pod: &Pod) -> Option<(DateTime<Utc>, String)> {
    let mut latest: Option<(DateTime<Utc>, String)> = None;

    for status in container_statuses(pod) {
        if status.restart_count == 0 {
            continue;
        }
        let Some(finished) = status
            .last_state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
            .and_then(|t| t.finished_at.as_ref())
            .and_then(time_to_utc)
        else {
            continue;
        };
        if latest.as_ref().map(|(t, _)| finished > *t).unwrap_or(true) {
            let reason = last_termination_reason(status)
                .unwrap_or_else(|| CanaryReason::Unknown.to_string());
            latest = Some((finished, reason));
        }
    }

    latest
}

fn last_termination_reason(status: &ContainerStatus) -> Option<String> {
    status
        .last_state
        .as_ref()
        .and_then(|s| s.terminated.as_ref())
        .and_then(|t| t.reason.clone())
        .filter(|r| !r.is_empty())
}

fn waiting_reasons(pod: &Pod) -> impl Iterator<Item = &str> {
    container_statuses(pod).filter_map(|s| {
        s.state
            .as_ref()
            .and_then(|st| st.waiting.as_ref())
            .and_then(|w| w.reason.as_deref())
    })
}

/// Start failure the pod is stuck in, if any
pub fn cannot_start(pod: &Pod) -> Option<CanaryReason> {
    waiting_reasons(pod)
        .find(|reason| CANNOT_START_REASONS.contains(reason))
        .map(CanaryReason::from_container_reason)
}

/// Containers still being created; may resolve on its own
pub fn pending_create(pod: &Pod) -> bool {
    waiting_reasons(pod).any(|reason| reason == "ContainerCreating")
}

pub fn start_time(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status
        .as_ref()
        .and_then(|s| s.start_time.as_ref())
        .and_then(time_to_utc)
}

pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Node the pod is bound to, or pinned to through node affinity
pub fn pod_node_name(pod: &Pod) -> Option<String> {
    let spec = pod.spec.as_ref()?;
    if let Some(name) = spec.node_name.as_ref().filter(|n| !n.is_empty()) {
        return Some(name.clone());
    }
    spec.affinity
        .as_ref()?
        .node_affinity
        .as_ref()?
        .required_during_scheduling_ignored_during_execution
        .as_ref()?
        .node_selector_terms
        .iter()
        .flat_map(|term| term.match_fields.as_deref().unwrap_or_default())
        .find(|req| req.key == NODE_NAME_FIELD && req.operator == "In")
        .and_then(|req| req.values.as_ref()?.first().cloned())
}

/// Unscheduled for too long, or terminating past its grace period
pub fn has_scheduler_issue(pod: &Pod, now: DateTime<Utc>) -> bool {
    let scheduled = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_ref())
        .map(|n| !n.is_empty())
        .unwrap_or(false);
    let created = pod.metadata.creation_timestamp.as_ref().and_then(time_to_utc);
    if !scheduled && created.map(|c| c + chrono::Duration::seconds(UNSCHEDULED_GRACE_SECS) < now).unwrap_or(false) {
        return true;
    }

    let deleted = pod.metadata.deletion_timestamp.as_ref().and_then(time_to_utc);
    match (deleted, pod.metadata.deletion_grace_period_seconds) {
        (Some(deleted), Some(grace)) => deleted + chrono::Duration::seconds(grace) < now,
        _ => false,
    }
}

/// Scheduler reported that no node can host the pod
pub fn is_unschedulable(pod: &Pod) -> bool {
    condition(pod, "PodScheduled")
        .map(|c| c.status == "False" && c.reason.as_deref() == Some("Unschedulable"))
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "pod_test.rs"]
mod tests;
