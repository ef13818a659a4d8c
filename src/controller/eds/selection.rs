//! Active versus up-to-date replica set arbitration and garbage collection

use super::state::{canary_ended, canary_failed, canary_paused};
use crate::controller::clock::to_std_duration;
use crate::controller::conditions;
use crate::controller::intent::OperatorIntent;
use crate::controller::validation::CanaryPolicy;
use crate::crd::condition::ConditionType;
use crate::crd::replica_set::ExtendedDaemonSetReplicaSet;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::time::Duration;

/// How long a failed canary generation is kept around for inspection
pub const FAILED_CANARY_RETENTION_SECS: i64 = 120;

/// Generation that serves the fleet this pass
#[derive(Debug)]
pub struct Selection<'a> {
    pub current: &'a ExtendedDaemonSetReplicaSet,
    /// Set while a canary is waiting for its duration to elapse
    pub requeue_after: Option<Duration>,
}

/// Pick between the active generation and the one matching the template
///
/// 1. active and up-to-date are the same generation: keep it
/// 2. no active generation: the up-to-date one takes over
/// 3. no canary configured: the up-to-date one takes over right away
/// 4. otherwise the canary is promoted once validated, or once its window
///    ended while not paused; a failed canary is never promoted
pub fn select_current<'a>(
    active: Option<&'a ExtendedDaemonSetReplicaSet>,
    up_to_date: &'a ExtendedDaemonSetReplicaSet,
    canary: Option<&CanaryPolicy>,
    intent: &OperatorIntent,
    now: DateTime<Utc>,
) -> Selection<'a> {
    let promote = |requeue_after| Selection {
        current: up_to_date,
        requeue_after,
    };

    let Some(active) = active else {
        return promote(None);
    };
    if active.name_any() == up_to_date.name_any() {
        return Selection {
            current: active,
            requeue_after: None,
        };
    }
    if canary.is_none() {
        return promote(None);
    }
    if canary_failed(up_to_date) {
        return Selection {
            current: active,
            requeue_after: None,
        };
    }

    let validated = intent.is_validated(&up_to_date.name_any());
    let (paused, _) = canary_paused(intent, up_to_date);
    let (ended, remaining) = canary_ended(canary, up_to_date, now);

    if validated || (!paused && ended) {
        return promote(None);
    }

    Selection {
        current: active,
        requeue_after: remaining
            .filter(|_| !paused)
            .map(to_std_duration)
            .filter(|d| !d.is_zero()),
    }
}

/// Garbage collection verdict for an unused generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    Delete,
    /// Keep for now; re-check after the given delay when set
    Retain(Option<Duration>),
}

/// A generation is deleted once it runs no pods, except that a failed canary
/// is retained for a while after the failure
pub fn cleanup_decision(replica_set: &ExtendedDaemonSetReplicaSet, now: DateTime<Utc>) -> Cleanup {
    if replica_set.pod_total() != 0 {
        return Cleanup::Retain(None);
    }
    let retention = chrono::Duration::seconds(FAILED_CANARY_RETENTION_SECS);
    match conditions::true_since(replica_set.conditions(), ConditionType::CanaryFailed) {
        Some(failed_at) if now < failed_at + retention => {
            Cleanup::Retain(Some(to_std_duration(failed_at + retention - now)))
        }
        _ => Cleanup::Delete,
    }
}

/// Names of the generations to delete, with the earliest retention expiry
///
/// The current and the up-to-date generations are never deleted, nor is a
/// generation already being deleted.
pub fn replica_sets_to_delete(
    replica_sets: &[ExtendedDaemonSetReplicaSet],
    current: &str,
    up_to_date: &str,
    now: DateTime<Utc>,
) -> (Vec<String>, Option<Duration>) {
    let mut to_delete = Vec::new();
    let mut requeue: Option<Duration> = None;

    for replica_set in replica_sets {
        let name = replica_set.name_any();
        if name == current || name == up_to_date || replica_set.metadata.deletion_timestamp.is_some() {
            continue;
        }
        match cleanup_decision(replica_set, now) {
            Cleanup::Delete => to_delete.push(name),
            Cleanup::Retain(Some(after)) => {
                requeue = Some(requeue.map(|r| r.min(after)).unwrap_or(after));
            }
            Cleanup::Retain(None) => {}
        }
    }

    (to_delete, requeue)
}
