//! Rolling-update pacing
//!
//! How many pods an active replica set may create and delete in one pass.

use crate::controller::validation::{resolve_int_or_percent, RollingUpdatePolicy};
use chrono::{DateTime, Utc};

/// Counters observed on the node set of one replica set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitParams {
    pub nb_nodes: i32,
    /// Pods present, excluding nodes with a scheduler issue
    pub nb_pods: i32,
    /// Up-to-date pods that are available
    pub nb_available: i32,
    /// Outdated pods that still serve
    pub nb_old_available: i32,
    pub nb_created: i32,
    pub nb_unresponsive: i32,
    /// Unready pods recorded when the replica set was created
    pub nb_unready: i32,
    pub max_unavailable: i32,
    pub max_creation: i32,
    pub max_unschedulable: i32,
}

/// Number of pods to create and to delete this pass
///
/// Both values are upper bounds; callers clamp them to their candidate lists.
pub fn compute_pod_to_create_and_delete(params: &LimitParams) -> (usize, usize) {
    let to_create = (params.nb_nodes - params.nb_pods)
        .min(params.max_creation)
        .max(0);

    let tolerated_unresponsive = params.nb_unresponsive.min(params.max_unschedulable);
    let unavailable = params.nb_nodes
        - params.nb_available
        - params.nb_old_available
        - tolerated_unresponsive;
    let budget = params.max_unavailable + params.nb_unready;
    let to_delete = (budget - unavailable).min(params.max_creation).max(0);

    (to_create as usize, to_delete as usize)
}

/// Size of the creation wave
///
/// Starts at `slowStartAdditiveIncrease` and grows by the same amount every
/// `slowStartIntervalDuration` since `started`, capped by
/// `maxParallelPodCreation`.
pub fn max_creation(
    policy: &RollingUpdatePolicy,
    nb_nodes: i32,
    started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<i32, String> {
    let step = resolve_int_or_percent(&policy.slow_start_additive_increase, nb_nodes)?;

    let interval_ms = policy.slow_start_interval.num_milliseconds();
    let elapsed_ms = (now - started).num_milliseconds().max(0);
    let slots = if interval_ms > 0 {
        elapsed_ms / interval_ms
    } else {
        0
    };

    let wave = (1 + slots).saturating_mul(step as i64);
    Ok(wave.min(policy.max_parallel_pod_creation as i64) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn policy(increase: IntOrString) -> RollingUpdatePolicy {
        RollingUpdatePolicy {
            max_unavailable: IntOrString::Int(1),
            max_pod_scheduler_failure: IntOrString::Int(0),
            max_parallel_pod_creation: 250,
            slow_start_interval: chrono::Duration::minutes(1),
            slow_start_additive_increase: increase,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_wave_starts_at_increase() {
        let got = max_creation(&policy(IntOrString::Int(1)), 10, now(), now()).unwrap();
        assert_eq!(got, 1);
    }

    #[test]
    fn test_wave_grows_each_interval() {
        let two_minutes_ago = now() - chrono::Duration::minutes(2);

        assert_eq!(
            max_creation(&policy(IntOrString::Int(1)), 10, two_minutes_ago, now()).unwrap(),
            3
        );
        assert_eq!(
            max_creation(&policy(IntOrString::Int(2)), 10, two_minutes_ago, now()).unwrap(),
            6
        );
    }

    #[test]
    fn test_wave_percent_increase() {
        // 10% of 100 nodes, 5 minutes in
        let started = now() - chrono::Duration::minutes(5);

        let got =
            max_creation(&policy(IntOrString::String("10%".into())), 100, started, now()).unwrap();

        assert_eq!(got, 60);
    }

    #[test]
    fn test_wave_capped_by_max_parallel() {
        let started = now() - chrono::Duration::minutes(10);

        let got = max_creation(&policy(IntOrString::Int(30)), 1000, started, now()).unwrap();

        assert_eq!(got, 250);
    }

    #[test]
    fn test_wave_invalid_increase_is_error() {
        let got = max_creation(&policy(IntOrString::String("10$".into())), 10, now(), now());
        assert!(got.is_err());
    }

    #[test]
    fn test_limits_fresh_rollout_deletes_within_budget() {
        // ARRANGE: 10 nodes all serving an old generation
        let params = LimitParams {
            nb_nodes: 10,
            nb_pods: 10,
            nb_old_available: 10,
            max_unavailable: 2,
            max_creation: 5,
            ..Default::default()
        };

        // ACT
        let (create, delete) = compute_pod_to_create_and_delete(&params);

        // ASSERT
        assert_eq!(create, 0);
        assert_eq!(delete, 2);
    }

    #[test]
    fn test_limits_budget_exhausted_blocks_deletes() {
        // Two nodes already without a serving pod
        let params = LimitParams {
            nb_nodes: 10,
            nb_pods: 8,
            nb_available: 3,
            nb_old_available: 5,
            nb_created: 3,
            max_unavailable: 2,
            max_creation: 5,
            ..Default::default()
        };

        let (create, delete) = compute_pod_to_create_and_delete(&params);

        assert_eq!(create, 2);
        assert_eq!(delete, 0);
    }

    #[test]
    fn test_limits_unready_pods_extend_budget() {
        let params = LimitParams {
            nb_nodes: 10,
            nb_pods: 10,
            nb_old_available: 7,
            nb_unready: 3,
            max_unavailable: 1,
            max_creation: 10,
            ..Default::default()
        };

        let (_, delete) = compute_pod_to_create_and_delete(&params);

        assert_eq!(delete, 1);
    }

    #[test]
    fn test_limits_tolerated_unresponsive_nodes() {
        // One unresponsive node tolerated by maxPodSchedulerFailure
        let params = LimitParams {
            nb_nodes: 5,
            nb_pods: 4,
            nb_old_available: 4,
            nb_unresponsive: 1,
            max_unschedulable: 1,
            max_unavailable: 1,
            max_creation: 3,
            ..Default::default()
        };

        let (_, delete) = compute_pod_to_create_and_delete(&params);

        assert_eq!(delete, 1);
    }
}
