#![allow(clippy::unwrap_used)]

use super::*;
use crate::controller::intent::{CanaryIntent, RolloutIntent};
use crate::controller::validation::resolve_strategy;
use crate::crd::extended_daemon_set::{
    CanaryAutoFail, CanaryAutoPause, CanarySpec, CanaryValidationMode, ExtendedDaemonSetStrategy,
};
use crate::crd::keys::ERS_CANARY_LABEL;
use chrono::TimeZone;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn replica_set(name: &str, hash: &str, status: &str) -> ExtendedDaemonSetReplicaSet {
    serde_yaml::from_str(&format!(
        r#"
apiVersion: datadoghq.com/v1alpha1
kind: ExtendedDaemonSetReplicaSet
metadata:
  name: {name}
  namespace: monitoring
  annotations:
    extendeddaemonset.datadoghq.com/templatehash: {hash}
spec:
  template: {{}}
  templateGeneration: {hash}
{status}
"#
    ))
    .unwrap()
}

fn pod(name: &str, node: &str, owner: &str, hash: &str, ready: bool, restarts: i32) -> Pod {
    let status = if ready { "True" } else { "False" };
    serde_yaml::from_str(&format!(
        r#"
metadata:
  name: {name}
  labels:
    extendeddaemonsetreplicaset.datadoghq.com/name: {owner}
  annotations:
    extendeddaemonset.datadoghq.com/templatehash: {hash}
spec:
  nodeName: {node}
  containers: []
status:
  phase: Running
  startTime: "2026-03-01T11:00:00Z"
  conditions:
  - type: Ready
    status: "{status}"
  containerStatuses:
  - name: agent
    image: agent
    imageID: ""
    ready: {ready}
    restartCount: {restarts}
    lastState:
      terminated: {{exitCode: 1, reason: Error, finishedAt: "2026-03-01T11:59:00Z"}}
"#
    ))
    .unwrap()
}

fn item(node: &str, pod: Option<Pod>) -> NodeItem {
    NodeItem {
        node: serde_yaml::from_str(&format!("metadata: {{name: {node}}}")).unwrap(),
        pod,
        overrides: NodeOverrides::default(),
        resources_hash: None,
    }
}

fn canary_policy(canary: CanarySpec) -> StrategyPolicy {
    let strategy = ExtendedDaemonSetStrategy {
        canary: Some(canary),
        ..Default::default()
    };
    resolve_strategy(&strategy, CanaryValidationMode::Auto).unwrap()
}

fn plan(
    replica_set: &ExtendedDaemonSetReplicaSet,
    policy: &StrategyPolicy,
    intent: &OperatorIntent,
    nodes: &[NodeItem],
    canary_nodes: &[String],
) -> Result<StrategyResult, StrategyError> {
    let role = match replica_set.role() {
        ReplicaSetRole::New => ReplicaSetRole::Unknown,
        role => role,
    };
    let mut status = replica_set.status.clone().unwrap_or_default();
    apply_role_conditions(&mut status, role, now());

    select_strategy(role).plan(StrategyParams {
        replica_set,
        policy,
        intent,
        nodes,
        canary_nodes,
        status,
        now: now(),
    })
}

fn condition(result: &StrategyResult, type_: ConditionType) -> &crate::crd::condition::Condition {
    conditions::find(&result.status.conditions, type_).unwrap()
}

fn canary_nodes() -> Vec<String> {
    vec!["n1".to_string(), "n2".to_string()]
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

#[test]
fn test_select_strategy_by_role() {
    assert_eq!(select_strategy(ReplicaSetRole::Active).name(), "rolling-update");
    assert_eq!(select_strategy(ReplicaSetRole::Canary).name(), "canary");
    assert_eq!(select_strategy(ReplicaSetRole::Unknown).name(), "unknown");
    assert_eq!(select_strategy(ReplicaSetRole::New).name(), "unknown");
}

#[test]
fn test_pod_up_to_date_requires_matching_resources_hash() {
    let rs = replica_set("agent-v2", "v2", "");
    let p = pod("agent-v2-n1", "n1", "agent-v2", "v2", true, 0);
    let mut with_override = item("n1", Some(p.clone()));
    with_override.resources_hash = Some("abc".to_string());

    assert!(is_pod_up_to_date(&rs, &p, &item("n1", None)));
    assert!(!is_pod_up_to_date(&rs, &p, &with_override));
}

// ---------------------------------------------------------------------------
// Rolling update
// ---------------------------------------------------------------------------

const ACTIVE_STATUS: &str = "status: {status: active}";

#[test]
fn test_rolling_update_replaces_within_unavailability_budget() {
    // ARRANGE: three nodes serving the previous generation
    let rs = replica_set("agent-v2", "v2", ACTIVE_STATUS);
    let nodes: Vec<_> = ["n1", "n2", "n3"]
        .iter()
        .map(|n| item(n, Some(pod(&format!("agent-v1-{n}"), n, "agent-v1", "v1", true, 0))))
        .collect();

    // ACT
    let result = plan(&rs, &StrategyPolicy::default(), &OperatorIntent::default(), &nodes, &[]).unwrap();

    // ASSERT: maxUnavailable 1 allows a single replacement
    assert_eq!(result.pods_to_delete, vec!["agent-v1-n1".to_string()]);
    assert!(result.pods_to_create.is_empty());
    assert_eq!(result.status.status, ReplicaSetRole::Active);
    assert_eq!(result.status.desired, 3);
    assert_eq!(result.status.current, 0);
    assert_eq!(result.requeue_after, Some(Duration::from_secs(10)));
    assert!(condition(&result, ConditionType::Active).is_true());
}

#[test]
fn test_rolling_update_fills_empty_nodes_in_waves() {
    let rs = replica_set("agent-v2", "v2", ACTIVE_STATUS);
    let nodes: Vec<_> = ["n1", "n2", "n3"].iter().map(|n| item(n, None)).collect();

    let result = plan(&rs, &StrategyPolicy::default(), &OperatorIntent::default(), &nodes, &[]).unwrap();

    // First wave is slowStartAdditiveIncrease pods
    assert_eq!(result.pods_to_create, vec!["n1".to_string()]);
}

#[test]
fn test_rolling_update_paused_still_fills_new_nodes() {
    // ARRANGE
    let rs = replica_set("agent-v2", "v2", ACTIVE_STATUS);
    let nodes = vec![
        item("n1", Some(pod("agent-v1-n1", "n1", "agent-v1", "v1", true, 0))),
        item("n2", None),
    ];
    let intent = OperatorIntent {
        rollout: RolloutIntent::RollingUpdatePaused,
        ..Default::default()
    };

    // ACT
    let result = plan(&rs, &StrategyPolicy::default(), &intent, &nodes, &[]).unwrap();

    // ASSERT
    assert!(result.is_paused);
    assert!(result.pods_to_delete.is_empty());
    assert_eq!(result.pods_to_create, vec!["n2".to_string()]);
    assert!(condition(&result, ConditionType::RollingUpdatePaused).is_true());
    assert!(!condition(&result, ConditionType::Active).is_true());
}

#[test]
fn test_rolling_update_frozen_stops_everything() {
    let rs = replica_set("agent-v2", "v2", ACTIVE_STATUS);
    let nodes = vec![
        item("n1", Some(pod("agent-v1-n1", "n1", "agent-v1", "v1", true, 0))),
        item("n2", None),
    ];
    let intent = OperatorIntent {
        rollout: RolloutIntent::Frozen,
        ..Default::default()
    };

    let result = plan(&rs, &StrategyPolicy::default(), &intent, &nodes, &[]).unwrap();

    assert!(result.is_frozen);
    assert!(result.pods_to_delete.is_empty());
    assert!(result.pods_to_create.is_empty());
    assert!(condition(&result, ConditionType::RolloutFrozen).is_true());
}

#[test]
fn test_rolling_update_skips_canary_nodes() {
    let rs = replica_set("agent-v1", "v1", ACTIVE_STATUS);
    let nodes = vec![
        item("n1", Some(pod("agent-v2-n1", "n1", "agent-v2", "v2", true, 0))),
        item("n2", Some(pod("agent-v1-n2", "n2", "agent-v1", "v1", true, 0))),
    ];

    let result = plan(
        &rs,
        &StrategyPolicy::default(),
        &OperatorIntent::default(),
        &nodes,
        &["n1".to_string()],
    )
    .unwrap();

    assert!(result.pods_to_delete.is_empty());
    assert_eq!(result.status.desired, 1);
    assert_eq!(result.status.ready, 1);
    assert_eq!(result.requeue_after, None);
}

#[test]
fn test_rolling_update_invalid_unready_annotation() {
    let mut rs = replica_set("agent-v2", "v2", ACTIVE_STATUS);
    rs.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(UNREADY_PODS.to_string(), "many".to_string());

    let err = plan(&rs, &StrategyPolicy::default(), &OperatorIntent::default(), &[item("n1", None)], &[])
        .unwrap_err();

    assert_eq!(err, StrategyError::InvalidUnreadyPods("many".to_string()));
}

const UNREADY_PODS: &str = crate::crd::keys::UNREADY_PODS_ANNOTATION;

#[test]
fn test_rolling_update_removes_canary_label_after_promotion() {
    let rs = replica_set("agent-v2", "v2", ACTIVE_STATUS);
    let mut promoted = pod("agent-v2-n1", "n1", "agent-v2", "v2", true, 0);
    promoted
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(ERS_CANARY_LABEL.to_string(), "true".to_string());

    let result = plan(
        &rs,
        &StrategyPolicy::default(),
        &OperatorIntent::default(),
        &[item("n1", Some(promoted))],
        &[],
    )
    .unwrap();

    assert_eq!(result.pods_to_unlabel, vec!["agent-v2-n1".to_string()]);
}

// ---------------------------------------------------------------------------
// Canary
// ---------------------------------------------------------------------------

const CANARY_STATUS: &str = "status: {status: canary}";

#[test]
fn test_canary_creates_missing_pods_and_labels_existing() {
    // ARRANGE
    let rs = replica_set("agent-v2", "v2", CANARY_STATUS);
    let nodes = vec![
        item("n1", Some(pod("agent-v2-n1", "n1", "agent-v2", "v2", true, 0))),
        item("n2", None),
        item("n3", Some(pod("agent-v1-n3", "n3", "agent-v1", "v1", true, 0))),
    ];

    // ACT
    let result = plan(
        &rs,
        &canary_policy(CanarySpec::default()),
        &OperatorIntent::default(),
        &nodes,
        &canary_nodes(),
    )
    .unwrap();

    // ASSERT
    assert_eq!(result.pods_to_create, vec!["n2".to_string()]);
    assert_eq!(result.pods_to_label, vec!["agent-v2-n1".to_string()]);
    assert!(result.pods_to_delete.is_empty());
    assert_eq!(result.status.desired, 2);
    assert_eq!(result.status.current, 1);
    assert_eq!(result.status.ready, 1);
    assert_eq!(result.requeue_after, Some(REQUEUE_PROMPTLY));
    assert!(condition(&result, ConditionType::Canary).is_true());
    assert!(!result.is_paused);
    assert!(!result.is_failed);
}

#[test]
fn test_canary_replaces_outdated_pod() {
    let rs = replica_set("agent-v2", "v2", CANARY_STATUS);
    let nodes = vec![item("n1", Some(pod("agent-v1-n1", "n1", "agent-v1", "v1", true, 0)))];

    let result = plan(
        &rs,
        &canary_policy(CanarySpec::default()),
        &OperatorIntent::default(),
        &nodes,
        &["n1".to_string()],
    )
    .unwrap();

    assert_eq!(result.pods_to_delete, vec!["agent-v1-n1".to_string()]);
    assert!(result.pods_to_label.is_empty());
}

#[test]
fn test_canary_restarts_above_pause_threshold_pause() {
    // ARRANGE: 3 restarts, pause at >2, fail at >5
    let rs = replica_set("agent-v2", "v2", CANARY_STATUS);
    let nodes = vec![
        item("n1", Some(pod("agent-v2-n1", "n1", "agent-v2", "v2", true, 3))),
        item("n2", None),
    ];

    // ACT
    let result = plan(
        &rs,
        &canary_policy(CanarySpec::default()),
        &OperatorIntent::default(),
        &nodes,
        &canary_nodes(),
    )
    .unwrap();

    // ASSERT
    assert!(result.is_paused);
    assert!(!result.is_failed);
    assert!(result.pods_to_create.is_empty());
    let paused = condition(&result, ConditionType::CanaryPaused);
    assert!(paused.is_true());
    assert_eq!(paused.reason, "Error");
    let restarting = condition(&result, ConditionType::PodRestarting);
    assert_eq!(restarting.message, "Pod agent-v2-n1 restarting with reason: Error");
    assert_eq!(restarting.last_update_time.as_deref(), Some("2026-03-01T11:59:00Z"));
}

#[test]
fn test_canary_restarts_above_fail_threshold_fail() {
    let rs = replica_set("agent-v2", "v2", CANARY_STATUS);
    let nodes = vec![
        item("n1", Some(pod("agent-v2-n1", "n1", "agent-v2", "v2", false, 6))),
        item("n2", None),
    ];

    let result = plan(
        &rs,
        &canary_policy(CanarySpec::default()),
        &OperatorIntent::default(),
        &nodes,
        &canary_nodes(),
    )
    .unwrap();

    assert!(result.is_failed);
    assert!(result.pods_to_create.is_empty());
    assert_eq!(result.requeue_after, None);
    let failed = condition(&result, ConditionType::CanaryFailed);
    assert!(failed.is_true());
    assert_eq!(failed.reason, "Error");
}

#[test]
fn test_canary_timeout_fails() {
    // ARRANGE: canary running for 30 minutes with a 20 minute timeout
    let rs = replica_set(
        "agent-v2",
        "v2",
        r#"
status:
  status: canary
  conditions:
  - {type: Canary, status: "True", lastTransitionTime: "2026-03-01T11:30:00Z"}
"#,
    );
    let policy = canary_policy(CanarySpec {
        auto_fail: Some(CanaryAutoFail {
            canary_timeout: Some("20m".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    });
    let nodes = vec![item("n1", Some(pod("agent-v2-n1", "n1", "agent-v2", "v2", false, 0)))];

    // ACT
    let result = plan(&rs, &policy, &OperatorIntent::default(), &nodes, &["n1".to_string()]).unwrap();

    // ASSERT
    assert!(result.is_failed);
    assert_eq!(condition(&result, ConditionType::CanaryFailed).reason, "TimeoutExceeded");
}

#[test]
fn test_canary_manual_fail() {
    let rs = replica_set("agent-v2", "v2", CANARY_STATUS);
    let nodes = vec![item("n1", Some(pod("agent-v2-n1", "n1", "agent-v2", "v2", true, 0)))];
    let intent = OperatorIntent {
        failed: true,
        ..Default::default()
    };

    let result = plan(
        &rs,
        &canary_policy(CanarySpec::default()),
        &intent,
        &nodes,
        &["n1".to_string()],
    )
    .unwrap();

    assert!(result.is_failed);
    assert_eq!(condition(&result, ConditionType::CanaryFailed).reason, "Manual");
}

#[test]
fn test_canary_already_failed_keeps_reason() {
    let rs = replica_set(
        "agent-v2",
        "v2",
        r#"
status:
  status: canary
  conditions:
  - {type: CanaryFailed, status: "True", reason: OOMKilled, lastTransitionTime: "2026-03-01T11:50:00Z"}
"#,
    );
    let nodes = vec![item("n1", Some(pod("agent-v2-n1", "n1", "agent-v2", "v2", true, 0)))];
    let intent = OperatorIntent {
        failed: true,
        ..Default::default()
    };

    let result = plan(
        &rs,
        &canary_policy(CanarySpec::default()),
        &intent,
        &nodes,
        &["n1".to_string()],
    )
    .unwrap();

    assert!(result.is_failed);
    assert_eq!(condition(&result, ConditionType::CanaryFailed).reason, "OOMKilled");
}

const PAUSED_STATUS: &str = r#"
status:
  status: canary
  conditions:
  - {type: CanaryPaused, status: "True", reason: CrashLoopBackOff, lastTransitionTime: "2026-03-01T11:50:00Z"}
"#;

#[test]
fn test_canary_pause_persists_without_annotation() {
    let rs = replica_set("agent-v2", "v2", PAUSED_STATUS);
    let nodes = vec![item("n1", Some(pod("agent-v2-n1", "n1", "agent-v2", "v2", true, 0)))];

    let result = plan(
        &rs,
        &canary_policy(CanarySpec::default()),
        &OperatorIntent::default(),
        &nodes,
        &["n1".to_string()],
    )
    .unwrap();

    assert!(result.is_paused);
    assert_eq!(condition(&result, ConditionType::CanaryPaused).reason, "CrashLoopBackOff");
}

#[test]
fn test_canary_unpaused_annotation_clears_pause() {
    let rs = replica_set("agent-v2", "v2", PAUSED_STATUS);
    let nodes = vec![item("n1", Some(pod("agent-v2-n1", "n1", "agent-v2", "v2", true, 0)))];
    let intent = OperatorIntent {
        canary: CanaryIntent::Unpaused,
        ..Default::default()
    };

    let result = plan(
        &rs,
        &canary_policy(CanarySpec::default()),
        &intent,
        &nodes,
        &["n1".to_string()],
    )
    .unwrap();

    assert!(!result.is_paused);
    assert!(!condition(&result, ConditionType::CanaryPaused).is_true());
}

fn waiting_pod(reason: &str, start_time: &str) -> Pod {
    serde_yaml::from_str(&format!(
        r#"
metadata:
  name: agent-v2-n1
  labels:
    extendeddaemonsetreplicaset.datadoghq.com/name: agent-v2
  annotations:
    extendeddaemonset.datadoghq.com/templatehash: v2
spec:
  nodeName: n1
  containers: []
status:
  phase: Pending
  startTime: "{start_time}"
  containerStatuses:
  - name: agent
    image: agent
    imageID: ""
    ready: false
    restartCount: 0
    state:
      waiting: {{reason: {reason}}}
"#
    ))
    .unwrap()
}

fn slow_start_policy() -> StrategyPolicy {
    canary_policy(CanarySpec {
        auto_pause: Some(CanaryAutoPause {
            max_slow_start_duration: Some("5m".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[test]
fn test_cannot_start_within_slow_start_window_is_reported_without_pause() {
    // ARRANGE: failing for 2 minutes with a 5 minute window
    let rs = replica_set("agent-v2", "v2", CANARY_STATUS);
    let nodes = vec![item(
        "n1",
        Some(waiting_pod("CreateContainerConfigError", "2026-03-01T11:58:00Z")),
    )];

    // ACT
    let result = plan(
        &rs,
        &slow_start_policy(),
        &OperatorIntent::default(),
        &nodes,
        &["n1".to_string()],
    )
    .unwrap();

    // ASSERT
    assert!(!result.is_paused);
    assert!(!condition(&result, ConditionType::CanaryPaused).is_true());
    let cannot_start = condition(&result, ConditionType::PodCannotStart);
    assert!(cannot_start.is_true());
    assert_eq!(cannot_start.reason, "CreateContainerConfigError");
    assert_eq!(
        cannot_start.message,
        "Pod agent-v2-n1 cannot start with reason: CreateContainerConfigError"
    );
}

#[test]
fn test_cannot_start_past_slow_start_window_pauses() {
    let rs = replica_set("agent-v2", "v2", CANARY_STATUS);
    let nodes = vec![item("n1", Some(waiting_pod("ImagePullBackOff", "2026-03-01T11:50:00Z")))];

    let result = plan(
        &rs,
        &slow_start_policy(),
        &OperatorIntent::default(),
        &nodes,
        &["n1".to_string()],
    )
    .unwrap();

    assert!(result.is_paused);
    assert_eq!(condition(&result, ConditionType::CanaryPaused).reason, "ImagePullBackOff");
    let cannot_start = condition(&result, ConditionType::PodCannotStart);
    assert!(cannot_start.is_true());
    assert_eq!(
        cannot_start.message,
        "Pod agent-v2-n1 cannot start with reason: ImagePullBackOff"
    );
}

#[test]
fn test_canary_without_policy_is_error() {
    let rs = replica_set("agent-v2", "v2", CANARY_STATUS);

    let err = plan(
        &rs,
        &StrategyPolicy::default(),
        &OperatorIntent::default(),
        &[],
        &canary_nodes(),
    )
    .unwrap_err();

    assert_eq!(err, StrategyError::MissingCanaryPolicy("agent-v2".to_string()));
}

// ---------------------------------------------------------------------------
// Retired generation
// ---------------------------------------------------------------------------

#[test]
fn test_unknown_reports_remaining_pods_without_acting() {
    let rs = replica_set("agent-v1", "v1", "status: {status: unknown}");
    let nodes = vec![
        item("n1", Some(pod("agent-v1-n1", "n1", "agent-v1", "v1", true, 0))),
        item("n2", Some(pod("agent-v2-n2", "n2", "agent-v2", "v2", true, 0))),
        item("n3", None),
    ];

    let result = plan(
        &rs,
        &StrategyPolicy::default(),
        &OperatorIntent::default(),
        &nodes,
        &[],
    )
    .unwrap();

    assert_eq!(result.status.status, ReplicaSetRole::Unknown);
    assert_eq!(result.status.desired, 0);
    assert_eq!(result.status.current, 1);
    assert_eq!(result.status.ready, 1);
    assert!(result.pods_to_create.is_empty());
    assert!(result.pods_to_delete.is_empty());
    assert!(!condition(&result, ConditionType::Active).is_true());
    assert!(!condition(&result, ConditionType::Canary).is_true());
}
