#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::condition::{ConditionStatus, ConditionType};
use super::extended_daemon_set::*;
use super::replica_set::*;
use super::setting::*;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResourceExt;

#[test]
fn test_extended_daemon_set_with_canary_deserialize_from_yaml() {
    let yaml = r#"
apiVersion: datadoghq.com/v1alpha1
kind: ExtendedDaemonSet
metadata:
  name: agent
  namespace: monitoring
  annotations:
    extendeddaemonset.datadoghq.com/canary-valid: agent-x7k2p
spec:
  template:
    metadata:
      labels:
        app: agent
    spec:
      containers:
      - name: agent
        image: agent:7.50
  strategy:
    reconcileFrequency: 10s
    rollingUpdate:
      maxUnavailable: 10%
      maxParallelPodCreation: 20
      slowStartIntervalDuration: 1m
      slowStartAdditiveIncrease: 5
    canary:
      replicas: 2
      duration: 15m
      nodeAntiAffinityKeys:
      - topology.kubernetes.io/zone
      validationMode: manual
      autoPause:
        enabled: true
        maxRestarts: 2
        maxSlowStartDuration: 5m
      autoFail:
        enabled: true
        maxRestarts: 5
        canaryTimeout: 1h
"#;

    let eds: ExtendedDaemonSet =
        serde_yaml::from_str(yaml).expect("Failed to deserialize ExtendedDaemonSet");

    assert_eq!(eds.metadata.name.as_deref(), Some("agent"));
    let strategy = &eds.spec.strategy;
    assert_eq!(strategy.reconcile_frequency.as_deref(), Some("10s"));
    assert_eq!(
        strategy.rolling_update.max_unavailable,
        Some(IntOrString::String("10%".to_string()))
    );
    assert_eq!(strategy.rolling_update.max_parallel_pod_creation, Some(20));
    assert_eq!(
        strategy.rolling_update.slow_start_additive_increase,
        Some(IntOrString::Int(5))
    );

    let canary = strategy.canary.as_ref().expect("canary block should be set");
    assert_eq!(canary.replicas, Some(IntOrString::Int(2)));
    assert_eq!(canary.validation_mode, Some(CanaryValidationMode::Manual));
    assert_eq!(canary.node_anti_affinity_keys, vec!["topology.kubernetes.io/zone"]);
    assert_eq!(
        canary.auto_fail.as_ref().and_then(|f| f.canary_timeout.as_deref()),
        Some("1h")
    );
    assert!(eds.status.is_none());
}

#[test]
fn test_extended_daemon_set_minimal_uses_empty_strategy() {
    let yaml = r#"
apiVersion: datadoghq.com/v1alpha1
kind: ExtendedDaemonSet
metadata:
  name: minimal
spec:
  template:
    spec:
      containers:
      - name: app
        image: busybox
"#;

    let eds: ExtendedDaemonSet = serde_yaml::from_str(yaml).expect("minimal EDS should parse");

    assert!(eds.spec.strategy.canary.is_none());
    assert_eq!(eds.spec.strategy.rolling_update, RollingUpdateSpec::default());
}

#[test]
fn test_status_state_uses_display_strings() {
    let status = ExtendedDaemonSetStatus {
        state: Some(EdsState::CanaryPaused),
        active_replica_set: Some("agent-aaaaa".to_string()),
        canary: Some(CanaryStatus {
            replica_set: "agent-bbbbb".to_string(),
            nodes: vec!["node-1".to_string()],
        }),
        ..Default::default()
    };

    let json = serde_json::to_value(&status).expect("status should serialize");

    assert_eq!(json["state"], "Canary Paused");
    assert_eq!(json["activeReplicaSet"], "agent-aaaaa");
    assert_eq!(json["canary"]["replicaSet"], "agent-bbbbb");
    // Empty condition list is omitted
    assert!(json.get("conditions").is_none());
}

#[test]
fn test_replica_set_status_deserialize_with_conditions() {
    let yaml = r#"
apiVersion: datadoghq.com/v1alpha1
kind: ExtendedDaemonSetReplicaSet
metadata:
  name: agent-x7k2p
spec:
  templateGeneration: 3f5a9c0d1e
  template:
    spec:
      containers:
      - name: agent
        image: agent:7.51
status:
  status: canary
  desired: 2
  current: 2
  ready: 1
  available: 1
  conditions:
  - type: CanaryFailed
    status: "True"
    lastTransitionTime: "2026-01-10T10:00:00Z"
    reason: CrashLoopBackOff
"#;

    let ers: ExtendedDaemonSetReplicaSet =
        serde_yaml::from_str(yaml).expect("Failed to deserialize ExtendedDaemonSetReplicaSet");

    assert_eq!(ers.role(), ReplicaSetRole::Canary);
    assert_eq!(ers.spec.template_generation, "3f5a9c0d1e");
    assert!(ers.is_condition_true(ConditionType::CanaryFailed));
    assert!(!ers.is_condition_true(ConditionType::CanaryPaused));
    assert_eq!(ers.pod_total(), 6);

    let failed = ers.condition(ConditionType::CanaryFailed).expect("condition exists");
    assert_eq!(failed.status, ConditionStatus::True);
    assert_eq!(failed.reason, "CrashLoopBackOff");
}

#[test]
fn test_setting_reference_name_ignores_empty() {
    let yaml = r#"
apiVersion: datadoghq.com/v1alpha1
kind: ExtendedDaemonsetSetting
metadata:
  name: bigmemory
spec:
  reference:
    kind: ExtendedDaemonSet
    name: ""
  nodeSelector:
    matchLabels:
      test: bigmemory
  containers:
  - name: agent
    resources:
      requests:
        memory: 2Gi
"#;

    let setting: ExtendedDaemonsetSetting =
        serde_yaml::from_str(yaml).expect("Failed to deserialize ExtendedDaemonsetSetting");

    assert_eq!(setting.reference_name(), None);
    assert!(!setting.is_valid());
    assert_eq!(setting.spec.containers.len(), 1);
}

#[test]
fn test_crds_are_namespaced_in_datadoghq_group() {
    for crd in [
        ExtendedDaemonSet::crd(),
        ExtendedDaemonSetReplicaSet::crd(),
        ExtendedDaemonsetSetting::crd(),
    ] {
        assert_eq!(crd.spec.group, "datadoghq.com");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");
    }
    assert_eq!(
        ExtendedDaemonSet::crd().spec.names.short_names,
        Some(vec!["eds".to_string()])
    );
}

#[test]
fn test_canary_reason_maps_container_reasons() {
    assert_eq!(
        CanaryReason::from_container_reason("CreateContainerConfigError"),
        CanaryReason::CreateContainerConfigError
    );
    assert_eq!(CanaryReason::from_container_reason("OOMKilled").as_str(), "OOMKilled");
    assert_eq!(
        CanaryReason::from_container_reason("SomethingElse"),
        CanaryReason::Unknown
    );
}
