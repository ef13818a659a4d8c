//! Label and annotation keys shared by the controllers and operator tooling

/// Label carrying the owning ExtendedDaemonSet name (on ERS and pods)
pub const EDS_NAME_LABEL: &str = "extendeddaemonset.datadoghq.com/name";

/// Label carrying the owning ExtendedDaemonSetReplicaSet name (on pods)
pub const ERS_NAME_LABEL: &str = "extendeddaemonsetreplicaset.datadoghq.com/name";

/// Label set to "true" on pods that belong to a canary generation
pub const ERS_CANARY_LABEL: &str = "extendeddaemonsetreplicaset.datadoghq.com/canary";

pub const ROLLING_UPDATE_PAUSED_ANNOTATION: &str =
    "extendeddaemonset.datadoghq.com/rolling-update-paused";
pub const ROLLOUT_FROZEN_ANNOTATION: &str = "extendeddaemonset.datadoghq.com/rollout-frozen";
pub const CANARY_PAUSED_ANNOTATION: &str = "extendeddaemonset.datadoghq.com/canary-paused";
pub const CANARY_PAUSED_REASON_ANNOTATION: &str =
    "extendeddaemonset.datadoghq.com/canary-paused-reason";
pub const CANARY_UNPAUSED_ANNOTATION: &str = "extendeddaemonset.datadoghq.com/canary-unpaused";

/// Value is the name of the ERS the operator validated
pub const CANARY_VALID_ANNOTATION: &str = "extendeddaemonset.datadoghq.com/canary-valid";
pub const CANARY_FAILED_ANNOTATION: &str = "extendeddaemonset.datadoghq.com/canary-failed";

/// Template fingerprint recorded on ERS, pods and the mirrored PodTemplate
pub const TEMPLATE_HASH_ANNOTATION: &str = "extendeddaemonset.datadoghq.com/templatehash";

/// Per-node override digest recorded on pods
pub const RESOURCES_HASH_ANNOTATION: &str = "extendeddaemonset.datadoghq.com/resourceshash";

/// Unready pod count observed when the ERS was created
pub const UNREADY_PODS_ANNOTATION: &str = "extendeddaemonsetreplicaset.datadoghq.com/unready-pods";

/// Prefix of node annotations holding per-container resource overrides.
///
/// Full key: `resources.extendeddaemonset.datadoghq.com/<namespace>.<eds>.<container>`
pub const NODE_RESOURCES_ANNOTATION_PREFIX: &str = "resources.extendeddaemonset.datadoghq.com/";

/// Label the cluster autoscaler uses to recognise daemon pod templates
pub const AUTOSCALER_DAEMONSET_POD_LABEL: &str = "cluster-autoscaler.kubernetes.io/daemonset-pod";

/// Value stored in boolean annotations and labels
pub const TRUE_VALUE: &str = "true";

/// Node annotation key carrying the override of one container
pub fn node_resources_annotation_key(namespace: &str, eds_name: &str, container: &str) -> String {
    format!(
        "{}{}.{}.{}",
        NODE_RESOURCES_ANNOTATION_PREFIX, namespace, eds_name, container
    )
}

/// Prefix shared by every override of one ExtendedDaemonSet on a node
pub fn node_resources_annotation_scope(namespace: &str, eds_name: &str) -> String {
    format!("{}{}.{}.", NODE_RESOURCES_ANNOTATION_PREFIX, namespace, eds_name)
}
