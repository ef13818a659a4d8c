use super::condition::Condition;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ExtendedDaemonSet runs one pod per eligible node, rolling template changes
/// out through an optional canary generation.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "datadoghq.com",
    version = "v1alpha1",
    kind = "ExtendedDaemonSet",
    shortname = "eds",
    namespaced,
    status = "ExtendedDaemonSetStatus",
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".status.desired"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.current"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Up-To-Date", "type":"integer", "jsonPath":".status.upToDate"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.available"}"#,
    printcolumn = r#"{"name":"Ignored Unresponsive Nodes", "type":"integer", "jsonPath":".status.ignoredUnresponsiveNodes"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Active RS", "type":"string", "jsonPath":".status.activeReplicaSet"}"#,
    printcolumn = r#"{"name":"Canary RS", "type":"string", "jsonPath":".status.canary.replicaSet"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExtendedDaemonSetSpec {
    /// Restricts the nodes eligible to run a daemon pod
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Pod template run on each eligible node
    pub template: PodTemplateSpec,

    #[serde(default)]
    pub strategy: ExtendedDaemonSetStrategy,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExtendedDaemonSetStrategy {
    #[serde(rename = "rollingUpdate", default)]
    pub rolling_update: RollingUpdateSpec,

    /// When set, every new generation runs as a canary first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanarySpec>,

    /// Minimum interval between two replica set passes (e.g. "10s")
    #[serde(rename = "reconcileFrequency", skip_serializing_if = "Option::is_none")]
    pub reconcile_frequency: Option<String>,
}

/// Pacing policy applied while pods of a generation are rolled out
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RollingUpdateSpec {
    /// Absolute number or percentage of nodes that may be without a ready pod
    #[serde(rename = "maxUnavailable", skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    /// Absolute number or percentage of nodes whose pod may fail to schedule
    /// before those nodes are ignored
    #[serde(
        rename = "maxPodSchedulerFailure",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_pod_scheduler_failure: Option<IntOrString>,

    /// Upper bound on pod creations per pass
    #[serde(
        rename = "maxParallelPodCreation",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_parallel_pod_creation: Option<i32>,

    /// Interval after which the creation wave grows
    #[serde(
        rename = "slowStartIntervalDuration",
        skip_serializing_if = "Option::is_none"
    )]
    pub slow_start_interval_duration: Option<String>,

    /// Amount the creation wave grows by each interval
    #[serde(
        rename = "slowStartAdditiveIncrease",
        skip_serializing_if = "Option::is_none"
    )]
    pub slow_start_additive_increase: Option<IntOrString>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum CanaryValidationMode {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "manual")]
    Manual,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanarySpec {
    /// Number or percentage of nodes running the canary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<IntOrString>,

    /// How long the canary runs before automatic promotion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// The canary only ends once no restart happened for this long
    #[serde(rename = "noRestartsDuration", skip_serializing_if = "Option::is_none")]
    pub no_restarts_duration: Option<String>,

    /// Restricts the nodes eligible to run canary pods
    #[serde(rename = "nodeSelector", skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,

    /// Node label keys used to spread canary pods
    #[serde(rename = "nodeAntiAffinityKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub node_anti_affinity_keys: Vec<String>,

    #[serde(rename = "autoPause", skip_serializing_if = "Option::is_none")]
    pub auto_pause: Option<CanaryAutoPause>,

    #[serde(rename = "autoFail", skip_serializing_if = "Option::is_none")]
    pub auto_fail: Option<CanaryAutoFail>,

    #[serde(rename = "validationMode", skip_serializing_if = "Option::is_none")]
    pub validation_mode: Option<CanaryValidationMode>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryAutoPause {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Restarts tolerated before the canary is paused
    #[serde(rename = "maxRestarts", skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<i32>,

    /// Grace window for pods that cannot start yet
    #[serde(
        rename = "maxSlowStartDuration",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_slow_start_duration: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryAutoFail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Restarts tolerated before the canary is failed
    #[serde(rename = "maxRestarts", skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<i32>,

    /// Fail once pods keep restarting for longer than this
    #[serde(
        rename = "maxRestartsDuration",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_restarts_duration: Option<String>,

    /// Fail when the canary has not been promoted within this window
    #[serde(rename = "canaryTimeout", skip_serializing_if = "Option::is_none")]
    pub canary_timeout: Option<String>,
}

/// Derived rollout state, recomputed every pass
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum EdsState {
    #[default]
    Running,
    Canary,
    #[serde(rename = "Canary Paused")]
    CanaryPaused,
    #[serde(rename = "RollingUpdate Paused")]
    RollingUpdatePaused,
    #[serde(rename = "Rollout frozen")]
    RolloutFrozen,
    #[serde(rename = "Canary Failed")]
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExtendedDaemonSetStatus {
    #[serde(default)]
    pub desired: i32,

    #[serde(default)]
    pub current: i32,

    #[serde(default)]
    pub ready: i32,

    #[serde(default)]
    pub available: i32,

    #[serde(rename = "upToDate", default)]
    pub up_to_date: i32,

    #[serde(rename = "ignoredUnresponsiveNodes", default)]
    pub ignored_unresponsive_nodes: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<EdsState>,

    /// Generation currently serving the fleet
    #[serde(rename = "activeReplicaSet", skip_serializing_if = "Option::is_none")]
    pub active_replica_set: Option<String>,

    /// In-flight candidate generation, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryStatus {
    #[serde(rename = "replicaSet")]
    pub replica_set: String,

    /// Nodes selected to run the canary pods
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl ExtendedDaemonSet {
    pub fn annotations_map(&self) -> std::collections::BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    pub fn active_replica_set(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.active_replica_set.as_deref())
    }

    pub fn canary_replica_set(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.canary.as_ref())
            .map(|c| c.replica_set.as_str())
    }
}

/// Why a canary was paused or failed
///
/// Stored as a plain string in `status.reason` and condition reasons so that
/// operator-provided reasons outside this list pass through unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CanaryReason {
    CrashLoopBackOff,
    OomKilled,
    RestartsTimeoutExceeded,
    TimeoutExceeded,
    SlowStartTimeoutExceeded,
    ErrImagePull,
    ImagePullBackOff,
    ImageInspectError,
    ErrImageNeverPull,
    RegistryUnavailable,
    InvalidImageName,
    CreateContainerConfigError,
    CreateContainerError,
    PreStartHookError,
    PostStartHookError,
    PreCreateHookError,
    StartError,
    Manual,
    Unknown,
}

impl CanaryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanaryReason::CrashLoopBackOff => "CrashLoopBackOff",
            CanaryReason::OomKilled => "OOMKilled",
            CanaryReason::RestartsTimeoutExceeded => "RestartsTimeoutExceeded",
            CanaryReason::TimeoutExceeded => "TimeoutExceeded",
            CanaryReason::SlowStartTimeoutExceeded => "SlowStartTimeoutExceeded",
            CanaryReason::ErrImagePull => "ErrImagePull",
            CanaryReason::ImagePullBackOff => "ImagePullBackOff",
            CanaryReason::ImageInspectError => "ImageInspectError",
            CanaryReason::ErrImageNeverPull => "ErrImageNeverPull",
            CanaryReason::RegistryUnavailable => "RegistryUnavailable",
            CanaryReason::InvalidImageName => "InvalidImageName",
            CanaryReason::CreateContainerConfigError => "CreateContainerConfigError",
            CanaryReason::CreateContainerError => "CreateContainerError",
            CanaryReason::PreStartHookError => "PreStartHookError",
            CanaryReason::PostStartHookError => "PostStartHookError",
            CanaryReason::PreCreateHookError => "PreCreateHookError",
            CanaryReason::StartError => "StartError",
            CanaryReason::Manual => "Manual",
            CanaryReason::Unknown => "Unknown",
        }
    }

    /// Map a container waiting/terminated reason onto a known variant
    pub fn from_container_reason(reason: &str) -> CanaryReason {
        match reason {
            "CrashLoopBackOff" => CanaryReason::CrashLoopBackOff,
            "OOMKilled" => CanaryReason::OomKilled,
            "ErrImagePull" => CanaryReason::ErrImagePull,
            "ImagePullBackOff" => CanaryReason::ImagePullBackOff,
            "ImageInspectError" => CanaryReason::ImageInspectError,
            "ErrImageNeverPull" => CanaryReason::ErrImageNeverPull,
            "RegistryUnavailable" => CanaryReason::RegistryUnavailable,
            "InvalidImageName" => CanaryReason::InvalidImageName,
            "CreateContainerConfigError" => CanaryReason::CreateContainerConfigError,
            "CreateContainerError" => CanaryReason::CreateContainerError,
            "PreStartHookError" => CanaryReason::PreStartHookError,
            "PostStartHookError" => CanaryReason::PostStartHookError,
            "PreCreateHookError" => CanaryReason::PreCreateHookError,
            "StartError" => CanaryReason::StartError,
            _ => CanaryReason::Unknown,
        }
    }
}

impl std::fmt::Display for CanaryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
