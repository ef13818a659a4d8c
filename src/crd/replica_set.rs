use super::condition::{Condition, ConditionType};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One immutable generation of an ExtendedDaemonSet pod template
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "datadoghq.com",
    version = "v1alpha1",
    kind = "ExtendedDaemonSetReplicaSet",
    shortname = "ers",
    namespaced,
    status = "ExtendedDaemonSetReplicaSetStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".status.desired"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.current"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.available"}"#,
    printcolumn = r#"{"name":"Node Selector", "type":"string", "jsonPath":".spec.template.spec.nodeSelector"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExtendedDaemonSetReplicaSetSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Frozen copy of the owning ExtendedDaemonSet template
    pub template: PodTemplateSpec,

    /// Fingerprint of `template`, also stored as the templatehash annotation
    #[serde(rename = "templateGeneration", default)]
    pub template_generation: String,
}

/// Role of a generation within its ExtendedDaemonSet
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ReplicaSetRole {
    /// Created but not yet claimed as active or canary
    #[default]
    #[serde(rename = "new")]
    New,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "canary")]
    Canary,
    /// Neither active nor canary any more; waiting for cleanup
    #[serde(rename = "unknown")]
    Unknown,
}

impl ReplicaSetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaSetRole::New => "new",
            ReplicaSetRole::Active => "active",
            ReplicaSetRole::Canary => "canary",
            ReplicaSetRole::Unknown => "unknown",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExtendedDaemonSetReplicaSetStatus {
    #[serde(default)]
    pub status: ReplicaSetRole,

    #[serde(default)]
    pub desired: i32,

    #[serde(default)]
    pub current: i32,

    #[serde(default)]
    pub ready: i32,

    #[serde(default)]
    pub available: i32,

    #[serde(rename = "ignoredUnresponsiveNodes", default)]
    pub ignored_unresponsive_nodes: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ExtendedDaemonSetReplicaSet {
    pub fn role(&self) -> ReplicaSetRole {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }

    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: ConditionType) -> bool {
        self.condition(type_).map(|c| c.is_true()).unwrap_or(false)
    }

    /// Sum of every counter; zero means the generation runs no pods
    pub fn pod_total(&self) -> i32 {
        self.status
            .as_ref()
            .map(|s| s.desired + s.current + s.ready + s.available)
            .unwrap_or(0)
    }
}
