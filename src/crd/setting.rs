use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Resource overrides for the pods an ExtendedDaemonSet runs on a subset of nodes
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "datadoghq.com",
    version = "v1alpha1",
    kind = "ExtendedDaemonsetSetting",
    shortname = "edss",
    namespaced,
    status = "ExtendedDaemonsetSettingStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Node Selector", "type":"string", "jsonPath":".spec.nodeSelector"}"#,
    printcolumn = r#"{"name":"Error", "type":"string", "jsonPath":".status.error"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExtendedDaemonsetSettingSpec {
    /// ExtendedDaemonSet the overrides apply to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<SettingReference>,

    /// Nodes the overrides apply to
    #[serde(rename = "nodeSelector", default)]
    pub node_selector: LabelSelector,

    #[serde(default)]
    pub containers: Vec<ContainerResources>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SettingReference {
    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ContainerResources {
    pub name: String,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum SettingState {
    Valid,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExtendedDaemonsetSettingStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SettingState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtendedDaemonsetSetting {
    pub fn is_valid(&self) -> bool {
        self.status.as_ref().and_then(|s| s.status) == Some(SettingState::Valid)
    }

    /// Name of the referenced ExtendedDaemonSet, when set
    pub fn reference_name(&self) -> Option<&str> {
        self.spec
            .reference
            .as_ref()
            .map(|r| r.name.as_str())
            .filter(|n| !n.is_empty())
    }
}
