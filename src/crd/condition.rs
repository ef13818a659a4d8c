use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind of finding recorded in a status condition list
///
/// ExtendedDaemonSet and ExtendedDaemonSetReplicaSet statuses share this enum;
/// each resource only uses the subset relevant to it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionType {
    Active,
    Canary,
    CanaryPaused,
    CanaryFailed,
    RollingUpdatePaused,
    RolloutFrozen,
    PodCannotStart,
    PodRestarting,
    PodCreation,
    PodDeletion,
    Unschedule,
    LastFullSync,
    ReconcileError,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn from_bool(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A typed status condition
///
/// Timestamps are RFC3339 strings, matching how the rest of the status is stored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    /// Last time the status flipped
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Last time the condition was written (only maintained when requested)
    #[serde(rename = "lastUpdateTime", skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}
