//! Operator intent parsed from ExtendedDaemonSet annotations
//!
//! Annotations are the operator control surface (pause, freeze, validate,
//! fail). They are parsed once into `OperatorIntent` at the top of each pass
//! so the state machine never compares annotation strings itself.

use crate::crd::extended_daemon_set::{CanaryReason, EdsState};
use crate::crd::keys::{
    CANARY_FAILED_ANNOTATION, CANARY_PAUSED_ANNOTATION, CANARY_PAUSED_REASON_ANNOTATION,
    CANARY_UNPAUSED_ANNOTATION, CANARY_VALID_ANNOTATION, ROLLING_UPDATE_PAUSED_ANNOTATION,
    ROLLOUT_FROZEN_ANNOTATION, TRUE_VALUE,
};
use std::collections::BTreeMap;
use thiserror::Error;

/// Operator request that is invalid in the current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("rolling update is already paused")]
    RollingUpdateAlreadyPaused,

    #[error("rolling update is not paused")]
    RollingUpdateNotPaused,

    #[error("rollout is already frozen")]
    RolloutAlreadyFrozen,

    #[error("rollout is not frozen")]
    RolloutNotFrozen,

    #[error("cannot {action} while canary {replica_set} is in flight")]
    CanaryInFlight {
        action: &'static str,
        replica_set: String,
    },

    /// Control left on the object; it takes effect once the canary ends
    #[error("cannot {action} while canary {replica_set} is in flight, deferred until the canary ends")]
    DeferredUntilCanaryEnds {
        action: &'static str,
        replica_set: String,
    },

    #[error("no canary is in flight")]
    NoCanaryInFlight,

    #[error("canary is already paused")]
    CanaryAlreadyPaused,

    #[error("canary is not paused")]
    CanaryNotPaused,

    #[error("canary is already failed")]
    CanaryAlreadyFailed,

    #[error("replica set {requested} is not the current canary ({current})")]
    UnknownReplicaSet { requested: String, current: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RolloutIntent {
    #[default]
    Normal,
    RollingUpdatePaused,
    Frozen,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CanaryIntent {
    #[default]
    None,
    Paused {
        reason: String,
    },
    Unpaused,
}

/// Typed view of the operator annotations
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperatorIntent {
    pub rollout: RolloutIntent,
    pub canary: CanaryIntent,
    /// Name of the ERS the operator validated
    pub validated: Option<String>,
    /// Operator asked to fail the in-flight canary
    pub failed: bool,
}

fn is_true(annotations: &BTreeMap<String, String>, key: &str) -> bool {
    annotations.get(key).map(|v| v == TRUE_VALUE).unwrap_or(false)
}

impl OperatorIntent {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        // Freeze is the stronger of the two rollout controls
        let rollout = if is_true(annotations, ROLLOUT_FROZEN_ANNOTATION) {
            RolloutIntent::Frozen
        } else if is_true(annotations, ROLLING_UPDATE_PAUSED_ANNOTATION) {
            RolloutIntent::RollingUpdatePaused
        } else {
            RolloutIntent::Normal
        };

        let canary = if is_true(annotations, CANARY_PAUSED_ANNOTATION) {
            let reason = annotations
                .get(CANARY_PAUSED_REASON_ANNOTATION)
                .filter(|r| !r.is_empty())
                .cloned()
                .unwrap_or_else(|| CanaryReason::Unknown.to_string());
            CanaryIntent::Paused { reason }
        } else if is_true(annotations, CANARY_UNPAUSED_ANNOTATION) {
            CanaryIntent::Unpaused
        } else {
            CanaryIntent::None
        };

        OperatorIntent {
            rollout,
            canary,
            validated: annotations
                .get(CANARY_VALID_ANNOTATION)
                .filter(|v| !v.is_empty())
                .cloned(),
            failed: is_true(annotations, CANARY_FAILED_ANNOTATION),
        }
    }

    /// Intent actually applied this pass
    ///
    /// Pausing or freezing the rollout is held back while a canary is in
    /// flight. The annotation stays, so the control is reported on every pass
    /// until the canary ends and it applies.
    pub fn effective(&self, canary_in_flight: Option<&str>) -> (OperatorIntent, Vec<PolicyViolation>) {
        let mut applied = self.clone();
        let mut violations = Vec::new();

        if let Some(replica_set) = canary_in_flight {
            let action = match self.rollout {
                RolloutIntent::Normal => None,
                RolloutIntent::RollingUpdatePaused => Some("pause the rolling update"),
                RolloutIntent::Frozen => Some("freeze the rollout"),
            };
            if let Some(action) = action {
                violations.push(PolicyViolation::DeferredUntilCanaryEnds {
                    action,
                    replica_set: replica_set.to_string(),
                });
                applied.rollout = RolloutIntent::Normal;
            }
        }

        (applied, violations)
    }

    pub fn is_rolling_update_paused(&self) -> bool {
        self.rollout == RolloutIntent::RollingUpdatePaused
    }

    pub fn is_frozen(&self) -> bool {
        self.rollout == RolloutIntent::Frozen
    }

    /// State reported when no canary is in flight
    pub fn non_canary_state(&self) -> EdsState {
        match self.rollout {
            RolloutIntent::Frozen => EdsState::RolloutFrozen,
            RolloutIntent::RollingUpdatePaused => EdsState::RollingUpdatePaused,
            RolloutIntent::Normal => EdsState::Running,
        }
    }

    pub fn is_validated(&self, replica_set: &str) -> bool {
        self.validated.as_deref() == Some(replica_set)
    }
}
