//! Operator actions
//!
//! Entry points a client tool uses to pause, freeze, validate or fail a
//! rollout. Each action is an annotation write on the ExtendedDaemonSet; the
//! reconcilers pick it up through `OperatorIntent` on their next pass.
//! Actions that make no sense in the current state are rejected instead of
//! being written.

use crate::controller::intent::{CanaryIntent, OperatorIntent, PolicyViolation, RolloutIntent};
use crate::controller::retry::{is_conflict, read_modify_write, RetryPolicy};
use crate::crd::extended_daemon_set::{EdsState, ExtendedDaemonSet};
use crate::crd::keys::{
    CANARY_FAILED_ANNOTATION, CANARY_PAUSED_ANNOTATION, CANARY_PAUSED_REASON_ANNOTATION,
    CANARY_UNPAUSED_ANNOTATION, CANARY_VALID_ANNOTATION, ROLLING_UPDATE_PAUSED_ANNOTATION,
    ROLLOUT_FROZEN_ANNOTATION, TRUE_VALUE,
};
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorAction {
    PauseRollingUpdate,
    UnpauseRollingUpdate,
    FreezeRollout,
    UnfreezeRollout,
    PauseCanary { reason: Option<String> },
    UnpauseCanary,
    /// Promote a manually validated canary
    ValidateCanary { replica_set: String },
    FailCanary,
}

impl fmt::Display for OperatorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorAction::PauseRollingUpdate => "pause-rolling-update",
            OperatorAction::UnpauseRollingUpdate => "unpause-rolling-update",
            OperatorAction::FreezeRollout => "freeze-rollout",
            OperatorAction::UnfreezeRollout => "unfreeze-rollout",
            OperatorAction::PauseCanary { .. } => "pause-canary",
            OperatorAction::UnpauseCanary => "unpause-canary",
            OperatorAction::ValidateCanary { .. } => "validate-canary",
            OperatorAction::FailCanary => "fail-canary",
        };
        f.write_str(name)
    }
}

/// Annotation changes: `Some` sets the value, `None` removes the key
pub type AnnotationPatch = BTreeMap<String, Option<String>>;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Rejected operator action: {0}")]
    PolicyViolation(#[from] PolicyViolation),
}

fn set(patch: &mut AnnotationPatch, key: &str, value: &str) {
    patch.insert(key.to_string(), Some(value.to_string()));
}

fn remove(patch: &mut AnnotationPatch, key: &str) {
    patch.insert(key.to_string(), None);
}

fn in_flight_canary(eds: &ExtendedDaemonSet) -> Result<&str, PolicyViolation> {
    eds.canary_replica_set()
        .ok_or(PolicyViolation::NoCanaryInFlight)
}

fn is_canary_paused(eds: &ExtendedDaemonSet, intent: &OperatorIntent) -> bool {
    matches!(intent.canary, CanaryIntent::Paused { .. })
        || eds.status.as_ref().and_then(|s| s.state) == Some(EdsState::CanaryPaused)
}

/// Annotation patch for `action`, or the reason it is rejected
pub fn plan_action(
    eds: &ExtendedDaemonSet,
    action: &OperatorAction,
) -> Result<AnnotationPatch, PolicyViolation> {
    let intent = OperatorIntent::from_annotations(eds.annotations());
    let canary = eds.canary_replica_set();
    let mut patch = AnnotationPatch::new();

    match action {
        OperatorAction::PauseRollingUpdate => {
            if intent.rollout == RolloutIntent::RollingUpdatePaused {
                return Err(PolicyViolation::RollingUpdateAlreadyPaused);
            }
            if let Some(replica_set) = canary {
                return Err(PolicyViolation::CanaryInFlight {
                    action: "pause the rolling update",
                    replica_set: replica_set.to_string(),
                });
            }
            set(&mut patch, ROLLING_UPDATE_PAUSED_ANNOTATION, TRUE_VALUE);
        }
        OperatorAction::UnpauseRollingUpdate => {
            if !eds.annotations().contains_key(ROLLING_UPDATE_PAUSED_ANNOTATION)
                || intent.rollout == RolloutIntent::Normal
            {
                return Err(PolicyViolation::RollingUpdateNotPaused);
            }
            remove(&mut patch, ROLLING_UPDATE_PAUSED_ANNOTATION);
        }
        OperatorAction::FreezeRollout => {
            if intent.is_frozen() {
                return Err(PolicyViolation::RolloutAlreadyFrozen);
            }
            if let Some(replica_set) = canary {
                return Err(PolicyViolation::CanaryInFlight {
                    action: "freeze the rollout",
                    replica_set: replica_set.to_string(),
                });
            }
            set(&mut patch, ROLLOUT_FROZEN_ANNOTATION, TRUE_VALUE);
        }
        OperatorAction::UnfreezeRollout => {
            if !intent.is_frozen() {
                return Err(PolicyViolation::RolloutNotFrozen);
            }
            remove(&mut patch, ROLLOUT_FROZEN_ANNOTATION);
        }
        OperatorAction::PauseCanary { reason } => {
            in_flight_canary(eds)?;
            if is_canary_paused(eds, &intent) {
                return Err(PolicyViolation::CanaryAlreadyPaused);
            }
            set(&mut patch, CANARY_PAUSED_ANNOTATION, TRUE_VALUE);
            match reason.as_deref().filter(|r| !r.is_empty()) {
                Some(reason) => set(&mut patch, CANARY_PAUSED_REASON_ANNOTATION, reason),
                None => remove(&mut patch, CANARY_PAUSED_REASON_ANNOTATION),
            }
            remove(&mut patch, CANARY_UNPAUSED_ANNOTATION);
        }
        OperatorAction::UnpauseCanary => {
            in_flight_canary(eds)?;
            if !is_canary_paused(eds, &intent) {
                return Err(PolicyViolation::CanaryNotPaused);
            }
            remove(&mut patch, CANARY_PAUSED_ANNOTATION);
            remove(&mut patch, CANARY_PAUSED_REASON_ANNOTATION);
            set(&mut patch, CANARY_UNPAUSED_ANNOTATION, TRUE_VALUE);
        }
        OperatorAction::ValidateCanary { replica_set } => {
            let current = in_flight_canary(eds)?;
            if current != replica_set {
                return Err(PolicyViolation::UnknownReplicaSet {
                    requested: replica_set.clone(),
                    current: current.to_string(),
                });
            }
            set(&mut patch, CANARY_VALID_ANNOTATION, replica_set);
        }
        OperatorAction::FailCanary => {
            in_flight_canary(eds)?;
            if intent.failed {
                return Err(PolicyViolation::CanaryAlreadyFailed);
            }
            set(&mut patch, CANARY_FAILED_ANNOTATION, TRUE_VALUE);
        }
    }

    Ok(patch)
}

fn apply_patch(eds: &mut ExtendedDaemonSet, patch: &AnnotationPatch) {
    let annotations = eds.annotations_mut();
    for (key, value) in patch {
        match value {
            Some(value) => {
                annotations.insert(key.clone(), value.clone());
            }
            None => {
                annotations.remove(key);
            }
        }
    }
}

/// Perform `action` on the named ExtendedDaemonSet
///
/// The action is re-planned against every fresh read, so a conflicting
/// concurrent change can still turn it into a rejection.
pub async fn apply_action(
    api: &Api<ExtendedDaemonSet>,
    name: &str,
    action: &OperatorAction,
) -> Result<ExtendedDaemonSet, ActionError> {
    let operation = action.to_string();
    let updated = read_modify_write(
        &RetryPolicy::default(),
        &operation,
        || async { api.get(name).await.map_err(ActionError::from) },
        |mut eds: ExtendedDaemonSet| -> Result<ExtendedDaemonSet, ActionError> {
            let patch = plan_action(&eds, action)?;
            apply_patch(&mut eds, &patch);
            Ok(eds)
        },
        |eds: ExtendedDaemonSet| async move {
            api.replace(name, &PostParams::default(), &eds)
                .await
                .map_err(ActionError::from)
        },
        |e: &ActionError| matches!(e, ActionError::KubeError(k) if is_conflict(k)),
    )
    .await
    .map_err(|e| e.into_inner())?;

    info!(eds = %name, action = %operation, "Applied operator action");
    Ok(updated)
}
