//! ExtendedDaemonsetSetting validation
//!
//! A setting is only merged into pod templates once this controller marks
//! it `Valid`. It must reference an ExtendedDaemonSet, carry a well formed
//! node selector and must not share a node with an older setting for the
//! same ExtendedDaemonSet.

use crate::controller::context::{Context, ReconcileError};
use crate::controller::node::validate_selector;
use crate::controller::settings::find_conflict;
use crate::crd::setting::{ExtendedDaemonsetSetting, ExtendedDaemonsetSettingStatus, SettingState};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub const CONTROLLER_NAME: &str = "extendeddaemonsetsetting";

/// Check a setting against its siblings and the current nodes
pub fn validate_setting(
    setting: &ExtendedDaemonsetSetting,
    others: &[ExtendedDaemonsetSetting],
    nodes: &[Node],
) -> Result<(), String> {
    if setting.reference_name().is_none() {
        return Err("spec.reference is empty".to_string());
    }
    validate_selector(&setting.spec.node_selector)
        .map_err(|e| format!("invalid spec.nodeSelector: {}", e))?;

    match find_conflict(setting, others, nodes)? {
        Some(conflict) => Err(format!(
            "conflict with another ExtendedDaemonsetSetting: {}",
            conflict.name_any()
        )),
        None => Ok(()),
    }
}

/// Status written for a validation outcome
pub fn setting_status(outcome: &Result<(), String>) -> ExtendedDaemonsetSettingStatus {
    match outcome {
        Ok(()) => ExtendedDaemonsetSettingStatus {
            status: Some(SettingState::Valid),
            error: None,
        },
        Err(e) => ExtendedDaemonsetSettingStatus {
            status: Some(SettingState::Error),
            error: Some(e.clone()),
        },
    }
}

pub async fn reconcile(
    setting: Arc<ExtendedDaemonsetSetting>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = setting.name_any();
    if let Some(action) = ctx.skip_unless_leader(CONTROLLER_NAME, &name) {
        return Ok(action);
    }
    let started = Instant::now();
    let namespace = setting
        .namespace()
        .ok_or(ReconcileError::MissingNamespace("ExtendedDaemonsetSetting"))?;

    let api: Api<ExtendedDaemonsetSetting> = Api::namespaced(ctx.client.clone(), &namespace);
    let others = api.list(&ListParams::default()).await?.items;
    let nodes = Api::<Node>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await?
        .items;

    let outcome = validate_setting(&setting, &others, &nodes);
    let status = setting_status(&outcome);

    if setting.status.as_ref() != Some(&status) {
        match &outcome {
            Ok(()) => info!(setting = %name, namespace = %namespace, "Setting is valid"),
            Err(e) => info!(setting = %name, namespace = %namespace, error = %e, "Setting rejected"),
        }
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await?;
    } else {
        debug!(setting = %name, "Setting status unchanged");
    }

    ctx.record_success(CONTROLLER_NAME, started);
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn setting(name: &str, reference: &str, created: &str, selector: &str) -> ExtendedDaemonsetSetting {
        serde_yaml::from_str(&format!(
            r#"
apiVersion: datadoghq.com/v1alpha1
kind: ExtendedDaemonsetSetting
metadata:
  name: {name}
  namespace: monitoring
  creationTimestamp: "{created}"
spec:
  reference:
    kind: ExtendedDaemonSet
    name: "{reference}"
  nodeSelector: {selector}
  containers:
  - name: agent
    resources:
      requests:
        memory: 1Gi
"#
        ))
        .unwrap()
    }

    fn nodes() -> Vec<Node> {
        vec![serde_yaml::from_str("metadata: {name: n1, labels: {pool: bigmemory}}").unwrap()]
    }

    #[test]
    fn test_valid_setting() {
        let s = setting("big", "agent", "2026-03-01T10:00:00Z", "{matchLabels: {pool: bigmemory}}");

        let outcome = validate_setting(&s, &[s.clone()], &nodes());

        assert!(outcome.is_ok());
        assert_eq!(setting_status(&outcome).status, Some(SettingState::Valid));
    }

    #[test]
    fn test_missing_reference_is_rejected() {
        let mut s = setting("big", "agent", "2026-03-01T10:00:00Z", "{}");
        s.spec.reference = None;
        let unnamed = setting("big2", "", "2026-03-01T10:00:00Z", "{}");

        assert!(validate_setting(&s, &[], &nodes()).is_err());
        assert_eq!(
            validate_setting(&unnamed, &[], &nodes()).unwrap_err(),
            "spec.reference is empty"
        );
    }

    #[test]
    fn test_invalid_selector_is_rejected() {
        let s = setting(
            "big",
            "agent",
            "2026-03-01T10:00:00Z",
            "{matchExpressions: [{key: pool, operator: Near, values: [a]}]}",
        );

        let err = validate_setting(&s, &[], &nodes()).unwrap_err();

        assert!(err.starts_with("invalid spec.nodeSelector"));
    }

    #[test]
    fn test_newer_setting_conflicts_with_older_one() {
        // ARRANGE: both settings match n1
        let older = setting("big", "agent", "2026-03-01T10:00:00Z", "{matchLabels: {pool: bigmemory}}");
        let newer = setting("big2", "agent", "2026-03-01T11:00:00Z", "{matchLabels: {pool: bigmemory}}");
        let all = vec![older.clone(), newer.clone()];

        // ACT
        let older_outcome = validate_setting(&older, &all, &nodes());
        let newer_outcome = validate_setting(&newer, &all, &nodes());

        // ASSERT
        assert!(older_outcome.is_ok());
        let status = setting_status(&newer_outcome);
        assert_eq!(status.status, Some(SettingState::Error));
        assert_eq!(
            status.error.as_deref(),
            Some("conflict with another ExtendedDaemonsetSetting: big")
        );
    }

    #[test]
    fn test_settings_for_other_eds_do_not_conflict() {
        let older = setting("big", "agent", "2026-03-01T10:00:00Z", "{matchLabels: {pool: bigmemory}}");
        let other = setting("big2", "apm", "2026-03-01T11:00:00Z", "{matchLabels: {pool: bigmemory}}");

        assert!(validate_setting(&other, &[older, other.clone()], &nodes()).is_ok());
    }
}
