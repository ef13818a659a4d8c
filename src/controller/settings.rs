//! Per-node resource overrides
//!
//! An `ExtendedDaemonsetSetting` overlays container resources on the nodes its
//! selector matches; node annotations can further override one container.
//! The base template is never mutated: every node gets a deep copy.

use super::fingerprint::{digest, node_override_digest};
use super::node::{node_labels, node_name, selector_matches};
use crate::crd::keys::node_resources_annotation_key;
use crate::crd::setting::{ContainerResources, ExtendedDaemonsetSetting};
use k8s_openapi::api::core::v1::{Node, PodTemplateSpec, ResourceRequirements};
use std::collections::BTreeMap;
use tracing::warn;

/// Resource overrides that apply to one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOverrides {
    /// Name of the matching setting, if any
    pub setting: Option<String>,
    pub setting_containers: Vec<ContainerResources>,
    /// Container name -> override parsed from node annotations
    pub annotation_containers: BTreeMap<String, ResourceRequirements>,
    annotation_digest: Option<String>,
}

impl NodeOverrides {
    pub fn is_empty(&self) -> bool {
        self.setting_containers.is_empty() && self.annotation_containers.is_empty()
    }

    /// Digest recorded on pods as `resourceshash`; None without overrides
    pub fn digest(&self) -> Result<Option<String>, serde_json::Error> {
        if self.is_empty() {
            return Ok(None);
        }
        digest(&(&self.setting, &self.setting_containers, &self.annotation_digest)).map(Some)
    }
}

/// First valid setting whose node selector matches the node
pub fn matching_setting<'a>(
    settings: &'a [ExtendedDaemonsetSetting],
    node: &Node,
) -> Option<&'a ExtendedDaemonsetSetting> {
    let labels = node_labels(node);
    settings
        .iter()
        .filter(|s| s.is_valid())
        .find(|s| selector_matches(&s.spec.node_selector, &labels).unwrap_or(false))
}

/// Collect the overrides that apply to `node` for one ExtendedDaemonSet
pub fn node_overrides(
    namespace: &str,
    eds_name: &str,
    container_names: &[String],
    settings: &[ExtendedDaemonsetSetting],
    node: &Node,
) -> Result<NodeOverrides, serde_json::Error> {
    let mut overrides = NodeOverrides::default();

    if let Some(setting) = matching_setting(settings, node) {
        overrides.setting = setting.metadata.name.clone();
        overrides.setting_containers = setting.spec.containers.clone();
    }

    let annotations = node.metadata.annotations.clone().unwrap_or_default();
    for container in container_names {
        let key = node_resources_annotation_key(namespace, eds_name, container);
        let Some(raw) = annotations.get(&key) else {
            continue;
        };
        match serde_json::from_str::<ResourceRequirements>(raw) {
            Ok(resources) => {
                overrides
                    .annotation_containers
                    .insert(container.clone(), resources);
            }
            Err(e) => {
                warn!(
                    node = node_name(node),
                    annotation = %key,
                    error = %e,
                    "Ignoring malformed resource override annotation"
                );
            }
        }
    }
    overrides.annotation_digest = node_override_digest(namespace, eds_name, &annotations)?;

    Ok(overrides)
}

/// Overlay the overrides onto a deep copy of the template
///
/// Requests and limits are merged per resource name; containers without an
/// override are left untouched. Node annotations win over settings.
pub fn apply_overrides(base: &PodTemplateSpec, overrides: &NodeOverrides) -> PodTemplateSpec {
    let mut template = base.clone();
    if overrides.is_empty() {
        return template;
    }

    if let Some(spec) = template.spec.as_mut() {
        for container in spec.containers.iter_mut() {
            for setting in overrides
                .setting_containers
                .iter()
                .filter(|c| c.name == container.name)
            {
                overlay(&mut container.resources, &setting.resources);
            }
            if let Some(resources) = overrides.annotation_containers.get(&container.name) {
                overlay(&mut container.resources, resources);
            }
        }
    }

    template
}

fn overlay(target: &mut Option<ResourceRequirements>, source: &ResourceRequirements) {
    let target = target.get_or_insert_with(ResourceRequirements::default);
    if let Some(requests) = &source.requests {
        target
            .requests
            .get_or_insert_with(BTreeMap::new)
            .extend(requests.clone());
    }
    if let Some(limits) = &source.limits {
        target
            .limits
            .get_or_insert_with(BTreeMap::new)
            .extend(limits.clone());
    }
}

/// Older setting for the same ExtendedDaemonSet that shares a node with `setting`
///
/// The setting created first wins; ties are broken by name.
pub fn find_conflict<'a>(
    setting: &ExtendedDaemonsetSetting,
    others: &'a [ExtendedDaemonsetSetting],
    nodes: &[Node],
) -> Result<Option<&'a ExtendedDaemonsetSetting>, String> {
    let Some(reference) = setting.reference_name() else {
        return Ok(None);
    };
    let own_key = age_key(setting);

    for other in others {
        if other.metadata.name == setting.metadata.name || other.reference_name() != Some(reference) {
            continue;
        }
        if age_key(other) >= own_key {
            continue;
        }
        for node in nodes {
            let labels = node_labels(node);
            if selector_matches(&setting.spec.node_selector, &labels)?
                && selector_matches(&other.spec.node_selector, &labels).unwrap_or(false)
            {
                return Ok(Some(other));
            }
        }
    }

    Ok(None)
}

fn age_key(setting: &ExtendedDaemonsetSetting) -> (Option<String>, String) {
    (
        setting
            .metadata
            .creation_timestamp
            .as_ref()
            .and_then(super::clock::time_to_utc)
            .map(super::clock::format_timestamp),
        setting.metadata.name.clone().unwrap_or_default(),
    )
}
