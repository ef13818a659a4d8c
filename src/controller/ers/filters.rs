//! Desired node set and pod-to-node mapping for one replica set pass

use crate::controller::clock::time_to_utc;
use crate::controller::node::{check_node_fitness, node_labels, node_name, selector_matches};
use crate::controller::pod::{is_terminating, pod_name, pod_node_name};
use crate::controller::settings::node_overrides;
use crate::controller::strategies::{is_owned_by, NodeItem};
use crate::crd::replica_set::ExtendedDaemonSetReplicaSet;
use crate::crd::setting::ExtendedDaemonsetSetting;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::BTreeMap;
use tracing::debug;

/// Nodes with their pod, plus the pods that no longer belong anywhere
#[derive(Debug, Default)]
pub struct NodePodMapping {
    /// Desired nodes sorted by name
    pub items: Vec<NodeItem>,
    /// Pods to delete regardless of pacing: evicted, stray or duplicate
    pub to_cleanup: Vec<String>,
}

/// Nodes that may run a pod of this generation, sorted by name
///
/// The replica set selector restricts nodes by label; the template decides
/// the rest through node selector, required affinity and taints.
pub fn desired_nodes(replica_set: &ExtendedDaemonSetReplicaSet, nodes: &[Node]) -> Vec<Node> {
    let Some(spec) = replica_set.spec.template.spec.as_ref() else {
        return Vec::new();
    };

    let mut desired: Vec<Node> = nodes
        .iter()
        .filter(|node| match &replica_set.spec.selector {
            Some(selector) => selector_matches(selector, &node_labels(node)).unwrap_or(false),
            None => true,
        })
        .filter(|node| check_node_fitness(spec, node))
        .cloned()
        .collect();
    desired.sort_by(|a, b| node_name(a).cmp(node_name(b)));
    desired
}

fn is_evicted(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .map(|s| {
            s.phase.as_deref() == Some("Failed") && s.reason.as_deref() == Some("Evicted")
        })
        .unwrap_or(false)
}

/// Preference order when a node runs more than one pod
///
/// Live pods before terminating ones, this generation's pods first, then
/// the oldest.
fn keep_order(
    replica_set: &ExtendedDaemonSetReplicaSet,
    pod: &Pod,
) -> (bool, bool, Option<DateTime<Utc>>, String) {
    let created = pod.metadata.creation_timestamp.as_ref().and_then(time_to_utc);
    (
        is_terminating(pod),
        !is_owned_by(pod, replica_set),
        created,
        pod_name(pod).to_string(),
    )
}

/// Attach each pod to its node and compute per-node overrides
///
/// Pods on `ignored_nodes` are left alone: they belong to another
/// generation's scope, such as the canary nodes seen from the active one.
pub fn map_pods_to_nodes(
    replica_set: &ExtendedDaemonSetReplicaSet,
    namespace: &str,
    eds_name: &str,
    desired: Vec<Node>,
    pods: &[Pod],
    settings: &[ExtendedDaemonsetSetting],
    ignored_nodes: &[String],
) -> Result<NodePodMapping, serde_json::Error> {
    let mut mapping = NodePodMapping::default();
    let mut pods_by_node: BTreeMap<String, Vec<&Pod>> = BTreeMap::new();

    for pod in pods {
        let Some(node) = pod_node_name(pod) else {
            continue;
        };
        if ignored_nodes.contains(&node) {
            continue;
        }
        if is_evicted(pod) {
            mapping.to_cleanup.push(pod_name(pod).to_string());
            continue;
        }
        pods_by_node.entry(node).or_default().push(pod);
    }

    let container_names: Vec<String> = replica_set
        .spec
        .template
        .spec
        .as_ref()
        .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();

    for node in desired {
        let name = node_name(&node).to_string();
        let mut node_pods = pods_by_node.remove(&name).unwrap_or_default();
        node_pods.sort_by_key(|pod| keep_order(replica_set, pod));

        let mut node_pods = node_pods.into_iter();
        let pod = node_pods.next().cloned();
        for duplicate in node_pods.filter(|p| !is_terminating(p)) {
            debug!(node = %name, pod = pod_name(duplicate), "Duplicate daemon pod on node");
            mapping.to_cleanup.push(pod_name(duplicate).to_string());
        }

        let overrides = node_overrides(namespace, eds_name, &container_names, settings, &node)?;
        let resources_hash = overrides.digest()?;
        mapping.items.push(NodeItem {
            node,
            pod,
            overrides,
            resources_hash,
        });
    }

    // Whatever is left runs on a node outside the desired set
    for (node, stray) in pods_by_node {
        for pod in stray.into_iter().filter(|p| !is_terminating(p)) {
            debug!(node = %node, pod = pod_name(pod), "Pod on a node outside the desired set");
            mapping.to_cleanup.push(pod_name(pod).to_string());
        }
    }

    Ok(mapping)
}
