//! Canary node placement
//!
//! Nodes are picked deterministically in name order among the nodes that
//! can run the candidate generation and match the canary node selector.
//! Anti-affinity keys spread the picks across label value buckets.

use crate::controller::ers::filters::desired_nodes;
use crate::controller::node::{node_labels, node_name, selector_matches};
use crate::controller::validation::{resolve_int_or_percent, CanaryPolicy};
use crate::crd::replica_set::ExtendedDaemonSetReplicaSet;
use k8s_openapi::api::core::v1::Node;
use std::collections::BTreeMap;

/// Nodes chosen for the canary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanaryNodeSelection {
    /// Sorted by name
    pub nodes: Vec<String>,
    pub wanted: usize,
}

impl CanaryNodeSelection {
    /// Message reported when fewer nodes than wanted could be picked
    pub fn shortfall(&self) -> Option<String> {
        (self.nodes.len() < self.wanted).then(|| {
            format!(
                "unable to select enough node for canary, current: {}, wanted: {}",
                self.nodes.len(),
                self.wanted
            )
        })
    }
}

fn bucket_key(node: &Node, keys: &[String]) -> String {
    let labels = node_labels(node);
    keys.iter()
        .map(|key| labels.get(key).cloned().unwrap_or_default())
        .collect::<Vec<_>>()
        .join("$")
}

/// Select the nodes that run the canary generation
///
/// Nodes already running the canary are kept while they remain eligible.
/// The number of canary nodes is resolved against the eligible node count.
///
/// # Returns
/// * `Err(String)` - The canary node selector or replica count is malformed
pub fn select_canary_nodes(
    canary: &CanaryPolicy,
    replica_set: &ExtendedDaemonSetReplicaSet,
    nodes: &[Node],
    current: &[String],
) -> Result<CanaryNodeSelection, String> {
    let mut candidates = Vec::new();
    for node in desired_nodes(replica_set, nodes) {
        let matches = match &canary.node_selector {
            Some(selector) => selector_matches(selector, &node_labels(&node))?,
            None => true,
        };
        if matches {
            candidates.push(node);
        }
    }

    let wanted = resolve_int_or_percent(&canary.replicas, candidates.len() as i32)
        .map_err(|v| format!("invalid canary replicas: {}", v))?
        .max(0) as usize;

    let mut selected: Vec<&Node> = candidates
        .iter()
        .filter(|node| current.iter().any(|name| name == node_name(node)))
        .take(wanted)
        .collect();

    let mut buckets: BTreeMap<String, usize> = candidates
        .iter()
        .map(|node| (bucket_key(node, &canary.node_anti_affinity_keys), 0))
        .collect();
    for node in &selected {
        if let Some(count) = buckets.get_mut(&bucket_key(node, &canary.node_anti_affinity_keys)) {
            *count += 1;
        }
    }
    let per_bucket = wanted.div_ceil(buckets.len().max(1));

    for node in &candidates {
        if selected.len() >= wanted {
            break;
        }
        if selected.iter().any(|s| node_name(s) == node_name(node)) {
            continue;
        }
        let key = bucket_key(node, &canary.node_anti_affinity_keys);
        let Some(count) = buckets.get_mut(&key) else {
            continue;
        };
        if *count >= per_bucket {
            continue;
        }
        *count += 1;
        selected.push(node);
    }

    let mut names: Vec<String> = selected.iter().map(|n| node_name(n).to_string()).collect();
    names.sort();
    Ok(CanaryNodeSelection {
        nodes: names,
        wanted,
    })
}
