//! Daemon pod construction
//!
//! A pod is the replica set template with the node's resource overrides
//! folded in, pinned to its node through required node affinity the way the
//! DaemonSet controller pins its pods.

use crate::controller::node::NODE_NAME_FIELD;
use crate::controller::settings::apply_overrides;
use crate::controller::strategies::{replica_set_hash, NodeItem};
use crate::crd::keys::{
    EDS_NAME_LABEL, ERS_CANARY_LABEL, ERS_NAME_LABEL, RESOURCES_HASH_ANNOTATION,
    TEMPLATE_HASH_ANNOTATION, TRUE_VALUE,
};
use crate::crd::replica_set::{ExtendedDaemonSetReplicaSet, ReplicaSetRole};
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod, PodSpec,
    Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

/// Tolerations every daemon pod carries so node conditions never evict it
const DAEMON_TOLERATIONS: &[(&str, &str)] = &[
    ("node.kubernetes.io/not-ready", "NoExecute"),
    ("node.kubernetes.io/unreachable", "NoExecute"),
    ("node.kubernetes.io/disk-pressure", "NoSchedule"),
    ("node.kubernetes.io/memory-pressure", "NoSchedule"),
    ("node.kubernetes.io/pid-pressure", "NoSchedule"),
    ("node.kubernetes.io/unschedulable", "NoSchedule"),
];

/// Build the pod this generation runs on `item`'s node
pub fn build_pod(
    replica_set: &ExtendedDaemonSetReplicaSet,
    eds_name: &str,
    role: ReplicaSetRole,
    item: &NodeItem,
) -> Pod {
    let replica_set_name = replica_set.name_any();
    let template = apply_overrides(&replica_set.spec.template, &item.overrides);
    let template_meta = template.metadata.unwrap_or_default();

    let mut labels = template_meta.labels.unwrap_or_default();
    labels.insert(EDS_NAME_LABEL.to_string(), eds_name.to_string());
    labels.insert(ERS_NAME_LABEL.to_string(), replica_set_name.clone());
    if role == ReplicaSetRole::Canary {
        labels.insert(ERS_CANARY_LABEL.to_string(), TRUE_VALUE.to_string());
    }

    let mut annotations = template_meta.annotations.unwrap_or_default();
    annotations.insert(
        TEMPLATE_HASH_ANNOTATION.to_string(),
        replica_set_hash(replica_set).to_string(),
    );
    if let Some(hash) = &item.resources_hash {
        annotations.insert(RESOURCES_HASH_ANNOTATION.to_string(), hash.clone());
    }

    let mut spec = template.spec.unwrap_or_default();
    pin_to_node(&mut spec, item.name());
    add_daemon_tolerations(&mut spec);

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", replica_set_name)),
            namespace: replica_set.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: replica_set.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// Replace the required node affinity with a single `metadata.name` term
///
/// Label expressions of the template were already checked against the node.
fn pin_to_node(spec: &mut PodSpec, node: &str) {
    let term = NodeSelectorTerm {
        match_expressions: None,
        match_fields: Some(vec![NodeSelectorRequirement {
            key: NODE_NAME_FIELD.to_string(),
            operator: "In".to_string(),
            values: Some(vec![node.to_string()]),
        }]),
    };

    let affinity = spec.affinity.get_or_insert_with(Affinity::default);
    let node_affinity = affinity.node_affinity.get_or_insert_with(NodeAffinity::default);
    node_affinity.required_during_scheduling_ignored_during_execution = Some(NodeSelector {
        node_selector_terms: vec![term],
    });
}

fn add_daemon_tolerations(spec: &mut PodSpec) {
    let tolerations = spec.tolerations.get_or_insert_with(Vec::new);
    for (key, effect) in DAEMON_TOLERATIONS {
        let present = tolerations.iter().any(|t| {
            t.key.as_deref() == Some(key) && t.effect.as_deref() == Some(effect)
        });
        if !present {
            tolerations.push(Toleration {
                key: Some(key.to_string()),
                operator: Some("Exists".to_string()),
                effect: Some(effect.to_string()),
                ..Default::default()
            });
        }
    }
}
