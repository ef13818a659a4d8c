//! Template fingerprints
//!
//! Inspired by Kubernetes' pod-template-hash label concept, using FNV-1a over
//! the JSON serialization. serde_json renders maps in key order, so label and
//! annotation ordering never perturbs a digest.

use crate::crd::keys::{node_resources_annotation_scope, TEMPLATE_HASH_ANNOTATION};
use crate::crd::replica_set::ExtendedDaemonSetReplicaSet;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use serde::Serialize;
use std::collections::BTreeMap;

/// FNV-1a digest of any serializable value, as 10 hex characters
pub fn digest<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(value)?;

    // FNV-1a (deterministic across processes, unlike DefaultHasher/SipHash)
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in json.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }

    Ok(format!("{hash:016x}")[..10].to_string())
}

/// Fingerprint of a pod template
pub fn template_hash(template: &PodTemplateSpec) -> Result<String, serde_json::Error> {
    digest(template)
}

/// Digest of the per-node resource overrides of one ExtendedDaemonSet
///
/// Only annotations under `resources.extendeddaemonset.datadoghq.com/<ns>.<eds>.`
/// take part. Returns None when the node carries no override.
pub fn node_override_digest(
    namespace: &str,
    eds_name: &str,
    node_annotations: &BTreeMap<String, String>,
) -> Result<Option<String>, serde_json::Error> {
    let scope = node_resources_annotation_scope(namespace, eds_name);
    let scoped: BTreeMap<&str, &str> = node_annotations
        .iter()
        .filter(|(key, _)| key.starts_with(&scope))
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();

    if scoped.is_empty() {
        return Ok(None);
    }
    digest(&scoped).map(Some)
}

/// Whether the ERS was built from the template with this fingerprint
pub fn matches(hash: &str, ers: &ExtendedDaemonSetReplicaSet) -> bool {
    ers.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(TEMPLATE_HASH_ANNOTATION))
        .map(|stored| stored == hash)
        .unwrap_or(false)
}
