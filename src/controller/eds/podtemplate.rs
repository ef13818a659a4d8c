//! PodTemplate mirror of the current ExtendedDaemonSet template
//!
//! Kept up to date for tools that inspect daemon pod templates, the cluster
//! autoscaler in particular.

use crate::crd::extended_daemon_set::ExtendedDaemonSet;
use crate::crd::keys::{AUTOSCALER_DAEMONSET_POD_LABEL, TEMPLATE_HASH_ANNOTATION, TRUE_VALUE};
use k8s_openapi::api::core::v1::PodTemplate;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::info;

/// PodTemplate named after the ExtendedDaemonSet and owned by it
pub fn desired_pod_template(eds: &ExtendedDaemonSet, hash: &str) -> PodTemplate {
    let mut labels = eds.labels().clone();
    labels.insert(
        AUTOSCALER_DAEMONSET_POD_LABEL.to_string(),
        TRUE_VALUE.to_string(),
    );
    let mut annotations = eds.annotations().clone();
    annotations.insert(TEMPLATE_HASH_ANNOTATION.to_string(), hash.to_string());

    PodTemplate {
        metadata: ObjectMeta {
            name: Some(eds.name_any()),
            namespace: eds.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: eds.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        template: Some(eds.spec.template.clone()),
    }
}

fn recorded_hash(template: &PodTemplate) -> Option<&str> {
    template
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(TEMPLATE_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Create the mirror when missing; replace it when its hash is stale
pub async fn sync_pod_template(
    client: Client,
    eds: &ExtendedDaemonSet,
    hash: &str,
) -> Result<(), kube::Error> {
    let namespace = eds.namespace().unwrap_or_default();
    let name = eds.name_any();
    let api: Api<PodTemplate> = Api::namespaced(client, &namespace);
    let desired = desired_pod_template(eds, hash);

    match api.get_opt(&name).await? {
        None => {
            api.create(&PostParams::default(), &desired).await?;
            info!(eds = %name, namespace = %namespace, hash = %hash, "Created pod template");
        }
        Some(existing) if recorded_hash(&existing) != Some(hash) => {
            let mut replacement = desired;
            replacement.metadata.resource_version = existing.metadata.resource_version;
            api.replace(&name, &PostParams::default(), &replacement).await?;
            info!(eds = %name, namespace = %namespace, hash = %hash, "Updated pod template");
        }
        Some(_) => {}
    }
    Ok(())
}
