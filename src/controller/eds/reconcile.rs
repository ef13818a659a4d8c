use super::canary_nodes::select_canary_nodes;
use super::podtemplate::sync_pod_template;
use super::selection::{replica_sets_to_delete, select_current};
use super::state::{check_promotion_integrity, derive_status, CanaryView, StatusInput};
use crate::controller::conditions::{self, UpdateOptions};
use crate::controller::context::{Context, ReconcileError};
use crate::controller::fingerprint::{matches, template_hash};
use crate::controller::intent::OperatorIntent;
use crate::controller::retry::{is_conflict, read_modify_write, RetryPolicy};
use crate::controller::strategies::REQUEUE_PROMPTLY;
use crate::controller::validation::{validate_extended_daemon_set, StrategyPolicy};
use crate::server::metrics::SharedMetrics;
use crate::crd::condition::{ConditionStatus, ConditionType};
use crate::crd::extended_daemon_set::{ExtendedDaemonSet, ExtendedDaemonSetStatus};
use crate::crd::keys::{
    CANARY_FAILED_ANNOTATION, CANARY_PAUSED_ANNOTATION, CANARY_PAUSED_REASON_ANNOTATION,
    CANARY_UNPAUSED_ANNOTATION, EDS_NAME_LABEL, TEMPLATE_HASH_ANNOTATION, UNREADY_PODS_ANNOTATION,
};
use crate::crd::replica_set::{ExtendedDaemonSetReplicaSet, ExtendedDaemonSetReplicaSetSpec};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const CONTROLLER_NAME: &str = "extendeddaemonset";

/// The status is rewritten only when it changes, so no update timestamp
const ERROR_CONDITION: UpdateOptions = UpdateOptions {
    ignore_false_if_not_exist: true,
    support_last_update: false,
};

/// Canary annotations that only make sense while a canary is in flight
const CANARY_SCOPED_ANNOTATIONS: &[&str] = &[
    CANARY_PAUSED_ANNOTATION,
    CANARY_PAUSED_REASON_ANNOTATION,
    CANARY_UNPAUSED_ANNOTATION,
    CANARY_FAILED_ANNOTATION,
];

/// Snapshot read at the start of a pass
pub struct EdsInput<'a> {
    pub eds: &'a ExtendedDaemonSet,
    pub policy: &'a StrategyPolicy,
    /// Every generation labelled with the ExtendedDaemonSet name
    pub replica_sets: &'a [ExtendedDaemonSetReplicaSet],
    pub nodes: &'a [Node],
    /// Fingerprint of `eds.spec.template`
    pub hash: &'a str,
    pub now: DateTime<Utc>,
}

/// Changes a pass makes once the status is written
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdsUpdate {
    pub status: ExtendedDaemonSetStatus,
    /// Template of the active generation, restored after a failed canary
    pub restore_template: Option<PodTemplateSpec>,
    pub clear_annotations: Vec<&'static str>,
    pub delete_replica_sets: Vec<String>,
    pub requeue_after: Option<Duration>,
    /// A failed generation became current; nothing else is applied
    pub integrity_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum EdsPlan {
    /// No generation matches the template yet
    CreateReplicaSet(Box<ExtendedDaemonSetReplicaSet>),
    Update(Box<EdsUpdate>),
}

/// New generation for the current template
///
/// `unready` is the number of pods not ready across all generations when the
/// generation is created; the rolling update adds it to its unavailability
/// budget.
pub fn new_replica_set(
    eds: &ExtendedDaemonSet,
    hash: &str,
    unready: i32,
) -> ExtendedDaemonSetReplicaSet {
    let name = eds.name_any();

    let mut labels = eds.labels().clone();
    labels.insert(EDS_NAME_LABEL.to_string(), name.clone());

    let mut annotations = eds.annotations().clone();
    annotations.insert(TEMPLATE_HASH_ANNOTATION.to_string(), hash.to_string());
    annotations.insert(UNREADY_PODS_ANNOTATION.to_string(), unready.to_string());

    ExtendedDaemonSetReplicaSet {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", name)),
            namespace: eds.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: eds.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: ExtendedDaemonSetReplicaSetSpec {
            selector: eds.spec.selector.clone(),
            template: eds.spec.template.clone(),
            template_generation: hash.to_string(),
        },
        status: None,
    }
}

fn find_up_to_date<'a>(
    replica_sets: &'a [ExtendedDaemonSetReplicaSet],
    hash: &str,
) -> Option<&'a ExtendedDaemonSetReplicaSet> {
    replica_sets
        .iter()
        .filter(|rs| rs.metadata.deletion_timestamp.is_none())
        .find(|rs| matches(hash, rs))
}

fn min_requeue(current: Option<Duration>, other: Option<Duration>) -> Option<Duration> {
    match (current, other) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Plan one ExtendedDaemonSet pass
///
/// Pure: reads the snapshot and returns either the generation to create or
/// the status and follow-up writes.
pub fn plan_eds(input: &EdsInput<'_>) -> EdsPlan {
    let eds = input.eds;
    let now = input.now;
    let previous = eds.status.as_ref();

    let Some(up_to_date) = find_up_to_date(input.replica_sets, input.hash) else {
        let (current, ready) = input
            .replica_sets
            .iter()
            .filter_map(|rs| rs.status.as_ref())
            .fold((0, 0), |(c, r), s| (c + s.current, r + s.ready));
        return EdsPlan::CreateReplicaSet(Box::new(new_replica_set(
            eds,
            input.hash,
            (current - ready).max(0),
        )));
    };

    let active = eds
        .active_replica_set()
        .and_then(|name| input.replica_sets.iter().find(|rs| rs.name_any() == name));

    let requested = OperatorIntent::from_annotations(eds.annotations());
    let canary = input.policy.canary.as_ref();
    let selection = select_current(active, up_to_date, canary, &requested, now);
    let current = selection.current;

    let view = CanaryView::new(canary, &requested, current, up_to_date);
    let up_to_date_name = up_to_date.name_any();
    let (intent, violations) = requested.effective(view.active.then_some(up_to_date_name.as_str()));

    let mut errors: Vec<(&str, String)> = violations
        .iter()
        .map(|v| ("PolicyViolation", v.to_string()))
        .collect();

    let mut canary_nodes = Vec::new();
    if let (Some(policy), true) = (canary, view.active) {
        let already = previous
            .and_then(|s| s.canary.as_ref())
            .filter(|c| c.replica_set == up_to_date_name)
            .map(|c| c.nodes.clone())
            .unwrap_or_default();
        match select_canary_nodes(policy, up_to_date, input.nodes, &already) {
            Ok(selection) => {
                if let Some(message) = selection.shortfall() {
                    errors.push(("CanaryNodeSelection", message));
                }
                canary_nodes = selection.nodes;
            }
            Err(e) => {
                errors.push(("CanaryNodeSelection", e));
                canary_nodes = already;
            }
        }
    }

    let mut status = derive_status(
        &StatusInput {
            previous,
            replica_sets: input.replica_sets,
            current,
            up_to_date,
            canary,
            intent: &intent,
            canary_nodes,
            now,
        },
        &view,
    );

    let integrity_error = check_promotion_integrity(current, eds.active_replica_set()).err();
    if let Some(message) = &integrity_error {
        errors.insert(0, ("IntegrityViolation", message.clone()));
    }

    match errors.first() {
        Some((reason, _)) => conditions::upsert(
            &mut status.conditions,
            now,
            ConditionType::ReconcileError,
            ConditionStatus::True,
            reason,
            &errors
                .iter()
                .map(|(_, m)| m.as_str())
                .collect::<Vec<_>>()
                .join("; "),
            ERROR_CONDITION,
        ),
        None => conditions::upsert(
            &mut status.conditions,
            now,
            ConditionType::ReconcileError,
            ConditionStatus::False,
            "",
            "",
            ERROR_CONDITION,
        ),
    }

    if integrity_error.is_some() {
        return EdsPlan::Update(Box::new(EdsUpdate {
            status,
            integrity_error,
            ..Default::default()
        }));
    }

    let restore_template = (view.failed
        && current.name_any() != up_to_date_name
        && current.spec.template != eds.spec.template)
        .then(|| current.spec.template.clone());

    let clear_annotations = if view.active {
        Vec::new()
    } else {
        CANARY_SCOPED_ANNOTATIONS
            .iter()
            .copied()
            .filter(|key| eds.annotations().contains_key(*key))
            .collect()
    };

    let (delete_replica_sets, retention) = replica_sets_to_delete(
        input.replica_sets,
        &current.name_any(),
        &up_to_date_name,
        now,
    );

    EdsPlan::Update(Box::new(EdsUpdate {
        status,
        restore_template,
        clear_annotations,
        delete_replica_sets,
        requeue_after: min_requeue(selection.requeue_after, retention),
        integrity_error: None,
    }))
}

/// Merge patch body for a status write
///
/// Optional fields the derivation cleared are sent as null so the merge
/// removes them from the stored status.
pub fn status_patch(status: &ExtendedDaemonSetStatus) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(status)?;
    if let Some(fields) = value.as_object_mut() {
        for key in ["state", "activeReplicaSet", "canary", "reason"] {
            fields.entry(key).or_insert(Value::Null);
        }
    }
    Ok(json!({ "status": value }))
}

async fn write_status(
    api: &Api<ExtendedDaemonSet>,
    name: &str,
    status: &ExtendedDaemonSetStatus,
) -> Result<(), ReconcileError> {
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch(status)?))
        .await?;
    Ok(())
}

/// Restore the template and drop stale canary annotations in one write
async fn update_spec(
    api: &Api<ExtendedDaemonSet>,
    name: &str,
    restore_template: Option<&PodTemplateSpec>,
    clear_annotations: &[&'static str],
) -> Result<(), ReconcileError> {
    read_modify_write(
        &RetryPolicy::default(),
        "update-extendeddaemonset-spec",
        || api.get(name),
        |mut eds: ExtendedDaemonSet| {
            if let Some(template) = restore_template {
                eds.spec.template = template.clone();
            }
            if let Some(annotations) = eds.metadata.annotations.as_mut() {
                for key in clear_annotations {
                    annotations.remove(*key);
                }
            }
            Ok(eds)
        },
        |eds: ExtendedDaemonSet| async move { api.replace(name, &PostParams::default(), &eds).await },
        is_conflict,
    )
    .await
    .map_err(|e| ReconcileError::KubeError(e.into_inner()))?;
    Ok(())
}

/// Main reconciliation function for an ExtendedDaemonSet
///
/// # Flow
/// 1. Validate the spec and resolve the strategy defaults
/// 2. Create a generation for the template when none matches it
/// 3. Select the current generation, derive and write the status
/// 4. Roll back a failed canary, clear stale canary annotations
/// 5. Delete unused generations and mirror the template as a PodTemplate
pub async fn reconcile(
    eds: Arc<ExtendedDaemonSet>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = eds.name_any();
    if let Some(action) = ctx.skip_unless_leader(CONTROLLER_NAME, &name) {
        return Ok(action);
    }
    let started = Instant::now();
    let namespace = eds
        .namespace()
        .ok_or(ReconcileError::MissingNamespace("ExtendedDaemonSet"))?;
    if eds.meta().deletion_timestamp.is_some() {
        debug!(eds = %name, namespace = %namespace, "Being deleted, generations are garbage collected");
        if let Some(metrics) = &ctx.metrics {
            metrics.forget_extended_daemon_set(&namespace, &name);
        }
        return Ok(Action::await_change());
    }
    let now = ctx.clock.now();
    let api: Api<ExtendedDaemonSet> = Api::namespaced(ctx.client.clone(), &namespace);

    let policy = match validate_extended_daemon_set(&eds, ctx.config.default_validation_mode) {
        Ok(policy) => policy,
        Err(message) => {
            error!(eds = %name, namespace = %namespace, error = %message, "Invalid ExtendedDaemonSet");
            let mut status = eds.status.clone().unwrap_or_default();
            conditions::upsert(
                &mut status.conditions,
                now,
                ConditionType::ReconcileError,
                ConditionStatus::True,
                "ValidationError",
                &message,
                ERROR_CONDITION,
            );
            if eds.status.as_ref() != Some(&status) {
                write_status(&api, &name, &status).await?;
            }
            return Err(ReconcileError::ValidationError(message));
        }
    };

    let hash = template_hash(&eds.spec.template)?;
    let ers_api: Api<ExtendedDaemonSetReplicaSet> =
        Api::namespaced(ctx.client.clone(), &namespace);
    let replica_sets = ers_api
        .list(&ListParams::default().labels(&format!("{}={}", EDS_NAME_LABEL, name)))
        .await?
        .items;
    let nodes = if policy.canary.is_some() {
        Api::<Node>::all(ctx.client.clone())
            .list(&ListParams::default())
            .await?
            .items
    } else {
        Vec::new()
    };

    let plan = plan_eds(&EdsInput {
        eds: &eds,
        policy: &policy,
        replica_sets: &replica_sets,
        nodes: &nodes,
        hash: &hash,
        now,
    });

    let update = match plan {
        EdsPlan::CreateReplicaSet(replica_set) => {
            let created = ers_api.create(&PostParams::default(), &replica_set).await?;
            info!(
                eds = %name,
                namespace = %namespace,
                replicaset = %created.name_any(),
                hash = %hash,
                "Created replica set for new template"
            );
            sync_pod_template(ctx.client.clone(), &eds, &hash).await?;
            ctx.record_success(CONTROLLER_NAME, started);
            return Ok(Action::requeue(REQUEUE_PROMPTLY));
        }
        EdsPlan::Update(update) => update,
    };

    if eds.status.as_ref() != Some(&update.status) {
        let previous_active = eds.active_replica_set().unwrap_or_default();
        let active = update.status.active_replica_set.as_deref().unwrap_or_default();
        if previous_active != active {
            info!(eds = %name, namespace = %namespace, from = %previous_active, to = %active, "Active replica set changed");
        }
        write_status(&api, &name, &update.status).await?;
        debug!(eds = %name, state = ?update.status.state, "Status updated");
    }

    if let Some(message) = update.integrity_error {
        return Err(ReconcileError::IntegrityViolation(message));
    }

    if update.restore_template.is_some() || !update.clear_annotations.is_empty() {
        if update.restore_template.is_some() {
            warn!(eds = %name, namespace = %namespace, "Canary failed, restoring the active template");
        }
        update_spec(
            &api,
            &name,
            update.restore_template.as_ref(),
            &update.clear_annotations,
        )
        .await?;
    }

    for replica_set in &update.delete_replica_sets {
        match ers_api.delete(replica_set, &DeleteParams::default()).await {
            Ok(_) => info!(eds = %name, replicaset = %replica_set, "Deleted unused replica set"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    sync_pod_template(ctx.client.clone(), &eds, &hash).await?;

    if let Some(metrics) = &ctx.metrics {
        metrics.observe_extended_daemon_set(&namespace, &name, &update.status);
    }
    ctx.record_success(CONTROLLER_NAME, started);

    Ok(match update.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

/// Drop the gauges of each ExtendedDaemonSet once it is gone
///
/// Deleted objects never reach `reconcile`, so the deletions are taken from
/// a dedicated watch.
pub async fn forget_deleted(api: Api<ExtendedDaemonSet>, metrics: SharedMetrics) {
    let mut events = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Delete(eds)) => {
                let namespace = eds.namespace().unwrap_or_default();
                let name = eds.name_any();
                metrics.forget_extended_daemon_set(&namespace, &name);
                debug!(eds = %name, namespace = %namespace, "Removed metrics of deleted ExtendedDaemonSet");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "ExtendedDaemonSet watch failed, retrying"),
        }
    }
}
