use extendeddaemonset::controller::clock::SystemClock;
use extendeddaemonset::controller::{eds, error_policy, ers, setting, Context, ControllerConfig};
use extendeddaemonset::crd::extended_daemon_set::ExtendedDaemonSet;
use extendeddaemonset::crd::replica_set::ExtendedDaemonSetReplicaSet;
use extendeddaemonset::crd::setting::ExtendedDaemonsetSetting;
use extendeddaemonset::server::{
    create_metrics, run_health_server, run_leader_election, shutdown_channel, wait_for_signal,
    LeaderConfig, LeaderState, ReadinessState,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default port for health and metrics endpoints
const HEALTH_PORT: u16 = 8080;

/// "true" or "1" enables a boolean setting
fn parse_flag(value: &str) -> bool {
    value == "true" || value == "1"
}

/// `EDS_LEADER_ELECTION`: compete for a lease before reconciling
fn is_leader_election_enabled() -> bool {
    std::env::var("EDS_LEADER_ELECTION")
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

/// `EDS_HEALTH_PORT`, falling back to the default on a malformed value
fn health_port(value: Option<&str>) -> u16 {
    value.and_then(|v| v.parse().ok()).unwrap_or(HEALTH_PORT)
}

/// `EDS_WATCH_NAMESPACE`: restrict the controllers to one namespace
fn watch_namespace(value: Option<String>) -> Option<String> {
    value.filter(|ns| !ns.is_empty())
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Every replica set known to the controller cache
fn all_replica_sets(
    store: &Store<ExtendedDaemonSetReplicaSet>,
) -> Vec<ObjectRef<ExtendedDaemonSetReplicaSet>> {
    store
        .state()
        .iter()
        .map(|rs| ObjectRef::from_obj(rs.as_ref()))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting ExtendedDaemonSet controller");

    let _ = rustls::crypto::ring::default_provider().install_default();

    let (shutdown_trigger, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();

    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let leader_state = LeaderState::new();

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let port = health_port(std::env::var("EDS_HEALTH_PORT").ok().as_deref());
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let leader_election_enabled = is_leader_election_enabled();
    let leader_handle = if leader_election_enabled {
        let leader_client = client.clone();
        let leader_config = LeaderConfig::from_env();
        let leader_state_clone = leader_state.clone();
        let leader_shutdown = shutdown_signal.clone();

        info!(holder_id = %leader_config.holder_id, "Leader election enabled");

        Some(tokio::spawn(async move {
            run_leader_election(
                leader_client,
                leader_config,
                leader_state_clone,
                leader_shutdown,
            )
            .await;
        }))
    } else {
        info!("Leader election disabled - running as single instance");
        leader_state.set_leader(true);
        None
    };

    let config = ControllerConfig::from_env();
    info!(default_validation_mode = ?config.default_validation_mode, "Controller configured");

    let ctx = if leader_election_enabled {
        Arc::new(Context::new_with_leader(
            client.clone(),
            Arc::new(SystemClock),
            config,
            leader_state.clone(),
            Some(metrics.clone()),
        ))
    } else {
        Arc::new(Context::new(
            client.clone(),
            Arc::new(SystemClock),
            config,
            Some(metrics.clone()),
        ))
    };

    let namespace = watch_namespace(std::env::var("EDS_WATCH_NAMESPACE").ok());
    match &namespace {
        Some(ns) => info!(namespace = %ns, "Watching a single namespace"),
        None => info!("Watching all namespaces"),
    }
    let namespace = namespace.as_deref();

    let metrics_pruner = tokio::spawn(eds::forget_deleted(
        scoped_api::<ExtendedDaemonSet>(&client, namespace),
        metrics.clone(),
    ));

    let eds_controller = Controller::new(
        scoped_api::<ExtendedDaemonSet>(&client, namespace),
        watcher::Config::default(),
    )
    .graceful_shutdown_on(shutdown_signal.triggered())
    .owns(
        scoped_api::<ExtendedDaemonSetReplicaSet>(&client, namespace),
        watcher::Config::default(),
    )
    .run(eds::reconcile, error_policy, ctx.clone())
    .for_each(|res| async move {
        if let Ok((object, _)) = res {
            debug!(eds = %object.name, "Reconciled");
        }
    });

    // Node and setting changes can move pods of any generation
    let ers_controller = Controller::new(
        scoped_api::<ExtendedDaemonSetReplicaSet>(&client, namespace),
        watcher::Config::default(),
    );
    let node_store = ers_controller.store();
    let setting_store = ers_controller.store();
    let ers_controller = ers_controller
        .graceful_shutdown_on(shutdown_signal.triggered())
        .owns(scoped_api::<Pod>(&client, namespace), watcher::Config::default())
        .watches(
            Api::<Node>::all(client.clone()),
            watcher::Config::default(),
            move |_: Node| all_replica_sets(&node_store),
        )
        .watches(
            scoped_api::<ExtendedDaemonsetSetting>(&client, namespace),
            watcher::Config::default(),
            move |_: ExtendedDaemonsetSetting| all_replica_sets(&setting_store),
        )
        .run(ers::reconcile, error_policy, ctx.clone())
        .for_each(|res| async move {
            if let Ok((object, _)) = res {
                debug!(replicaset = %object.name, "Reconciled");
            }
        });

    let setting_controller = Controller::new(
        scoped_api::<ExtendedDaemonsetSetting>(&client, namespace),
        watcher::Config::default(),
    )
    .graceful_shutdown_on(shutdown_signal.triggered())
    .run(setting::reconcile, error_policy, ctx.clone())
    .for_each(|res| async move {
        if let Ok((object, _)) = res {
            debug!(setting = %object.name, "Reconciled");
        }
    });

    let signal_readiness = readiness.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => info!(signal = signal, "Initiating graceful shutdown"),
            Err(e) => error!(error = %e, "Cannot listen for termination signals, shutting down"),
        }
        signal_readiness.set_not_ready();
        shutdown_trigger.trigger();
    });

    // Readiness means initialized, not leading: standbys report ready too
    readiness.set_ready();
    info!("Controller ready, starting reconciliation loops");

    // Each controller drains its in-flight reconciles before its stream ends
    futures::future::join3(eds_controller, ers_controller, setting_controller).await;
    info!("Controllers drained, stopping components");

    if let Some(handle) = leader_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Leader election task failed");
        }
    }
    metrics_pruner.abort();
    health_handle.abort();

    info!("ExtendedDaemonSet controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
