//! Leader election over a coordination.k8s.io/v1 Lease
//!
//! All replicas run the controllers; only the lease holder reconciles.
//! Writes to the lease carry the resourceVersion that was read, so two
//! replicas racing for an expired lease cannot both win.

use crate::server::shutdown::ShutdownSignal;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_LEASE_NAME: &str = "extendeddaemonset-controller-leader";
pub const DEFAULT_LEASE_NAMESPACE: &str = "extendeddaemonset-system";

/// How long a lease stays valid without renewal
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

/// How often the holder renews, and how often others retry
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Whether this replica currently holds the lease
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    leader: Arc<AtomicBool>,
}

impl LeaderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Identity written to `holderIdentity`
    pub holder_id: String,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: i32,
    pub renew_interval: Duration,
}

impl LeaderConfig {
    /// Identity from `POD_NAME`, then `HOSTNAME`, then a random id;
    /// namespace from `POD_NAMESPACE`
    pub fn from_env() -> Self {
        let holder_id = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("extendeddaemonset-{}", uuid::Uuid::new_v4()));
        let lease_namespace = std::env::var("POD_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_LEASE_NAMESPACE.to_string());

        LeaderConfig {
            holder_id,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace,
            lease_duration_seconds: DEFAULT_LEASE_TTL.as_secs() as i32,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

/// Lease timestamps are RFC3339 with microseconds on the wire
pub fn micro_time(value: DateTime<Utc>) -> Option<MicroTime> {
    serde_json::from_value(serde_json::Value::String(
        value.to_rfc3339_opts(SecondsFormat::Micros, true),
    ))
    .ok()
}

fn micro_time_to_utc(value: &MicroTime) -> Option<DateTime<Utc>> {
    let raw = serde_json::to_value(value).ok()?;
    DateTime::parse_from_rfc3339(raw.as_str()?)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// A lease without renew time or duration counts as expired
pub fn is_lease_expired(
    renew_time: Option<&MicroTime>,
    lease_duration_seconds: Option<i32>,
    now: DateTime<Utc>,
) -> bool {
    match (renew_time.and_then(micro_time_to_utc), lease_duration_seconds) {
        (Some(renewed), Some(duration)) => {
            now > renewed + chrono::Duration::seconds(i64::from(duration))
        }
        _ => true,
    }
}

fn lease_spec(config: &LeaderConfig, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(config.holder_id.clone()),
        lease_duration_seconds: Some(config.lease_duration_seconds),
        acquire_time: micro_time(now),
        renew_time: micro_time(now),
        lease_transitions: Some(transitions),
        ..Default::default()
    }
}

/// One acquire-or-renew round; `Ok(true)` when this replica holds the lease
async fn try_acquire_or_renew(
    api: &Api<Lease>,
    config: &LeaderConfig,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let Some(existing) = api.get_opt(&config.lease_name).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(config.lease_name.clone()),
                namespace: Some(config.lease_namespace.clone()),
                ..Default::default()
            },
            spec: Some(lease_spec(config, now, 0)),
        };
        return match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(holder = %config.holder_id, "Created leader lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e),
        };
    };

    let spec = existing.spec.clone().unwrap_or_default();
    let held_by_us = spec.holder_identity.as_deref() == Some(config.holder_id.as_str());

    let mut updated = existing.clone();
    if held_by_us {
        updated.spec = Some(LeaseSpec {
            renew_time: micro_time(now),
            ..spec.clone()
        });
    } else if is_lease_expired(spec.renew_time.as_ref(), spec.lease_duration_seconds, now) {
        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        updated.spec = Some(lease_spec(config, now, transitions));
    } else {
        return Ok(false);
    }

    match api
        .replace(&config.lease_name, &PostParams::default(), &updated)
        .await
    {
        Ok(_) => {
            if !held_by_us {
                info!(
                    holder = %config.holder_id,
                    previous = spec.holder_identity.as_deref().unwrap_or_default(),
                    "Took over expired leader lease"
                );
            }
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(holder = %config.holder_id, "Lease changed concurrently");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Keep competing for the lease until shutdown
///
/// `state` flips as leadership is gained or lost. On an API error the
/// replica steps down rather than risk two leaders.
pub async fn run_leader_election(
    client: Client,
    config: LeaderConfig,
    state: LeaderState,
    mut shutdown: ShutdownSignal,
) {
    let api: Api<Lease> = Api::namespaced(client, &config.lease_namespace);
    info!(
        holder = %config.holder_id,
        lease = %config.lease_name,
        namespace = %config.lease_namespace,
        "Starting leader election"
    );

    loop {
        let leading = match try_acquire_or_renew(&api, &config).await {
            Ok(leading) => leading,
            Err(e) => {
                warn!(holder = %config.holder_id, error = %e, "Leader lease round failed");
                false
            }
        };

        if leading != state.is_leader() {
            if leading {
                info!(holder = %config.holder_id, "Became leader");
            } else {
                warn!(holder = %config.holder_id, "Lost leadership");
            }
            state.set_leader(leading);
        }

        tokio::select! {
            _ = tokio::time::sleep(config.renew_interval) => {}
            _ = shutdown.wait() => {
                state.set_leader(false);
                info!(holder = %config.holder_id, "Leader election stopped");
                return;
            }
        }
    }
}
