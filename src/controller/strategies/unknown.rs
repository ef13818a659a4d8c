//! Retired generation
//!
//! A replica set that is neither active nor canary keeps its pods until the
//! active generation replaces them node by node. It never creates or deletes
//! pods itself; it only reports what it still runs so the ExtendedDaemonSet
//! controller knows when it can be garbage collected.

use super::{is_owned_by, ReplicaSetStrategy, StrategyError, StrategyParams, StrategyResult};
use crate::controller::clock::to_std_duration;
use crate::controller::pod::{is_pod_available, is_pod_ready};
use crate::crd::replica_set::ReplicaSetRole;

pub struct UnknownStrategy;

impl ReplicaSetStrategy for UnknownStrategy {
    fn name(&self) -> &'static str {
        "unknown"
    }

    fn plan(&self, params: StrategyParams<'_>) -> Result<StrategyResult, StrategyError> {
        let now = params.now;
        let mut status = params.status.clone();
        status.status = ReplicaSetRole::Unknown;

        let own_pods: Vec<_> = params
            .nodes
            .iter()
            .filter_map(|item| item.pod.as_ref())
            .filter(|pod| is_owned_by(pod, params.replica_set))
            .collect();

        status.desired = 0;
        status.current = own_pods.len() as i32;
        status.ready = own_pods.iter().filter(|p| is_pod_ready(p)).count() as i32;
        status.available = own_pods
            .iter()
            .filter(|p| is_pod_available(p, 0, now))
            .count() as i32;
        status.ignored_unresponsive_nodes = 0;

        let mut result = StrategyResult {
            status,
            ..Default::default()
        };
        if !own_pods.is_empty() {
            result.requeue(to_std_duration(params.policy.reconcile_frequency));
        }

        Ok(result)
    }
}
