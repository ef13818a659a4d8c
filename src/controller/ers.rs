//! ExtendedDaemonSetReplicaSet reconciliation
//!
//! One pass maps the generation's pods onto its desired nodes, lets the
//! strategy of the replica set's role plan creations and deletions, and
//! executes the plan through `PodControl`.

pub mod filters;
pub mod pods;
pub mod reconcile;

pub use reconcile::{
    execute_plan, full_sync_wait, owner_name, plan_pass, reconcile, replica_set_role, PassInput,
    PassOutcome, PassPlan, CONTROLLER_NAME,
};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "ers_test.rs"]
mod tests;
