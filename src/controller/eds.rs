//! ExtendedDaemonSet reconciliation
//!
//! Decides which generation serves the fleet, creates a generation for each
//! new template and arbitrates between the active generation and an
//! in-flight canary. Pods are left to the replica set controller.

pub mod canary_nodes;
pub mod podtemplate;
pub mod reconcile;
pub mod selection;
pub mod state;

pub use reconcile::{
    forget_deleted, new_replica_set, plan_eds, reconcile, status_patch, EdsInput, EdsPlan,
    EdsUpdate, CONTROLLER_NAME,
};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "eds_test.rs"]
mod tests;
