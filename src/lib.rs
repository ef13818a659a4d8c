//! ExtendedDaemonSet controller
//!
//! Runs one daemon pod per eligible node with canary analysis, slow-start
//! admission and operator-driven pause/freeze of rollouts.

pub mod controller;
pub mod crd;
pub mod server;
