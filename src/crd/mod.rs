pub mod condition;
pub mod extended_daemon_set;
pub mod keys;
pub mod replica_set;
pub mod setting;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "extended_daemon_set_test.rs"]
mod extended_daemon_set_tests;
