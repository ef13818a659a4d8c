pub mod actions;
pub mod clock;
pub mod conditions;
pub mod context;
pub mod eds;
pub mod ers;
pub mod fingerprint;
pub mod intent;
pub mod node;
pub mod pod;
pub mod pod_control;
pub mod retry;
pub mod setting;
pub mod settings;
pub mod strategies;
pub mod validation;

pub use context::{error_policy, Context, ControllerConfig, ReconcileError};
