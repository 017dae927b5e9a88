//! Rollout engine
//!
//! `rolling` drives an attempt through its stages; the other modules are the
//! steps it sequences.

pub mod clock;
pub mod endpoint;
pub mod labels;
pub mod log_sink;
pub mod manifests;
pub mod prune;
pub mod rolling;
pub mod steady_state;
pub mod versioning;

pub use rolling::{
    Context, RollingDeployRequest, RollingDeployer, RolloutError, RolloutFailure, RolloutResponse,
    Stage,
};
