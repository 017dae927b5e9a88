//! Process-level plumbing around a rollout attempt
//!
//! - `shutdown`: cancellation channel and SIGTERM/SIGINT handling
//! - `metrics`: prometheus counters for attempt outcomes

pub mod metrics;
pub mod shutdown;

pub use metrics::RolloutMetrics;
pub use shutdown::{cancel_channel, cancel_on, wait_for_signal, CancelHandle, CancelSignal};

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
