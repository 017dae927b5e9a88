//! Prometheus metrics for rollout attempts

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Outcome label values
pub const OUTCOME_SUCCEEDED: &str = "succeeded";
pub const OUTCOME_FAILED: &str = "failed";

/// Counters and histograms for rollout attempts, on a private registry
#[derive(Clone)]
pub struct RolloutMetrics {
    registry: Registry,
    attempts: IntCounterVec,
    duration: Histogram,
    pruned: IntCounter,
}

impl RolloutMetrics {
    /// # Errors
    /// Fails if a metric cannot be registered (duplicate name).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let attempts = IntCounterVec::new(
            Opts::new("kroll_rollout_attempts_total", "Rollout attempts by outcome and stage"),
            &["outcome", "stage"],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "kroll_rollout_duration_seconds",
                "Wall-clock duration of rollout attempts",
            )
            .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0]),
        )?;
        let pruned = IntCounter::new(
            "kroll_pruned_resources_total",
            "Resources deleted by pruning",
        )?;

        registry.register(Box::new(attempts.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(pruned.clone()))?;

        Ok(RolloutMetrics {
            registry,
            attempts,
            duration,
            pruned,
        })
    }

    pub fn record_success(&self, duration_secs: f64, pruned: usize) {
        self.attempts
            .with_label_values(&[OUTCOME_SUCCEEDED, "Completed"])
            .inc();
        self.duration.observe(duration_secs);
        self.pruned.inc_by(pruned as u64);
    }

    pub fn record_failure(&self, stage: &str, duration_secs: f64) {
        self.attempts.with_label_values(&[OUTCOME_FAILED, stage]).inc();
        self.duration.observe(duration_secs);
    }

    pub fn attempts(&self, outcome: &str, stage: &str) -> u64 {
        self.attempts.with_label_values(&[outcome, stage]).get()
    }

    pub fn pruned(&self) -> u64 {
        self.pruned.get()
    }

    /// Text exposition format of every registered metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics (non-fatal)");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
