//! Process configuration from `KROLL_*` environment variables

use crate::controller::rolling::{RollingDeployRequest, DEFAULT_ATTEMPT_GRACE, DEFAULT_POLL_INTERVAL};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Everything the binary needs for one rollout attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub release_name: String,
    pub namespace: String,
    pub manifest_path: PathBuf,
    pub timeout_minutes: u32,
    pub poll_interval: Duration,
    pub attempt_grace: Duration,
    pub in_canary_workflow: bool,
    pub skip_resource_versioning: bool,
    pub skip_adding_track_selector_to_deployment: bool,
    pub pruning_enabled: bool,
    pub skip_dry_run: bool,
    pub use_native_status_check_api: bool,
    /// HTTP endpoint for execution log records; tracing only when unset
    pub log_sink_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };
        let flag = |key: &str| lookup(key).map(|v| v == "true" || v == "1").unwrap_or(false);
        let number = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key) {
                None => Ok(default),
                Some(value) => value
                    .parse()
                    .map_err(|_| ConfigError::Invalid { key, value }),
            }
        };

        let timeout_minutes = number("KROLL_TIMEOUT_MINUTES", 10)?;
        let timeout_minutes = u32::try_from(timeout_minutes).map_err(|_| ConfigError::Invalid {
            key: "KROLL_TIMEOUT_MINUTES",
            value: timeout_minutes.to_string(),
        })?;

        Ok(Config {
            release_name: required("KROLL_RELEASE_NAME")?,
            namespace: lookup("KROLL_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            manifest_path: PathBuf::from(required("KROLL_MANIFEST_PATH")?),
            timeout_minutes,
            poll_interval: Duration::from_secs(number(
                "KROLL_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL.as_secs(),
            )?),
            attempt_grace: Duration::from_secs(number(
                "KROLL_ATTEMPT_GRACE_SECS",
                DEFAULT_ATTEMPT_GRACE.as_secs(),
            )?),
            in_canary_workflow: flag("KROLL_CANARY"),
            skip_resource_versioning: flag("KROLL_SKIP_VERSIONING"),
            skip_adding_track_selector_to_deployment: flag("KROLL_SKIP_TRACK_SELECTOR"),
            pruning_enabled: flag("KROLL_PRUNING"),
            skip_dry_run: flag("KROLL_SKIP_DRY_RUN"),
            use_native_status_check_api: flag("KROLL_NATIVE_STATUS_CHECK"),
            log_sink_url: lookup("KROLL_LOG_SINK_URL").filter(|v| !v.is_empty()),
        })
    }

    pub fn to_request(&self) -> RollingDeployRequest {
        RollingDeployRequest {
            release_name: self.release_name.clone(),
            namespace: self.namespace.clone(),
            timeout_minutes: self.timeout_minutes,
            in_canary_workflow: self.in_canary_workflow,
            skip_resource_versioning: self.skip_resource_versioning,
            skip_adding_track_selector_to_deployment: self.skip_adding_track_selector_to_deployment,
            pruning_enabled: self.pruning_enabled,
            skip_dry_run: self.skip_dry_run,
            use_native_status_check_api: self.use_native_status_check_api,
        }
    }
}
