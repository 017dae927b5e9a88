use crate::cluster::PodInfo;
use crate::controller::log_sink::CommandExecutionStatus;
use crate::model::ResourceId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One rolling deployment attempt for a release name
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollingDeployRequest {
    pub release_name: String,
    pub namespace: String,
    /// Steady-state timeout
    pub timeout_minutes: u32,
    #[serde(default)]
    pub in_canary_workflow: bool,
    #[serde(default)]
    pub skip_resource_versioning: bool,
    #[serde(default)]
    pub skip_adding_track_selector_to_deployment: bool,
    #[serde(default)]
    pub pruning_enabled: bool,
    #[serde(default)]
    pub skip_dry_run: bool,
    #[serde(default)]
    pub use_native_status_check_api: bool,
}

impl RollingDeployRequest {
    pub fn new(release_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        RollingDeployRequest {
            release_name: release_name.into(),
            namespace: namespace.into(),
            timeout_minutes: 10,
            in_canary_workflow: false,
            skip_resource_versioning: false,
            skip_adding_track_selector_to_deployment: false,
            pruning_enabled: false,
            skip_dry_run: false,
            use_native_status_check_api: false,
        }
    }

    pub fn steady_state_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_minutes) * 60)
    }
}

/// Result of a successful attempt
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutResponse {
    pub release_number: u32,
    /// Pods of the release after steady state, tagged new or pre-existing
    pub pods: Vec<PodInfo>,
    /// Resources actually deleted by pruning
    pub pruned_resource_ids: Vec<ResourceId>,
    /// URL of the release's LoadBalancer Service, once the cloud assigned one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<String>,
    pub status: CommandExecutionStatus,
}

impl RolloutResponse {
    pub fn new_pods(&self) -> impl Iterator<Item = &PodInfo> {
        self.pods.iter().filter(|p| p.new_pod)
    }
}
