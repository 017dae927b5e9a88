//! Cluster capability surface consumed by the rollout engine
//!
//! The engine never talks to the Kubernetes API directly. Everything it needs
//! (apply, dry-run, delete, rollout status, pod listing, revisions and the
//! release history blob) goes through [`ClusterClient`], so tests can swap in
//! an in-memory implementation.

pub mod kube_client;
#[cfg(test)]
pub mod mock;

pub use kube_client::KubeClusterClient;
#[cfg(test)]
pub use mock::MockClusterClient;

use crate::model::{Resource, ResourceId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Failed to convert resource: {0}")]
    SerializationError(String),

    #[error("{operation} failed for {resource}: {message}")]
    OperationFailed {
        operation: &'static str,
        resource: String,
        message: String,
    },
}

/// Rollout state reported for one workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutState {
    Ready,
    NotReady(String),
    Failed(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// A pod belonging to a release
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub release_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerInfo>,
    /// Set when the pod did not exist before this attempt's apply
    #[serde(default)]
    pub new_pod: bool,
}

/// Name of the ConfigMap holding the release history for a release name
pub fn release_history_object_name(release_name: &str) -> String {
    format!("kroll-release-{}", release_name)
}

/// Key inside the release history ConfigMap
pub const RELEASE_HISTORY_KEY: &str = "releaseHistory";

/// Operations the rollout engine needs from a cluster
///
/// Implementations must be safe to share across tasks; one deployment
/// attempt calls them serially.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Apply resources in the given order
    async fn apply(&self, resources: &[Resource]) -> Result<(), ClusterError>;

    /// Validate resources server-side without persisting them
    async fn dry_run(&self, resources: &[Resource]) -> Result<(), ClusterError>;

    /// Delete a single resource
    async fn delete(&self, resource_id: &ResourceId) -> Result<(), ClusterError>;

    /// Native rollout status of a managed workload
    async fn rollout_status(&self, resource_id: &ResourceId) -> Result<RolloutState, ClusterError>;

    /// Readiness of a CRD-based workload, read from its status conditions
    async fn custom_resource_status(
        &self,
        resource: &Resource,
    ) -> Result<RolloutState, ClusterError>;

    /// Pods in `namespace` carrying the release-name label
    async fn pods(&self, namespace: &str, release_name: &str) -> Result<Vec<PodInfo>, ClusterError>;

    /// Latest revision token the cluster records for a workload
    async fn latest_revision(&self, resource_id: &ResourceId)
        -> Result<Option<String>, ClusterError>;

    /// Whether the live object's selector carries `key=value`
    ///
    /// Returns false when the object does not exist yet.
    async fn selector_contains(
        &self,
        resource_id: &ResourceId,
        key: &str,
        value: &str,
    ) -> Result<bool, ClusterError>;

    /// Hostname or IP a cloud load balancer assigned to a Service
    ///
    /// Returns None while the ingress is still pending or the Service is gone.
    async fn load_balancer_ingress(&self, service: &ResourceId)
        -> Result<Option<String>, ClusterError>;

    /// Human-readable snapshot of the namespace, diagnostic only
    async fn describe(&self, namespace: &str) -> Result<String, ClusterError>;

    /// Load the persisted release history blob, if any
    async fn load_release_history(
        &self,
        namespace: &str,
        release_name: &str,
    ) -> Result<Option<String>, ClusterError>;

    /// Persist the release history blob
    async fn save_release_history(
        &self,
        namespace: &str,
        release_name: &str,
        data: &str,
    ) -> Result<(), ClusterError>;
}
