//! Steady-state waiting and pod inventory
//!
//! Polls applied workloads until every one reports ready, one reports a
//! terminal failure, the deadline passes or the attempt is cancelled. Native
//! workloads are checked first, custom workloads after they pass.

use crate::cluster::{ClusterClient, ClusterError, PodInfo, RolloutState};
use crate::model::{Resource, ResourceId};
use crate::server::shutdown::CancelSignal;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("{resource} failed to reach steady state: {reason}")]
    WorkloadFailed { resource: String, reason: String },

    #[error("timed out after {timeout:?} waiting for steady state, still pending: {pending}")]
    Timeout { timeout: Duration, pending: String },

    #[error("steady-state wait cancelled")]
    Cancelled,

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// How native workloads are polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCheckMode {
    /// Every pending workload is polled on each round
    Batch,
    /// Workloads are waited on one after another, in manifest order
    Sequential,
}

impl StatusCheckMode {
    pub fn from_native_api_flag(use_native_status_check_api: bool) -> Self {
        if use_native_status_check_api {
            StatusCheckMode::Batch
        } else {
            StatusCheckMode::Sequential
        }
    }
}

enum Target<'r> {
    Native(&'r ResourceId),
    Custom(&'r Resource),
}

impl Target<'_> {
    fn id(&self) -> &ResourceId {
        match self {
            Target::Native(id) => id,
            Target::Custom(resource) => &resource.id,
        }
    }
}

pub struct SteadyStateWaiter<'a> {
    cluster: &'a dyn ClusterClient,
    poll_interval: Duration,
    mode: StatusCheckMode,
    cancel: CancelSignal,
}

impl<'a> SteadyStateWaiter<'a> {
    pub fn new(
        cluster: &'a dyn ClusterClient,
        poll_interval: Duration,
        mode: StatusCheckMode,
        cancel: CancelSignal,
    ) -> Self {
        SteadyStateWaiter {
            cluster,
            poll_interval,
            mode,
            cancel,
        }
    }

    /// Block until all workloads are ready or the wait fails
    ///
    /// With no workloads at all this returns immediately without touching the
    /// cluster.
    pub async fn wait_for_steady_state(
        &self,
        workloads: &[ResourceId],
        custom_workloads: &[Resource],
        timeout: Duration,
    ) -> Result<(), WaitError> {
        if workloads.is_empty() && custom_workloads.is_empty() {
            info!("No managed workload, skipping status check");
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let native: Vec<Target<'_>> = workloads.iter().map(Target::Native).collect();

        match self.mode {
            StatusCheckMode::Batch => self.poll(native, deadline, timeout).await?,
            StatusCheckMode::Sequential => {
                for target in native {
                    self.poll(vec![target], deadline, timeout).await?;
                }
            }
        }
        info!(workloads = workloads.len(), "Managed workloads reached steady state");

        if !custom_workloads.is_empty() {
            let custom: Vec<Target<'_>> = custom_workloads.iter().map(Target::Custom).collect();
            self.poll(custom, deadline, timeout).await?;
            info!(
                workloads = custom_workloads.len(),
                "Custom workloads reached steady state"
            );
        }
        Ok(())
    }

    async fn check(&self, target: &Target<'_>) -> Result<RolloutState, ClusterError> {
        match target {
            Target::Native(id) => self.cluster.rollout_status(id).await,
            Target::Custom(resource) => self.cluster.custom_resource_status(resource).await,
        }
    }

    async fn poll(
        &self,
        mut pending: Vec<Target<'_>>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        let mut cancel = self.cancel.clone();
        loop {
            let mut still_pending = Vec::with_capacity(pending.len());
            for target in pending {
                match self.check(&target).await? {
                    RolloutState::Ready => {
                        debug!(resource = %target.id(), "Workload ready");
                    }
                    RolloutState::NotReady(reason) => {
                        debug!(resource = %target.id(), reason = %reason, "Workload not ready yet");
                        still_pending.push(target);
                    }
                    RolloutState::Failed(reason) => {
                        warn!(resource = %target.id(), reason = %reason, "Workload failed");
                        return Err(WaitError::WorkloadFailed {
                            resource: target.id().to_string(),
                            reason,
                        });
                    }
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                let pending = pending
                    .iter()
                    .map(|t| t.id().kind_name_ref())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(WaitError::Timeout { timeout, pending });
            }

            let sleep_until = (Instant::now() + self.poll_interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(sleep_until) => {}
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            }
        }
    }
}

/// Distinct namespaces of the given workloads, in first-seen order
pub fn workload_namespaces<'r>(workloads: impl IntoIterator<Item = &'r Resource>) -> Vec<String> {
    let mut seen = HashSet::new();
    workloads
        .into_iter()
        .filter_map(|w| w.id.namespace.clone())
        .filter(|ns| seen.insert(ns.clone()))
        .collect()
}

/// Pods carrying the release-name label across all workload namespaces
pub async fn get_pods(
    cluster: &dyn ClusterClient,
    namespaces: &[String],
    release_name: &str,
) -> Result<Vec<PodInfo>, ClusterError> {
    let mut pods = Vec::new();
    for namespace in namespaces {
        pods.extend(cluster.pods(namespace, release_name).await?);
    }
    Ok(pods)
}

/// Mark pods absent from the pre-apply inventory as new
pub fn tag_new_pods(current: Vec<PodInfo>, existing: &[PodInfo]) -> Vec<PodInfo> {
    let known: HashSet<(&str, &str)> = existing
        .iter()
        .map(|p| (p.uid.as_str(), p.name.as_str()))
        .collect();
    current
        .into_iter()
        .map(|mut pod| {
            pod.new_pod = !known.contains(&(pod.uid.as_str(), pod.name.as_str()));
            pod
        })
        .collect()
}

#[cfg(test)]
#[path = "steady_state_test.rs"]
mod tests;
