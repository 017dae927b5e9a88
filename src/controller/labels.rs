//! Release-name and track label injection
//!
//! Every managed workload's pod template gets the release-name label so pods
//! can be listed per release. Track labels (`stable`) are only stamped when a
//! canary/stable split has to be preserved; see
//! [`add_labels_in_deployment_selector`] for the precedence between the two
//! flags that control it.

use crate::cluster::{ClusterClient, ClusterError};
use crate::model::{Resource, ResourceId, WorkloadKind};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

pub const RELEASE_NAME_LABEL: &str = "kroll.io/release-name";
pub const TRACK_LABEL: &str = "kroll.io/track";
pub const TRACK_STABLE: &str = "stable";

fn single_label(key: &str, value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), value.to_string())])
}

/// Stamp the release-name label into each workload's pod template
pub fn add_release_label_to_pod_spec<'a>(
    workloads: impl IntoIterator<Item = &'a mut Resource>,
    release_name: &str,
) {
    let labels = single_label(RELEASE_NAME_LABEL, release_name);
    for workload in workloads {
        workload.add_labels_in_pod_spec(&labels);
    }
}

/// Stamp `track=stable` into each workload's pod template
pub fn add_track_label_to_pod_spec<'a>(workloads: impl IntoIterator<Item = &'a mut Resource>) {
    let labels = single_label(TRACK_LABEL, TRACK_STABLE);
    for workload in workloads {
        workload.add_labels_in_pod_spec(&labels);
    }
}

/// Stamp `track=stable` into the selector of Deployment-like workloads
///
/// Other kinds are skipped; their selectors are immutable once created.
pub fn add_track_label_to_selector<'a>(workloads: impl IntoIterator<Item = &'a mut Resource>) {
    let labels = single_label(TRACK_LABEL, TRACK_STABLE);
    for workload in workloads {
        let supported = workload
            .workload_kind()
            .is_some_and(|k| k.supports_selector_injection());
        if supported {
            workload.add_labels_in_deployment_selector(&labels);
        }
    }
}

/// Pod template labels for managed workloads
///
/// The release-name label is always added. The track label goes to every
/// managed workload in a canary workflow, otherwise only to the already-stable
/// Deployments when the stable selector must be preserved.
pub fn add_labels_in_managed_workload_pod_spec(
    resources: &mut [Resource],
    in_canary_workflow: bool,
    skip_adding_track_selector: bool,
    stable_deployments: &HashSet<ResourceId>,
    release_name: &str,
) {
    add_release_label_to_pod_spec(
        resources.iter_mut().filter(|r| r.is_managed_workload()),
        release_name,
    );

    if in_canary_workflow {
        add_track_label_to_pod_spec(resources.iter_mut().filter(|r| r.is_managed_workload()));
    } else if skip_adding_track_selector {
        add_track_label_to_pod_spec(
            resources
                .iter_mut()
                .filter(|r| stable_deployments.contains(&r.id)),
        );
    }
}

/// Selector labels for managed workloads
///
/// `skip_adding_track_selector` wins: when set, only the already-stable
/// Deployments are touched, whatever `in_canary_workflow` says. Otherwise the
/// whole managed set is touched in a canary workflow and nothing is touched
/// outside of one.
pub fn add_labels_in_deployment_selector(
    resources: &mut [Resource],
    in_canary_workflow: bool,
    skip_adding_track_selector: bool,
    stable_deployments: &HashSet<ResourceId>,
) {
    if skip_adding_track_selector {
        add_track_label_to_selector(
            resources
                .iter_mut()
                .filter(|r| stable_deployments.contains(&r.id)),
        );
    } else if in_canary_workflow {
        add_track_label_to_selector(resources.iter_mut().filter(|r| r.is_managed_workload()));
    }
}

/// Deployments whose live selector already carries `track=stable`
///
/// Queried right before injection so an existing canary/stable split is not
/// overwritten.
pub async fn deployments_with_stable_track_selector(
    cluster: &dyn ClusterClient,
    resources: &[Resource],
) -> Result<HashSet<ResourceId>, ClusterError> {
    let mut stable = HashSet::new();
    for resource in resources
        .iter()
        .filter(|r| r.workload_kind() == Some(WorkloadKind::Deployment))
    {
        if cluster
            .selector_contains(&resource.id, TRACK_LABEL, TRACK_STABLE)
            .await?
        {
            debug!(resource = %resource.id, "Deployment already has stable track selector");
            stable.insert(resource.id.clone());
        }
    }
    Ok(stable)
}
