//! Pruning of resources dropped between releases
//!
//! The baseline is the previous rollback-eligible release: the newest older
//! release that succeeded and kept full resource snapshots. Anything in that
//! baseline and absent from the current release is deleted in reverse apply
//! order. Delete failures are logged and skipped.

use super::log_sink::UnitLog;
use crate::cluster::ClusterClient;
use crate::model::{Release, ReleaseHistory, Resource, ResourceId};
use std::collections::HashSet;
use tracing::{info, warn};

/// Resources of `previous` that are gone from `current`, in deletion order
///
/// Resources flagged `skip_pruning` are never candidates. Returns an empty
/// list when there is no previous release.
pub fn resources_to_be_pruned_in_order(
    previous: Option<&Release>,
    current: &Release,
) -> Vec<Resource> {
    let Some(previous) = previous else {
        return Vec::new();
    };

    let current_ids: HashSet<&ResourceId> = current
        .resources
        .iter()
        .chain(current.resources_with_spec.iter().map(|r| &r.id))
        .collect();

    let mut stale: Vec<Resource> = previous
        .resources_with_spec
        .iter()
        .filter(|r| !r.skip_pruning && !current_ids.contains(&r.id))
        .cloned()
        .collect();

    stale.sort_by(|a, b| b.apply_order.cmp(&a.apply_order));
    stale
}

/// Delete each resource independently
///
/// A failed delete is logged and does not stop the remaining ones. Returns
/// only the resources that were actually deleted.
pub async fn delete_handling_partial_execution(
    cluster: &dyn ClusterClient,
    resource_ids: &[ResourceId],
    log: &UnitLog,
) -> Vec<ResourceId> {
    let mut deleted = Vec::with_capacity(resource_ids.len());
    for id in resource_ids {
        match cluster.delete(id).await {
            Ok(()) => {
                log.info(&format!("Deleted {}", id)).await;
                deleted.push(id.clone());
            }
            Err(e) => {
                warn!(resource = %id, error = %e, "Failed to delete resource (non-fatal)");
                log.warn(&format!("Failed to delete {}: {}", id, e)).await;
            }
        }
    }
    deleted
}

/// Prune resources left over from the previous rollback-eligible release
///
/// Never fails: a missing baseline or nothing to prune are normal outcomes.
pub async fn prune(
    cluster: &dyn ClusterClient,
    history: &ReleaseHistory,
    current_number: u32,
    log: &UnitLog,
) -> Vec<ResourceId> {
    let Some(current) = history.release(current_number) else {
        log.success("No current release recorded, so no pruning required")
            .await;
        return Vec::new();
    };

    let previous = history.previous_rollback_eligible_release(current_number);
    let Some(previous) = previous else {
        let message = if history.previous_successful_release(current_number).is_some() {
            "Previous successful deployment executed with pruning disabled, Pruning can't be done"
        } else {
            "No previous successful deployment found, So no pruning required"
        };
        log.success(message).await;
        return Vec::new();
    };

    let to_prune = resources_to_be_pruned_in_order(Some(previous), current);
    if to_prune.is_empty() {
        log.success(&format!(
            "No resource is eligible to be pruned from last successful release: {}, So no pruning required",
            previous.number
        ))
        .await;
        return Vec::new();
    }

    let ids: Vec<ResourceId> = to_prune.into_iter().map(|r| r.id).collect();
    log.info(&format!(
        "Pruning {} resource(s) from release {}",
        ids.len(),
        previous.number
    ))
    .await;

    let deleted = delete_handling_partial_execution(cluster, &ids, log).await;
    info!(
        release = current_number,
        baseline = previous.number,
        attempted = ids.len(),
        deleted = deleted.len(),
        "Pruning step completed"
    );
    log.success("Pruning step completed").await;
    deleted
}

#[cfg(test)]
#[path = "prune_test.rs"]
mod tests;
