//! Resource versioning
//!
//! Config-like resources (ConfigMaps, Secrets) get a content-hash suffix so a
//! config change produces a new object name and the workloads that mount it
//! roll. Workload revisions are read back from the cluster after apply and
//! refreshed once the wait is over.

use crate::cluster::{ClusterClient, ClusterError};
use crate::model::{Release, Resource, ResourceId};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum VersioningError {
    #[error("Failed to hash {resource}: {source}")]
    Hash {
        resource: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Flag every versionable resource
pub fn mark_versioned_resources(resources: &mut [Resource]) {
    for resource in resources.iter_mut() {
        resource.versioned = resource.is_versionable();
    }
}

/// Compute a deterministic content hash for a ConfigMap or Secret payload
///
/// FNV-1a over the JSON encoding of `data`, `binaryData`, `stringData` and
/// `type`; returns 10 hex characters.
pub fn compute_content_hash(resource: &Resource) -> Result<String, VersioningError> {
    let data = &resource.object.data;
    let payload = json!({
        "data": data.get("data"),
        "binaryData": data.get("binaryData"),
        "stringData": data.get("stringData"),
        "type": data.get("type"),
    });
    let encoded = serde_json::to_string(&payload).map_err(|source| VersioningError::Hash {
        resource: resource.id.to_string(),
        source,
    })?;

    // FNV-1a (deterministic across processes, unlike DefaultHasher/SipHash)
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in encoded.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }

    Ok(format!("{hash:016x}")[..10].to_string())
}

/// Key of a rename: namespace, kind and original name
type RenameKey = (Option<String>, String, String);

/// Append a content-hash suffix to versioned resources and rewrite references
///
/// Returns the original identity and new name of every renamed resource.
/// Running it twice on the same resources is a no-op the second time.
pub fn add_revision_suffix(
    resources: &mut [Resource],
) -> Result<Vec<(ResourceId, String)>, VersioningError> {
    let mut renames: HashMap<RenameKey, String> = HashMap::new();
    let mut renamed = Vec::new();

    for resource in resources.iter_mut().filter(|r| r.versioned) {
        let hash = compute_content_hash(resource)?;
        let suffix = format!("-{}", hash);
        if resource.id.name.ends_with(&suffix) {
            continue;
        }
        let original = resource.id.clone();
        let new_name = format!("{}{}", original.name, suffix);
        resource.rename(&new_name);
        debug!(resource = %original, new_name = %new_name, "Versioned resource renamed");

        renames.insert(
            (
                original.namespace.clone(),
                original.kind.clone(),
                original.name.clone(),
            ),
            new_name.clone(),
        );
        renamed.push((original, new_name));
    }

    if renames.is_empty() {
        return Ok(renamed);
    }

    for resource in resources.iter_mut() {
        let namespace = resource.id.namespace.clone();
        if let Some(pod_spec) = resource.pod_spec_mut() {
            let config_maps = names_for(&renames, &namespace, "ConfigMap");
            let secrets = names_for(&renames, &namespace, "Secret");
            rewrite_pod_spec_references(pod_spec, &config_maps, &secrets);
        }
    }

    info!(count = renamed.len(), "Added revision suffix to versioned resources");
    Ok(renamed)
}

fn names_for(
    renames: &HashMap<RenameKey, String>,
    namespace: &Option<String>,
    kind: &str,
) -> HashMap<String, String> {
    renames
        .iter()
        .filter(|((ns, k, _), _)| ns == namespace && k == kind)
        .map(|((_, _, name), new_name)| (name.clone(), new_name.clone()))
        .collect()
}

/// Rewrite ConfigMap/Secret references inside a pod spec
pub fn rewrite_pod_spec_references(
    pod_spec: &mut Value,
    config_maps: &HashMap<String, String>,
    secrets: &HashMap<String, String>,
) {
    if let Some(volumes) = pod_spec.get_mut("volumes").and_then(Value::as_array_mut) {
        for volume in volumes {
            rename_field(volume.get_mut("configMap"), "name", config_maps);
            rename_field(volume.get_mut("secret"), "secretName", secrets);
            if let Some(sources) = volume
                .get_mut("projected")
                .and_then(|p| p.get_mut("sources"))
                .and_then(Value::as_array_mut)
            {
                for source in sources {
                    rename_field(source.get_mut("configMap"), "name", config_maps);
                    rename_field(source.get_mut("secret"), "name", secrets);
                }
            }
        }
    }

    for containers in ["containers", "initContainers"] {
        let Some(containers) = pod_spec.get_mut(containers).and_then(Value::as_array_mut) else {
            continue;
        };
        for container in containers {
            if let Some(env_from) = container.get_mut("envFrom").and_then(Value::as_array_mut) {
                for source in env_from {
                    rename_field(source.get_mut("configMapRef"), "name", config_maps);
                    rename_field(source.get_mut("secretRef"), "name", secrets);
                }
            }
            if let Some(env) = container.get_mut("env").and_then(Value::as_array_mut) {
                for var in env {
                    let Some(value_from) = var.get_mut("valueFrom") else {
                        continue;
                    };
                    rename_field(value_from.get_mut("configMapKeyRef"), "name", config_maps);
                    rename_field(value_from.get_mut("secretKeyRef"), "name", secrets);
                }
            }
        }
    }

    if let Some(pull_secrets) = pod_spec
        .get_mut("imagePullSecrets")
        .and_then(Value::as_array_mut)
    {
        for pull_secret in pull_secrets {
            rename_field(Some(pull_secret), "name", secrets);
        }
    }
}

fn rename_field(target: Option<&mut Value>, field: &str, renames: &HashMap<String, String>) {
    let Some(slot) = target.and_then(|t| t.get_mut(field)) else {
        return;
    };
    let new_name = slot.as_str().and_then(|name| renames.get(name)).cloned();
    if let Some(new_name) = new_name {
        *slot = Value::String(new_name);
    }
}

/// Record the managed workloads of a release with their current cluster revision
///
/// Lookup failures propagate; the caller aborts the step.
pub async fn capture_managed_workload_revisions(
    cluster: &dyn ClusterClient,
    release: &mut Release,
    workloads: &[&Resource],
) -> Result<(), ClusterError> {
    let mut revisions = Vec::with_capacity(workloads.len());
    for workload in workloads {
        let revision = cluster.latest_revision(&workload.id).await?;
        revisions.push(crate::model::ManagedWorkloadRevision {
            workload: workload.id.clone(),
            revision,
        });
    }
    release.managed_workloads = revisions;
    Ok(())
}

/// Re-read the revision of every managed workload already on the release
pub async fn refresh_managed_workload_revisions(
    cluster: &dyn ClusterClient,
    release: &mut Release,
) -> Result<(), ClusterError> {
    for entry in release.managed_workloads.iter_mut() {
        entry.revision = cluster.latest_revision(&entry.workload).await?;
    }
    debug!(
        release = release.number,
        workloads = release.managed_workloads.len(),
        "Managed workload revisions refreshed"
    );
    Ok(())
}
