use super::{
    release_history_object_name, ClusterClient, ClusterError, ContainerInfo, PodInfo,
    RolloutState, RELEASE_HISTORY_KEY,
};
use crate::controller::labels::RELEASE_NAME_LABEL;
use crate::model::{Resource, ResourceId, WorkloadKind};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{self, Scope};
use kube::{Client, ResourceExt};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kroll";

const DEPLOYMENT_REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Label put on the release history ConfigMap
const RELEASE_HISTORY_LABEL: &str = "kroll.io/release-history";

/// [`ClusterClient`] backed by kube-rs
///
/// Arbitrary manifests are applied as `DynamicObject`s with server-side apply;
/// the API resource for each kind is resolved through discovery.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        KubeClusterClient { client }
    }

    async fn dynamic_api(&self, id: &ResourceId) -> Result<Api<DynamicObject>, ClusterError> {
        let gvk = GroupVersionKind::gvk(id.group(), id.version(), &id.kind);
        let (resource, capabilities) = discovery::pinned_kind(&self.client, &gvk).await?;
        let api = match (capabilities.scope, id.namespace.as_deref()) {
            (Scope::Namespaced, Some(namespace)) => {
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &resource),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
        };
        Ok(api)
    }

    async fn patch_all(&self, resources: &[Resource], dry_run: bool) -> Result<(), ClusterError> {
        let operation = if dry_run { "dry-run" } else { "apply" };
        let mut params = PatchParams::apply(FIELD_MANAGER).force();
        if dry_run {
            params = params.dry_run();
        }

        for resource in resources {
            let api = self.dynamic_api(&resource.id).await?;
            api.patch(&resource.id.name, &params, &Patch::Apply(&resource.object))
                .await
                .map_err(|e| ClusterError::OperationFailed {
                    operation,
                    resource: resource.id.to_string(),
                    message: e.to_string(),
                })?;
            debug!(resource = %resource.id, operation, "Resource patched");
        }
        Ok(())
    }

    fn namespace_of(id: &ResourceId) -> Result<&str, ClusterError> {
        id.namespace
            .as_deref()
            .ok_or_else(|| ClusterError::NotFound(format!("{} has no namespace", id)))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn apply(&self, resources: &[Resource]) -> Result<(), ClusterError> {
        self.patch_all(resources, false).await
    }

    async fn dry_run(&self, resources: &[Resource]) -> Result<(), ClusterError> {
        self.patch_all(resources, true).await
    }

    async fn delete(&self, resource_id: &ResourceId) -> Result<(), ClusterError> {
        let api = self.dynamic_api(resource_id).await?;
        match api.delete(&resource_id.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(ClusterError::NotFound(resource_id.to_string()))
            }
            Err(e) => Err(ClusterError::KubeError(e)),
        }
    }

    async fn rollout_status(&self, resource_id: &ResourceId) -> Result<RolloutState, ClusterError> {
        let namespace = Self::namespace_of(resource_id)?;
        let name = &resource_id.name;
        let state = match WorkloadKind::from_kind(&resource_id.kind) {
            Some(WorkloadKind::Deployment) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                deployment_state(&api.get(name).await?)
            }
            Some(WorkloadKind::StatefulSet) => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                statefulset_state(&api.get(name).await?)
            }
            Some(WorkloadKind::DaemonSet) => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
                daemonset_state(&api.get(name).await?)
            }
            Some(WorkloadKind::DeploymentConfig) | None => {
                let api = self.dynamic_api(resource_id).await?;
                let object = api.get(name).await?;
                conditions_state(object.data.get("status"))
            }
        };
        Ok(state)
    }

    async fn custom_resource_status(
        &self,
        resource: &Resource,
    ) -> Result<RolloutState, ClusterError> {
        let api = self.dynamic_api(&resource.id).await?;
        let object = api.get(&resource.id.name).await?;
        Ok(conditions_state(object.data.get("status")))
    }

    async fn pods(&self, namespace: &str, release_name: &str) -> Result<Vec<PodInfo>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{}={}", RELEASE_NAME_LABEL, release_name);
        let pods = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(pods
            .items
            .iter()
            .map(|pod| pod_info(pod, namespace, release_name))
            .collect())
    }

    async fn latest_revision(
        &self,
        resource_id: &ResourceId,
    ) -> Result<Option<String>, ClusterError> {
        let namespace = Self::namespace_of(resource_id)?;
        let name = &resource_id.name;
        let revision = match WorkloadKind::from_kind(&resource_id.kind) {
            Some(WorkloadKind::Deployment) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.get(name)
                    .await?
                    .annotations()
                    .get(DEPLOYMENT_REVISION_ANNOTATION)
                    .cloned()
            }
            Some(WorkloadKind::StatefulSet) => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.get(name)
                    .await?
                    .status
                    .and_then(|s| s.update_revision.or(s.current_revision))
            }
            Some(WorkloadKind::DaemonSet) => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
                api.get(name)
                    .await?
                    .status
                    .and_then(|s| s.observed_generation)
                    .map(|g| g.to_string())
            }
            Some(WorkloadKind::DeploymentConfig) => {
                let api = self.dynamic_api(resource_id).await?;
                let object = api.get(name).await?;
                object
                    .data
                    .get("status")
                    .and_then(|s| s.get("latestVersion"))
                    .map(|v| v.to_string())
            }
            None => None,
        };
        Ok(revision)
    }

    async fn selector_contains(
        &self,
        resource_id: &ResourceId,
        key: &str,
        value: &str,
    ) -> Result<bool, ClusterError> {
        let api = self.dynamic_api(resource_id).await?;
        let Some(object) = api.get_opt(&resource_id.name).await? else {
            return Ok(false);
        };
        let selector = object.data.get("spec").and_then(|s| s.get("selector"));
        let found = selector
            .and_then(|s| s.get("matchLabels").or(Some(s)))
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
            == Some(value);
        Ok(found)
    }

    async fn load_balancer_ingress(
        &self,
        service: &ResourceId,
    ) -> Result<Option<String>, ClusterError> {
        let namespace = Self::namespace_of(service)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let Some(live) = api.get_opt(&service.name).await? else {
            debug!(service = %service, "Service not found while resolving load balancer");
            return Ok(None);
        };
        Ok(service_ingress_host(&live))
    }

    async fn describe(&self, namespace: &str) -> Result<String, ClusterError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let mut out = format!("Namespace: {}\n", namespace);
        for deployment in deployments.list(&ListParams::default()).await?.items {
            let status = deployment.status.clone().unwrap_or_default();
            out.push_str(&format!(
                "Deployment {} ready {}/{}\n",
                deployment.name_any(),
                status.ready_replicas.unwrap_or(0),
                status.replicas.unwrap_or(0)
            ));
        }
        for pod in pods.list(&ListParams::default()).await?.items {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            out.push_str(&format!("Pod {} {}\n", pod.name_any(), phase));
        }
        Ok(out)
    }

    async fn load_release_history(
        &self,
        namespace: &str,
        release_name: &str,
    ) -> Result<Option<String>, ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = release_history_object_name(release_name);
        let data = api
            .get_opt(&name)
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(RELEASE_HISTORY_KEY));
        debug!(config_map = %name, found = data.is_some(), "Loaded release history");
        Ok(data)
    }

    async fn save_release_history(
        &self,
        namespace: &str,
        release_name: &str,
        data: &str,
    ) -> Result<(), ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = release_history_object_name(release_name);
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    RELEASE_HISTORY_LABEL.to_string(),
                    release_name.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                RELEASE_HISTORY_KEY.to_string(),
                data.to_string(),
            )])),
            ..Default::default()
        };

        let mut value = serde_json::to_value(&config_map)
            .map_err(|e| ClusterError::SerializationError(e.to_string()))?;
        value["apiVersion"] = Value::String("v1".to_string());
        value["kind"] = Value::String("ConfigMap".to_string());

        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&value),
        )
        .await?;
        info!(config_map = %name, namespace = %namespace, "Release history saved");
        Ok(())
    }
}

fn pod_info(pod: &Pod, namespace: &str, release_name: &str) -> PodInfo {
    PodInfo {
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        name: pod.name_any(),
        namespace: pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string()),
        release_name: release_name.to_string(),
        pod_ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
        containers: pod
            .spec
            .as_ref()
            .map(|spec| {
                spec.containers
                    .iter()
                    .map(|c| ContainerInfo {
                        name: c.name.clone(),
                        image: c.image.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        new_pod: false,
    }
}

/// Rollout state of a Deployment, following `kubectl rollout status`
/// First non-empty hostname, else IP, from `status.loadBalancer.ingress`
pub fn service_ingress_host(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| {
            ingress
                .hostname
                .clone()
                .filter(|h| !h.is_empty())
                .or_else(|| ingress.ip.clone().filter(|ip| !ip.is_empty()))
        })
}

pub fn deployment_state(deployment: &Deployment) -> RolloutState {
    let Some(status) = deployment.status.as_ref() else {
        return RolloutState::NotReady("deployment has no status yet".to_string());
    };

    if deployment.metadata.generation > status.observed_generation {
        return RolloutState::NotReady(
            "waiting for deployment spec update to be observed".to_string(),
        );
    }

    let deadline_exceeded = status.conditions.as_ref().is_some_and(|conditions| {
        conditions.iter().any(|c| {
            c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
        })
    });
    if deadline_exceeded {
        return RolloutState::Failed(format!(
            "deployment {} exceeded its progress deadline",
            deployment.name_any()
        ));
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    if updated < desired {
        return RolloutState::NotReady(format!(
            "{} out of {} new replicas have been updated",
            updated, desired
        ));
    }
    if total > updated {
        return RolloutState::NotReady(format!(
            "{} old replicas are pending termination",
            total - updated
        ));
    }
    if available < updated {
        return RolloutState::NotReady(format!(
            "{} of {} updated replicas are available",
            available, updated
        ));
    }
    RolloutState::Ready
}

/// Rollout state of a StatefulSet
pub fn statefulset_state(statefulset: &StatefulSet) -> RolloutState {
    let Some(status) = statefulset.status.as_ref() else {
        return RolloutState::NotReady("statefulset has no status yet".to_string());
    };

    let on_delete = statefulset
        .spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.type_.as_deref())
        == Some("OnDelete");
    if on_delete {
        return RolloutState::Ready;
    }

    if statefulset.metadata.generation > status.observed_generation {
        return RolloutState::NotReady(
            "waiting for statefulset spec update to be observed".to_string(),
        );
    }

    let desired = statefulset
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = status.ready_replicas.unwrap_or(0);
    if ready < desired {
        return RolloutState::NotReady(format!("{} of {} pods are ready", ready, desired));
    }

    if status.update_revision.is_some() && status.update_revision != status.current_revision {
        return RolloutState::NotReady(format!(
            "{} pods at revision {:?}",
            status.updated_replicas.unwrap_or(0),
            status.update_revision
        ));
    }
    RolloutState::Ready
}

/// Rollout state of a DaemonSet
pub fn daemonset_state(daemonset: &DaemonSet) -> RolloutState {
    let Some(status) = daemonset.status.as_ref() else {
        return RolloutState::NotReady("daemonset has no status yet".to_string());
    };

    if daemonset.metadata.generation > status.observed_generation {
        return RolloutState::NotReady(
            "waiting for daemonset spec update to be observed".to_string(),
        );
    }

    let desired = status.desired_number_scheduled;
    let updated = status.updated_number_scheduled.unwrap_or(0);
    let available = status.number_available.unwrap_or(0);
    if updated < desired {
        return RolloutState::NotReady(format!(
            "{} out of {} new pods have been updated",
            updated, desired
        ));
    }
    if available < desired {
        return RolloutState::NotReady(format!(
            "{} of {} updated pods are available",
            available, desired
        ));
    }
    RolloutState::Ready
}

/// Readiness from generic `status.conditions` / `status.phase` conventions
///
/// `Failed`/`Stalled`/`Degraded` conditions that are True are terminal;
/// a True `Ready` or `Available` condition means ready.
pub fn conditions_state(status: Option<&Value>) -> RolloutState {
    let Some(status) = status else {
        return RolloutState::NotReady("resource has no status yet".to_string());
    };

    if let Some(conditions) = status.get("conditions").and_then(Value::as_array) {
        let condition_true = |kind: &str| {
            conditions.iter().find(|c| {
                c.get("type").and_then(Value::as_str) == Some(kind)
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        };

        for failure in ["Failed", "Stalled", "Degraded"] {
            if let Some(condition) = condition_true(failure) {
                let message = condition
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or(failure);
                return RolloutState::Failed(message.to_string());
            }
        }
        if condition_true("Ready").is_some() || condition_true("Available").is_some() {
            return RolloutState::Ready;
        }
    }

    match status.get("phase").and_then(Value::as_str) {
        Some("Ready" | "Running" | "Succeeded" | "Healthy" | "Completed") => RolloutState::Ready,
        Some(phase @ ("Failed" | "Error" | "Degraded")) => {
            warn!(phase, "Custom workload reported a terminal phase");
            RolloutState::Failed(format!("resource phase is {}", phase))
        }
        Some(phase) => RolloutState::NotReady(format!("resource phase is {}", phase)),
        None => RolloutState::NotReady("waiting for Ready condition".to_string()),
    }
}
