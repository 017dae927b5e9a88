use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use super::ModelError;

/// Opt a resource out of pruning
pub const ANNOTATION_SKIP_PRUNING: &str = "kroll.io/skip-pruning";

/// Opt a ConfigMap/Secret out of content-hash versioning
pub const ANNOTATION_SKIP_VERSIONING: &str = "kroll.io/skip-versioning";

/// Mark a non-native kind as a workload tracked through its status conditions
pub const ANNOTATION_MANAGED_WORKLOAD: &str = "kroll.io/managed-workload";

/// Kinds that never live in a namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "APIService",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

/// Canonical identity of a cluster resource
///
/// Equality is structural over all four fields, so a `ResourceId` can be used
/// directly as a set or map key when diffing releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        ResourceId {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// API group, empty for the core group
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    pub fn version(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((_, version)) => version,
            None => &self.api_version,
        }
    }

    /// `kind/name` reference as used by kubectl
    pub fn kind_name_ref(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Workload kinds whose rollout the cluster tracks natively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    DeploymentConfig,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(WorkloadKind::Deployment),
            "DeploymentConfig" => Some(WorkloadKind::DeploymentConfig),
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "DaemonSet" => Some(WorkloadKind::DaemonSet),
            _ => None,
        }
    }

    /// Selectors are immutable after creation for everything except
    /// Deployment-like kinds.
    pub fn supports_selector_injection(&self) -> bool {
        matches!(
            self,
            WorkloadKind::Deployment | WorkloadKind::DeploymentConfig
        )
    }
}

/// A rendered manifest plus its identity and per-release flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: ResourceId,
    /// Position in the rendered manifest list; prune deletes in reverse of this
    #[serde(default)]
    pub apply_order: usize,
    #[serde(default)]
    pub skip_pruning: bool,
    #[serde(default)]
    pub versioned: bool,
    pub object: DynamicObject,
}

impl Resource {
    /// Build a resource from a parsed object
    ///
    /// # Errors
    /// Fails when `apiVersion`, `kind` or `metadata.name` are missing.
    pub fn from_object(object: DynamicObject, apply_order: usize) -> Result<Self, ModelError> {
        let types = object
            .types
            .as_ref()
            .ok_or(ModelError::MissingTypeMeta { index: apply_order })?;
        if types.kind.is_empty() || types.api_version.is_empty() {
            return Err(ModelError::MissingTypeMeta { index: apply_order });
        }
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| ModelError::MissingName {
                kind: types.kind.clone(),
                index: apply_order,
            })?;

        let id = ResourceId {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: object.metadata.namespace.clone(),
            name,
        };

        let skip_pruning = annotation_is_true(&object, ANNOTATION_SKIP_PRUNING);

        Ok(Resource {
            id,
            apply_order,
            skip_pruning,
            versioned: false,
            object,
        })
    }

    pub fn kind(&self) -> &str {
        &self.id.kind
    }

    pub fn workload_kind(&self) -> Option<WorkloadKind> {
        WorkloadKind::from_kind(&self.id.kind)
    }

    /// Natively versioned workload (Deployment, StatefulSet, ...)
    pub fn is_managed_workload(&self) -> bool {
        self.workload_kind().is_some()
    }

    /// CRD-based workload that opted in through the managed-workload annotation
    pub fn is_custom_workload(&self) -> bool {
        !self.is_managed_workload() && annotation_is_true(&self.object, ANNOTATION_MANAGED_WORKLOAD)
    }

    /// ConfigMaps and Secrets are versioned unless annotated otherwise
    pub fn is_versionable(&self) -> bool {
        matches!(self.id.kind.as_str(), "ConfigMap" | "Secret")
            && self.id.group().is_empty()
            && !annotation_is_true(&self.object, ANNOTATION_SKIP_VERSIONING)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.object
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub fn is_cluster_scoped(&self) -> bool {
        CLUSTER_SCOPED_KINDS.contains(&self.id.kind.as_str())
    }

    pub fn set_namespace_if_missing(&mut self, namespace: &str) {
        if self.is_cluster_scoped() || self.id.namespace.is_some() {
            return;
        }
        self.id.namespace = Some(namespace.to_string());
        self.object.metadata.namespace = Some(namespace.to_string());
    }

    /// Rename the resource, keeping identity and manifest in sync
    pub fn rename(&mut self, name: &str) {
        self.id.name = name.to_string();
        self.object.metadata.name = Some(name.to_string());
    }

    /// Pod template spec (`spec.template.spec`) if present
    pub fn pod_spec_mut(&mut self) -> Option<&mut Value> {
        self.object
            .data
            .get_mut("spec")
            .and_then(|spec| spec.get_mut("template"))
            .and_then(|template| template.get_mut("spec"))
    }

    pub fn pod_template_labels(&self) -> Option<BTreeMap<String, String>> {
        let labels = self
            .object
            .data
            .get("spec")?
            .get("template")?
            .get("metadata")?
            .get("labels")?
            .as_object()?;
        Some(string_map(labels))
    }

    /// Selector labels: `spec.selector.matchLabels`, or the plain map a
    /// DeploymentConfig uses.
    pub fn selector_labels(&self) -> Option<BTreeMap<String, String>> {
        let selector = self.object.data.get("spec")?.get("selector")?;
        let labels = match self.workload_kind() {
            Some(WorkloadKind::DeploymentConfig) => selector.as_object()?,
            _ => selector.get("matchLabels")?.as_object()?,
        };
        Some(string_map(labels))
    }

    /// Merge labels into `spec.template.metadata.labels`
    ///
    /// Returns false when the resource has no pod template to label.
    pub fn add_labels_in_pod_spec(&mut self, labels: &BTreeMap<String, String>) -> bool {
        if self.object.data.get("spec").and_then(|s| s.get("template")).is_none() {
            return false;
        }
        match ensure_map(&mut self.object.data, &["spec", "template", "metadata", "labels"]) {
            Some(target) => {
                merge_labels(target, labels);
                true
            }
            None => false,
        }
    }

    /// Merge labels into the workload selector (Deployment-like kinds only)
    pub fn add_labels_in_deployment_selector(&mut self, labels: &BTreeMap<String, String>) -> bool {
        let path: &[&str] = match self.workload_kind() {
            Some(WorkloadKind::Deployment) => &["spec", "selector", "matchLabels"],
            Some(WorkloadKind::DeploymentConfig) => &["spec", "selector"],
            _ => return false,
        };
        match ensure_map(&mut self.object.data, path) {
            Some(target) => {
                merge_labels(target, labels);
                true
            }
            None => false,
        }
    }
}

/// Parse rendered multi-document YAML into resources, in manifest order
///
/// Empty documents are skipped and do not consume an apply position.
pub fn parse_manifests(yaml: &str) -> Result<Vec<Resource>, ModelError> {
    use serde::Deserialize as _;

    let mut resources = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject = serde_yaml::from_value(value)?;
        let resource = Resource::from_object(object, resources.len())?;
        resources.push(resource);
    }
    Ok(resources)
}

/// Render resources for execution logs, with secret payloads redacted
pub fn to_yaml_for_logs(resources: &[Resource]) -> Result<String, ModelError> {
    let mut out = String::new();
    for resource in resources {
        let mut object = resource.object.clone();
        if resource.id.kind == "Secret" {
            for key in ["data", "stringData"] {
                if let Some(Value::Object(entries)) = object.data.get_mut(key) {
                    for value in entries.values_mut() {
                        *value = Value::String("***".to_string());
                    }
                }
            }
        }
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&object)?);
    }
    Ok(out)
}

/// Table of resources for execution logs
pub fn resources_table(resources: &[Resource]) -> String {
    let mut out = format!("\n{:<24}{:<40}{}", "Kind", "Name", "Versioned");
    for resource in resources {
        out.push_str(&format!(
            "\n{:<24}{:<40}{}",
            resource.id.kind, resource.id.name, resource.versioned
        ));
    }
    out
}

fn annotation_is_true(object: &DynamicObject, key: &str) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn string_map(map: &Map<String, Value>) -> BTreeMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
        .collect()
}

fn merge_labels(target: &mut Map<String, Value>, labels: &BTreeMap<String, String>) {
    for (key, value) in labels {
        target.insert(key.clone(), Value::String(value.clone()));
    }
}

/// Walk `path`, creating empty objects for missing segments
///
/// Returns None if an existing segment is not an object.
fn ensure_map<'a>(root: &'a mut Value, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
    if root.is_null() {
        *root = Value::Object(Map::new());
    }
    let mut current = root;
    for segment in path {
        let map = current.as_object_mut()?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
    }
    current.as_object_mut()
}
