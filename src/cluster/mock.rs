//! In-memory cluster for tests
//!
//! Records every call and answers from scripted state. Rollout states are
//! consumed front to back per workload; the last scripted state sticks, and
//! workloads with nothing scripted report `Ready`.

#![allow(clippy::unwrap_used)]

use super::{ClusterClient, ClusterError, PodInfo, RolloutState};
use crate::model::{Resource, ResourceId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    applied: Vec<Vec<ResourceId>>,
    dry_runs: usize,
    deleted: Vec<ResourceId>,
    delete_attempts: Vec<ResourceId>,
    failing_deletes: HashSet<ResourceId>,
    rollout_states: HashMap<ResourceId, VecDeque<RolloutState>>,
    custom_states: HashMap<ResourceId, VecDeque<RolloutState>>,
    status_calls: usize,
    status_error: Option<String>,
    revisions: HashMap<ResourceId, String>,
    revision_calls: usize,
    stable_selectors: HashSet<ResourceId>,
    existing_pods: Vec<PodInfo>,
    pods_after_apply: Option<Vec<PodInfo>>,
    histories: HashMap<(String, String), String>,
    saves: Vec<String>,
    fail_dry_run: bool,
    fail_apply: bool,
    fail_save: bool,
    describes: usize,
    load_balancers: HashMap<ResourceId, String>,
}

#[derive(Default)]
pub struct MockClusterClient {
    state: Mutex<MockState>,
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_rollout(&self, id: &ResourceId, states: Vec<RolloutState>) {
        self.state
            .lock()
            .unwrap()
            .rollout_states
            .insert(id.clone(), states.into());
    }

    pub fn script_custom(&self, id: &ResourceId, states: Vec<RolloutState>) {
        self.state
            .lock()
            .unwrap()
            .custom_states
            .insert(id.clone(), states.into());
    }

    /// Make every status call fail with a cluster error
    pub fn fail_status_checks(&self, message: &str) {
        self.state.lock().unwrap().status_error = Some(message.to_string());
    }

    pub fn fail_delete(&self, id: &ResourceId) {
        self.state.lock().unwrap().failing_deletes.insert(id.clone());
    }

    pub fn fail_dry_run(&self) {
        self.state.lock().unwrap().fail_dry_run = true;
    }

    pub fn fail_apply(&self) {
        self.state.lock().unwrap().fail_apply = true;
    }

    pub fn fail_save(&self) {
        self.state.lock().unwrap().fail_save = true;
    }

    pub fn set_revision(&self, id: &ResourceId, revision: &str) {
        self.state
            .lock()
            .unwrap()
            .revisions
            .insert(id.clone(), revision.to_string());
    }

    pub fn set_stable_selector(&self, id: &ResourceId) {
        self.state.lock().unwrap().stable_selectors.insert(id.clone());
    }

    pub fn set_load_balancer(&self, service: &ResourceId, host: &str) {
        self.state
            .lock()
            .unwrap()
            .load_balancers
            .insert(service.clone(), host.to_string());
    }

    pub fn set_existing_pods(&self, pods: Vec<PodInfo>) {
        self.state.lock().unwrap().existing_pods = pods;
    }

    /// Pods reported once the first apply has happened
    pub fn set_pods_after_apply(&self, pods: Vec<PodInfo>) {
        self.state.lock().unwrap().pods_after_apply = Some(pods);
    }

    pub fn set_history(&self, namespace: &str, release_name: &str, data: &str) {
        self.state.lock().unwrap().histories.insert(
            (namespace.to_string(), release_name.to_string()),
            data.to_string(),
        );
    }

    pub fn history(&self, namespace: &str, release_name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .histories
            .get(&(namespace.to_string(), release_name.to_string()))
            .cloned()
    }

    pub fn applied(&self) -> Vec<Vec<ResourceId>> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn dry_runs(&self) -> usize {
        self.state.lock().unwrap().dry_runs
    }

    pub fn deleted(&self) -> Vec<ResourceId> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn delete_attempts(&self) -> Vec<ResourceId> {
        self.state.lock().unwrap().delete_attempts.clone()
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }

    pub fn revision_calls(&self) -> usize {
        self.state.lock().unwrap().revision_calls
    }

    pub fn saves(&self) -> Vec<String> {
        self.state.lock().unwrap().saves.clone()
    }

    pub fn describes(&self) -> usize {
        self.state.lock().unwrap().describes
    }

    fn next_state(
        queue: Option<&mut VecDeque<RolloutState>>,
    ) -> RolloutState {
        match queue {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(RolloutState::Ready),
            None => RolloutState::Ready,
        }
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn apply(&self, resources: &[Resource]) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_apply {
            return Err(ClusterError::OperationFailed {
                operation: "apply",
                resource: resources
                    .first()
                    .map(|r| r.id.to_string())
                    .unwrap_or_default(),
                message: "admission webhook denied the request".to_string(),
            });
        }
        state
            .applied
            .push(resources.iter().map(|r| r.id.clone()).collect());
        Ok(())
    }

    async fn dry_run(&self, resources: &[Resource]) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.dry_runs += 1;
        if state.fail_dry_run {
            return Err(ClusterError::OperationFailed {
                operation: "dry-run",
                resource: resources
                    .first()
                    .map(|r| r.id.to_string())
                    .unwrap_or_default(),
                message: "spec.replicas: Invalid value".to_string(),
            });
        }
        Ok(())
    }

    async fn delete(&self, resource_id: &ResourceId) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.delete_attempts.push(resource_id.clone());
        if state.failing_deletes.contains(resource_id) {
            return Err(ClusterError::OperationFailed {
                operation: "delete",
                resource: resource_id.to_string(),
                message: "forbidden".to_string(),
            });
        }
        state.deleted.push(resource_id.clone());
        Ok(())
    }

    async fn rollout_status(&self, resource_id: &ResourceId) -> Result<RolloutState, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        if let Some(message) = state.status_error.clone() {
            return Err(ClusterError::OperationFailed {
                operation: "rollout status",
                resource: resource_id.to_string(),
                message,
            });
        }
        Ok(Self::next_state(state.rollout_states.get_mut(resource_id)))
    }

    async fn custom_resource_status(
        &self,
        resource: &Resource,
    ) -> Result<RolloutState, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        if let Some(message) = state.status_error.clone() {
            return Err(ClusterError::OperationFailed {
                operation: "status check",
                resource: resource.id.to_string(),
                message,
            });
        }
        Ok(Self::next_state(state.custom_states.get_mut(&resource.id)))
    }

    async fn pods(&self, namespace: &str, release_name: &str) -> Result<Vec<PodInfo>, ClusterError> {
        let state = self.state.lock().unwrap();
        let pods = match (&state.pods_after_apply, state.applied.is_empty()) {
            (Some(after), false) => after,
            _ => &state.existing_pods,
        };
        Ok(pods
            .iter()
            .filter(|p| p.namespace == namespace && p.release_name == release_name)
            .cloned()
            .collect())
    }

    async fn latest_revision(
        &self,
        resource_id: &ResourceId,
    ) -> Result<Option<String>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.revision_calls += 1;
        Ok(Some(
            state
                .revisions
                .get(resource_id)
                .cloned()
                .unwrap_or_else(|| "1".to_string()),
        ))
    }

    async fn selector_contains(
        &self,
        resource_id: &ResourceId,
        _key: &str,
        _value: &str,
    ) -> Result<bool, ClusterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .stable_selectors
            .contains(resource_id))
    }

    async fn load_balancer_ingress(
        &self,
        service: &ResourceId,
    ) -> Result<Option<String>, ClusterError> {
        Ok(self.state.lock().unwrap().load_balancers.get(service).cloned())
    }

    async fn describe(&self, namespace: &str) -> Result<String, ClusterError> {
        self.state.lock().unwrap().describes += 1;
        Ok(format!("Namespace: {}\n", namespace))
    }

    async fn load_release_history(
        &self,
        namespace: &str,
        release_name: &str,
    ) -> Result<Option<String>, ClusterError> {
        Ok(self.history(namespace, release_name))
    }

    async fn save_release_history(
        &self,
        namespace: &str,
        release_name: &str,
        data: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_save {
            return Err(ClusterError::OperationFailed {
                operation: "save",
                resource: release_name.to_string(),
                message: "conflict".to_string(),
            });
        }
        state.saves.push(data.to_string());
        state.histories.insert(
            (namespace.to_string(), release_name.to_string()),
            data.to_string(),
        );
        Ok(())
    }
}
