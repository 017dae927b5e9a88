use super::{validate_request, RollingDeployRequest, RolloutResponse};
use crate::cluster::{ClusterClient, ClusterError, PodInfo};
use crate::controller::clock::Clock;
use crate::controller::endpoint::load_balancer_endpoint;
use crate::controller::labels::{
    add_labels_in_deployment_selector, add_labels_in_managed_workload_pod_spec,
    deployments_with_stable_track_selector,
};
use crate::controller::log_sink::{CommandExecutionStatus, CommandUnit, ExecutionLogSink, UnitLog};
use crate::controller::manifests::{ManifestError, ManifestSource};
use crate::controller::prune::{delete_handling_partial_execution, prune};
use crate::controller::steady_state::{
    get_pods, tag_new_pods, workload_namespaces, StatusCheckMode, SteadyStateWaiter, WaitError,
};
use crate::controller::versioning::{
    add_revision_suffix, capture_managed_workload_revisions, mark_versioned_resources,
    refresh_managed_workload_revisions, VersioningError,
};
use crate::model::resource::{resources_table, to_yaml_for_logs};
use crate::model::{ModelError, ReleaseHistory, ReleaseStatus, Resource, ResourceId};
use crate::server::{CancelSignal, RolloutMetrics};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default delay between steady-state polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default slack on top of the steady-state timeout for the whole attempt
pub const DEFAULT_ATTEMPT_GRACE: Duration = Duration::from_secs(300);

/// State of the rollout state machine an attempt was in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Prepare,
    Apply,
    WaitSteadyState,
    Prune,
    WrapUp,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "Init",
            Stage::Prepare => "Prepare",
            Stage::Apply => "Apply",
            Stage::WaitSteadyState => "WaitSteadyState",
            Stage::Prune => "Prune",
            Stage::WrapUp => "WrapUp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Failed to load manifests: {0}")]
    Manifests(#[from] ManifestError),

    #[error("Invalid release history: {0}")]
    History(#[from] ModelError),

    #[error("Dry run failed: {0}")]
    DryRun(#[source] ClusterError),

    #[error("Cluster operation failed: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Versioning failed: {0}")]
    Versioning(#[from] VersioningError),

    #[error("Steady state check failed: {0}")]
    Wait(#[from] WaitError),

    #[error("Canary workflow for {0} requires an existing release")]
    MissingCanaryRelease(String),

    #[error("Release {0} disappeared from the release history")]
    MissingRelease(u32),

    #[error("No release assigned to this attempt yet")]
    Unassigned,

    #[error("Rollout cancelled")]
    Cancelled,

    #[error("Rollout exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

/// Error returned to the caller of a failed attempt
#[derive(Debug, Error)]
#[error("rollout failed during {stage}{}", release_suffix(.release_number))]
pub struct RolloutFailure {
    pub stage: Stage,
    /// Release the attempt was recording, if it got that far
    pub release_number: Option<u32>,
    #[source]
    pub error: RolloutError,
}

fn release_suffix(release_number: &Option<u32>) -> String {
    match release_number {
        Some(number) => format!(" (release {})", number),
        None => String::new(),
    }
}

/// Collaborators of the rollout engine
pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub manifests: Arc<dyn ManifestSource>,
    pub log_sink: Arc<dyn ExecutionLogSink>,
    pub clock: Arc<dyn Clock>,
    /// When Some, records attempt outcomes for Prometheus
    pub metrics: Option<RolloutMetrics>,
    pub poll_interval: Duration,
    pub attempt_grace: Duration,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        manifests: Arc<dyn ManifestSource>,
        log_sink: Arc<dyn ExecutionLogSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Context {
            cluster,
            manifests,
            log_sink,
            clock,
            metrics: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            attempt_grace: DEFAULT_ATTEMPT_GRACE,
        }
    }

    pub fn with_metrics(mut self, metrics: RolloutMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_attempt_grace(mut self, attempt_grace: Duration) -> Self {
        self.attempt_grace = attempt_grace;
        self
    }
}

#[derive(Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Deadline {
            at: Instant::now() + budget,
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// Mutable state of one attempt
///
/// Lives outside the stage futures so the failure path can still read
/// `should_save_release_history` after a stage was abandoned.
struct Attempt {
    id: Uuid,
    stage: Stage,
    deadline: Deadline,
    history: ReleaseHistory,
    release_number: Option<u32>,
    should_save_release_history: bool,
    resources: Vec<Resource>,
    existing_pods: Vec<PodInfo>,
}

impl Attempt {
    fn new(budget: Duration) -> Self {
        Attempt {
            id: Uuid::new_v4(),
            stage: Stage::Init,
            deadline: Deadline::after(budget),
            history: ReleaseHistory::new(),
            release_number: None,
            should_save_release_history: false,
            resources: Vec::new(),
            existing_pods: Vec::new(),
        }
    }

    fn number(&self) -> Result<u32, RolloutError> {
        self.release_number.ok_or(RolloutError::Unassigned)
    }

    fn managed_workloads(&self) -> Vec<&Resource> {
        self.resources
            .iter()
            .filter(|r| r.is_managed_workload())
            .collect()
    }

    fn custom_workloads(&self) -> Vec<Resource> {
        self.resources
            .iter()
            .filter(|r| r.is_custom_workload())
            .cloned()
            .collect()
    }

    fn workload_namespaces(&self) -> Vec<String> {
        workload_namespaces(
            self.resources
                .iter()
                .filter(|r| r.is_managed_workload() || r.is_custom_workload()),
        )
    }
}

/// Run `operation` unless the deadline passes or the attempt is cancelled first
async fn guarded<T, E, F>(
    deadline: Deadline,
    cancel: &mut CancelSignal,
    operation: F,
) -> Result<T, RolloutError>
where
    F: Future<Output = Result<T, E>>,
    RolloutError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RolloutError::Cancelled),
        result = tokio::time::timeout_at(deadline.at, operation) => match result {
            Ok(result) => result.map_err(RolloutError::from),
            Err(_) => Err(RolloutError::DeadlineExceeded(deadline.budget)),
        },
    }
}

/// Close the unit as failed when a stage errors
async fn close_on_error<T>(
    log: &UnitLog,
    result: Result<T, RolloutError>,
) -> Result<T, RolloutError> {
    if let Err(e) = &result {
        log.failure(&e.to_string()).await;
    }
    result
}

/// Rolling deployment of rendered manifests for one release name
///
/// Sequences Init, Prepare, Apply, WaitSteadyState, Prune and WrapUp. Once
/// apply has been attempted, the release history is persisted with a
/// terminal status on every exit path.
pub struct RollingDeployer {
    ctx: Context,
}

impl RollingDeployer {
    pub fn new(ctx: Context) -> Self {
        RollingDeployer { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Run one attempt to completion
    ///
    /// # Errors
    /// Returns a `RolloutFailure` naming the stage that failed. If apply had
    /// been reached, the release is persisted as `Failed` before returning.
    pub async fn deploy(
        &self,
        request: &RollingDeployRequest,
        cancel: CancelSignal,
    ) -> Result<RolloutResponse, RolloutFailure> {
        let started = std::time::Instant::now();

        if let Err(message) = validate_request(request) {
            warn!(release = %request.release_name, error = %message, "Rejected rollout request");
            return Err(RolloutFailure {
                stage: Stage::Init,
                release_number: None,
                error: RolloutError::Validation(message),
            });
        }

        let mut cancel = cancel;
        let mut attempt = Attempt::new(request.steady_state_timeout() + self.ctx.attempt_grace);
        info!(
            release = %request.release_name,
            namespace = %request.namespace,
            attempt_id = %attempt.id,
            canary = request.in_canary_workflow,
            pruning = request.pruning_enabled,
            "Starting rolling deployment"
        );

        let result = match self.run(request, &mut attempt, &mut cancel).await {
            Ok(response) => self.finalize_success(request, &mut attempt, response).await,
            Err(e) => Err(e),
        };

        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(response) => {
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_success(elapsed, response.pruned_resource_ids.len());
                }
                info!(
                    release = %request.release_name,
                    number = response.release_number,
                    pods = response.pods.len(),
                    pruned = response.pruned_resource_ids.len(),
                    "Rolling deployment succeeded"
                );
                Ok(response)
            }
            Err(error) => {
                self.handle_failure(request, &mut attempt).await;
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_failure(&attempt.stage.to_string(), elapsed);
                }
                error!(
                    release = %request.release_name,
                    number = ?attempt.release_number,
                    stage = %attempt.stage,
                    error = %error,
                    "Rolling deployment failed"
                );
                Err(RolloutFailure {
                    stage: attempt.stage,
                    release_number: attempt.release_number,
                    error,
                })
            }
        }
    }

    fn unit_log(&self, attempt: &Attempt, request: &RollingDeployRequest, unit: CommandUnit) -> UnitLog {
        UnitLog::new(
            self.ctx.log_sink.clone(),
            self.ctx.clock.clone(),
            attempt.id,
            &request.release_name,
            unit,
        )
    }

    fn enter(attempt: &mut Attempt, stage: Stage, cancel: &CancelSignal) -> Result<(), RolloutError> {
        attempt.stage = stage;
        if cancel.is_cancelled() {
            return Err(RolloutError::Cancelled);
        }
        debug!(attempt_id = %attempt.id, stage = %stage, "Entering stage");
        Ok(())
    }

    async fn run(
        &self,
        request: &RollingDeployRequest,
        attempt: &mut Attempt,
        cancel: &mut CancelSignal,
    ) -> Result<RolloutResponse, RolloutError> {
        Self::enter(attempt, Stage::Init, cancel)?;
        let log = self.unit_log(attempt, request, CommandUnit::Init);
        let result = self.init(request, attempt, cancel, &log).await;
        close_on_error(&log, result).await?;

        Self::enter(attempt, Stage::Prepare, cancel)?;
        let log = self.unit_log(attempt, request, CommandUnit::Prepare);
        let result = self.prepare(request, attempt, &log).await;
        close_on_error(&log, result).await?;

        Self::enter(attempt, Stage::Apply, cancel)?;
        let log = self.unit_log(attempt, request, CommandUnit::Apply);
        let result = self.apply(request, attempt, cancel, &log).await;
        close_on_error(&log, result).await?;

        Self::enter(attempt, Stage::WaitSteadyState, cancel)?;
        let log = self.unit_log(attempt, request, CommandUnit::WaitForSteadyState);
        let result = self.wait_for_steady_state(request, attempt, cancel, &log).await;
        close_on_error(&log, result).await?;

        let pruned_resource_ids = if request.pruning_enabled {
            Self::enter(attempt, Stage::Prune, cancel)?;
            let log = self.unit_log(attempt, request, CommandUnit::Prune);
            let result = self.prune(attempt, cancel, &log).await;
            close_on_error(&log, result).await?
        } else {
            Vec::new()
        };

        Self::enter(attempt, Stage::WrapUp, cancel)?;
        let log = self.unit_log(attempt, request, CommandUnit::WrapUp);
        let result = self.wrap_up(request, attempt, &log).await;
        let (pods, load_balancer) = close_on_error(&log, result).await?;

        Ok(RolloutResponse {
            release_number: attempt.number()?,
            pods,
            pruned_resource_ids,
            load_balancer,
            status: CommandExecutionStatus::Success,
        })
    }

    async fn init(
        &self,
        request: &RollingDeployRequest,
        attempt: &mut Attempt,
        cancel: &mut CancelSignal,
        log: &UnitLog,
    ) -> Result<(), RolloutError> {
        log.info("Initializing..").await;
        log.info(&format!("Release Name: [{}]", request.release_name))
            .await;

        let blob = guarded(
            attempt.deadline,
            cancel,
            self.ctx
                .cluster
                .load_release_history(&request.namespace, &request.release_name),
        )
        .await?;
        attempt.history = ReleaseHistory::from_yaml(blob.as_deref().unwrap_or_default())?;

        let mut resources = self.ctx.manifests.resources().await?;
        for resource in resources.iter_mut() {
            resource.set_namespace_if_missing(&request.namespace);
        }
        log.info("Manifests [Post template rendering] :").await;
        log.info(&to_yaml_for_logs(&resources)?).await;
        attempt.resources = resources;

        if request.skip_dry_run {
            log.info("Skipping Dry Run").await;
            log.success("Done.").await;
            return Ok(());
        }

        log.info("Validating manifests with Dry Run").await;
        let cluster = &self.ctx.cluster;
        let resources = &attempt.resources;
        guarded(attempt.deadline, cancel, async move {
            cluster
                .dry_run(resources)
                .await
                .map_err(RolloutError::DryRun)
        })
        .await?;
        log.success("Done.").await;
        Ok(())
    }

    async fn prepare(
        &self,
        request: &RollingDeployRequest,
        attempt: &mut Attempt,
        log: &UnitLog,
    ) -> Result<(), RolloutError> {
        let has_managed = attempt.resources.iter().any(|r| r.is_managed_workload());
        if has_managed && !request.skip_resource_versioning {
            mark_versioned_resources(&mut attempt.resources);
        }
        log.info(&format!(
            "Manifests processed. Found following resources: {}",
            resources_table(&attempt.resources)
        ))
        .await;

        let workloads: Vec<Resource> = attempt
            .resources
            .iter()
            .filter(|r| r.is_managed_workload() || r.is_custom_workload())
            .cloned()
            .collect();
        if workloads.is_empty() {
            log.info("No Managed Workload found.").await;
        } else {
            log.info(&format!(
                "Found following Managed Workloads: {}",
                resources_table(&workloads)
            ))
            .await;

            if !request.skip_resource_versioning {
                log.info("Versioning resources.").await;
                add_revision_suffix(&mut attempt.resources)?;
            }

            let stable = if request.skip_adding_track_selector_to_deployment {
                deployments_with_stable_track_selector(
                    self.ctx.cluster.as_ref(),
                    &attempt.resources,
                )
                .await?
            } else {
                HashSet::new()
            };
            add_labels_in_managed_workload_pod_spec(
                &mut attempt.resources,
                request.in_canary_workflow,
                request.skip_adding_track_selector_to_deployment,
                &stable,
                &request.release_name,
            );
            add_labels_in_deployment_selector(
                &mut attempt.resources,
                request.in_canary_workflow,
                request.skip_adding_track_selector_to_deployment,
                &stable,
            );
        }

        // The release snapshot is taken from the final, labelled and renamed resources
        let now = self.ctx.clock.now();
        let number = if request.in_canary_workflow {
            let release = attempt
                .history
                .latest_release_mut()
                .ok_or_else(|| RolloutError::MissingCanaryRelease(request.release_name.clone()))?;
            release.set_resources(&attempt.resources);
            if request.pruning_enabled {
                release.set_resources_with_spec(&attempt.resources);
            }
            release.number
        } else if request.pruning_enabled {
            attempt
                .history
                .create_new_release_with_resource_map(&attempt.resources, now)?
                .number
        } else {
            let release = attempt.history.create_new_release(Vec::new(), now)?;
            release.set_resources(&attempt.resources);
            release.number
        };
        attempt.release_number = Some(number);
        log.info(&format!("Current release number is: {}", number))
            .await;

        let stale = attempt.history.cleanup(number);
        if !stale.is_empty() {
            log.info(&format!(
                "Cleaning up {} versioned resource(s) from older releases",
                stale.len()
            ))
            .await;
            delete_handling_partial_execution(self.ctx.cluster.as_ref(), &stale, log).await;
        }

        log.success("Done.").await;
        Ok(())
    }

    async fn apply(
        &self,
        request: &RollingDeployRequest,
        attempt: &mut Attempt,
        cancel: &mut CancelSignal,
        log: &UnitLog,
    ) -> Result<(), RolloutError> {
        let cluster = self.ctx.cluster.as_ref();
        let namespaces = attempt.workload_namespaces();

        log.info("Fetching existing pod list.").await;
        attempt.existing_pods = get_pods(cluster, &namespaces, &request.release_name).await?;

        attempt.should_save_release_history = true;
        log.info("Applying manifests").await;
        guarded(attempt.deadline, cancel, cluster.apply(&attempt.resources)).await?;

        let number = attempt.number()?;
        let managed: Vec<Resource> = attempt.managed_workloads().into_iter().cloned().collect();
        let custom = attempt.custom_workloads();
        if !managed.is_empty() || !custom.is_empty() {
            let release = attempt
                .history
                .release_mut(number)
                .ok_or(RolloutError::MissingRelease(number))?;
            let managed: Vec<&Resource> = managed.iter().collect();
            capture_managed_workload_revisions(cluster, release, &managed).await?;
            release.custom_workloads = custom;
            self.save_history(request, &attempt.history).await?;
        }

        log.success("Done.").await;
        Ok(())
    }

    async fn wait_for_steady_state(
        &self,
        request: &RollingDeployRequest,
        attempt: &mut Attempt,
        cancel: &mut CancelSignal,
        log: &UnitLog,
    ) -> Result<(), RolloutError> {
        let cluster = self.ctx.cluster.as_ref();
        let workload_ids: Vec<ResourceId> = attempt
            .managed_workloads()
            .into_iter()
            .map(|r| r.id.clone())
            .collect();
        let custom = attempt.custom_workloads();

        if workload_ids.is_empty() && custom.is_empty() {
            log.success("Skipping Status Check since there is no Managed Workload.")
                .await;
            return Ok(());
        }

        log.info(&format!(
            "Waiting for {} workload(s) to reach steady state",
            workload_ids.len() + custom.len()
        ))
        .await;
        let waiter = SteadyStateWaiter::new(
            cluster,
            self.ctx.poll_interval,
            StatusCheckMode::from_native_api_flag(request.use_native_status_check_api),
            cancel.clone(),
        );
        let timeout = request
            .steady_state_timeout()
            .min(attempt.deadline.remaining());
        let wait_result = guarded(
            attempt.deadline,
            cancel,
            waiter.wait_for_steady_state(&workload_ids, &custom, timeout),
        )
        .await;

        // Revisions are read again whether or not the wait succeeded
        let number = attempt.number()?;
        let refresh_result = match attempt.history.release_mut(number) {
            Some(release) => refresh_managed_workload_revisions(cluster, release)
                .await
                .map_err(RolloutError::from),
            None => Err(RolloutError::MissingRelease(number)),
        };

        if let Err(wait_error) = wait_result {
            if let Err(refresh_error) = &refresh_result {
                warn!(error = %refresh_error, "Failed to refresh workload revisions after failed wait");
            }
            return Err(wait_error);
        }
        refresh_result?;

        log.success("Done.").await;
        Ok(())
    }

    async fn prune(
        &self,
        attempt: &mut Attempt,
        cancel: &mut CancelSignal,
        log: &UnitLog,
    ) -> Result<Vec<ResourceId>, RolloutError> {
        let number = attempt.number()?;
        let cluster = self.ctx.cluster.as_ref();
        let history = &attempt.history;
        guarded(attempt.deadline, cancel, async move {
            Ok::<_, RolloutError>(prune(cluster, history, number, log).await)
        })
        .await
    }

    async fn wrap_up(
        &self,
        request: &RollingDeployRequest,
        attempt: &mut Attempt,
        log: &UnitLog,
    ) -> Result<(Vec<PodInfo>, Option<String>), RolloutError> {
        let cluster = self.ctx.cluster.as_ref();
        log.info("Wrapping up..").await;

        match cluster.describe(&request.namespace).await {
            Ok(description) => log.info(&description).await,
            Err(e) => warn!(error = %e, namespace = %request.namespace, "Failed to describe namespace (non-fatal)"),
        }

        let pods = get_pods(cluster, &attempt.workload_namespaces(), &request.release_name).await?;
        let pods = tag_new_pods(pods, &attempt.existing_pods);
        let new_pods = pods.iter().filter(|p| p.new_pod).count();

        let load_balancer = match load_balancer_endpoint(cluster, &attempt.resources).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "Failed to resolve load balancer endpoint (non-fatal)");
                None
            }
        };
        if let Some(endpoint) = &load_balancer {
            log.info(&format!("Load Balancer Endpoint: {}", endpoint)).await;
        }

        log.success(&format!(
            "Found {} pod(s) for release, {} new",
            pods.len(),
            new_pods
        ))
        .await;
        Ok((pods, load_balancer))
    }

    async fn finalize_success(
        &self,
        request: &RollingDeployRequest,
        attempt: &mut Attempt,
        response: RolloutResponse,
    ) -> Result<RolloutResponse, RolloutError> {
        attempt.history.set_release_status(ReleaseStatus::Succeeded);
        self.save_history(request, &attempt.history).await?;
        Ok(response)
    }

    /// Persist a `Failed` release, but only once apply was attempted
    async fn handle_failure(&self, request: &RollingDeployRequest, attempt: &mut Attempt) {
        if !attempt.should_save_release_history {
            debug!(release = %request.release_name, "Failure before apply, release history untouched");
            return;
        }

        attempt.history.set_release_status(ReleaseStatus::Failed);
        if let Err(e) = self.save_history(request, &attempt.history).await {
            error!(
                release = %request.release_name,
                number = ?attempt.release_number,
                error = %e,
                "Failed to persist failed release"
            );
        }
    }

    async fn save_history(
        &self,
        request: &RollingDeployRequest,
        history: &ReleaseHistory,
    ) -> Result<(), RolloutError> {
        let data = history.to_yaml()?;
        self.ctx
            .cluster
            .save_release_history(&request.namespace, &request.release_name, &data)
            .await?;
        Ok(())
    }
}
