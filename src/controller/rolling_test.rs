use super::*;
use crate::cluster::{ContainerInfo, MockClusterClient, PodInfo, RolloutState};
use crate::controller::clock::MockClock;
use crate::controller::log_sink::{CommandExecutionStatus, CommandUnit, MockLogSink};
use crate::controller::manifests::StringManifestSource;
use crate::controller::steady_state::WaitError;
use crate::model::{ReleaseHistory, ReleaseStatus, ResourceId};
use crate::server::metrics::{OUTCOME_FAILED, OUTCOME_SUCCEEDED};
use crate::server::{cancel_channel, CancelSignal, RolloutMetrics};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const NAMESPACE: &str = "default";
const RELEASE: &str = "shop";

const WEB: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
      - name: app
        image: nginx:1.0
        envFrom:
        - configMapRef:
            name: web-config
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: web-config
data:
  LOG_LEVEL: debug
"#;

fn config_maps(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\ndata:\n  key: value\n"))
        .collect::<Vec<_>>()
        .join("---\n")
}

fn config_map_id(name: &str) -> ResourceId {
    ResourceId::new("v1", "ConfigMap", Some(NAMESPACE), name)
}

fn web_id() -> ResourceId {
    ResourceId::new("apps/v1", "Deployment", Some(NAMESPACE), "web")
}

fn pod(uid: &str) -> PodInfo {
    PodInfo {
        uid: uid.to_string(),
        name: format!("web-{}", uid),
        namespace: NAMESPACE.to_string(),
        release_name: RELEASE.to_string(),
        pod_ip: Some("10.0.0.7".to_string()),
        containers: vec![ContainerInfo {
            name: "app".to_string(),
            image: Some("nginx:1.0".to_string()),
        }],
        new_pod: false,
    }
}

fn deployer(cluster: &Arc<MockClusterClient>, sink: &Arc<MockLogSink>, manifests: &str) -> RollingDeployer {
    let ctx = Context::new(
        cluster.clone(),
        Arc::new(StringManifestSource::new(manifests)),
        sink.clone(),
        Arc::new(MockClock::new(Utc::now())),
    )
    .with_poll_interval(Duration::from_millis(5));
    RollingDeployer::new(ctx)
}

fn request() -> RollingDeployRequest {
    RollingDeployRequest::new(RELEASE, NAMESPACE)
}

fn stored_history(cluster: &MockClusterClient) -> ReleaseHistory {
    let data = cluster
        .history(NAMESPACE, RELEASE)
        .expect("release history should have been saved");
    ReleaseHistory::from_yaml(&data).unwrap()
}

async fn deploy(
    cluster: &Arc<MockClusterClient>,
    manifests: &str,
    request: &RollingDeployRequest,
) -> Result<RolloutResponse, RolloutFailure> {
    let sink = Arc::new(MockLogSink::new());
    deployer(cluster, &sink, manifests)
        .deploy(request, CancelSignal::never())
        .await
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_successful_rollout_records_succeeded_release() {
    let cluster = Arc::new(MockClusterClient::new());
    let sink = Arc::new(MockLogSink::new());

    let response = deployer(&cluster, &sink, WEB)
        .deploy(&request(), CancelSignal::never())
        .await
        .expect("rollout should succeed");

    assert_eq!(response.release_number, 1);
    assert_eq!(response.status, CommandExecutionStatus::Success);
    assert!(response.pruned_resource_ids.is_empty());
    assert_eq!(cluster.dry_runs(), 1);
    assert_eq!(cluster.applied().len(), 1);
    assert_eq!(cluster.describes(), 1);

    let history = stored_history(&cluster);
    let release = history.latest_release().unwrap();
    assert_eq!(release.number, 1);
    assert_eq!(release.status, ReleaseStatus::Succeeded);
    assert_eq!(release.managed_workloads.len(), 1);
    assert_eq!(release.managed_workloads[0].workload, web_id());

    assert_eq!(
        sink.unit_statuses(),
        vec![
            (CommandUnit::Init, CommandExecutionStatus::Success),
            (CommandUnit::Prepare, CommandExecutionStatus::Success),
            (CommandUnit::Apply, CommandExecutionStatus::Success),
            (CommandUnit::WaitForSteadyState, CommandExecutionStatus::Success),
            (CommandUnit::WrapUp, CommandExecutionStatus::Success),
        ]
    );
}

#[tokio::test]
async fn test_release_and_log_timestamps_come_from_clock() {
    use chrono::TimeZone;

    let cluster = Arc::new(MockClusterClient::new());
    let sink = Arc::new(MockLogSink::new());
    let fixed = Utc.with_ymd_and_hms(2026, 2, 14, 8, 0, 0).unwrap();
    let ctx = Context::new(
        cluster.clone(),
        Arc::new(StringManifestSource::new(config_maps(&["a"]))),
        sink.clone(),
        Arc::new(MockClock::new(fixed)),
    );

    RollingDeployer::new(ctx)
        .deploy(&request(), CancelSignal::never())
        .await
        .unwrap();

    let history = stored_history(&cluster);
    assert_eq!(history.latest_release().unwrap().created_at, fixed);
    assert!(sink.records().iter().all(|r| r.timestamp == fixed));
}

#[tokio::test]
async fn test_config_map_is_applied_under_versioned_name() {
    let cluster = Arc::new(MockClusterClient::new());

    deploy(&cluster, WEB, &request()).await.unwrap();

    let applied = &cluster.applied()[0];
    let config_map = applied
        .iter()
        .find(|id| id.kind == "ConfigMap")
        .expect("config map should be applied");
    assert!(config_map.name.starts_with("web-config-"));

    let history = stored_history(&cluster);
    let release = history.latest_release().unwrap();
    assert_eq!(release.versioned_resources, vec![config_map.clone()]);
}

#[tokio::test]
async fn test_skip_versioning_keeps_names() {
    let cluster = Arc::new(MockClusterClient::new());
    let mut request = request();
    request.skip_resource_versioning = true;

    deploy(&cluster, WEB, &request).await.unwrap();

    assert!(cluster.applied()[0].contains(&config_map_id("web-config")));
}

#[tokio::test]
async fn test_skip_dry_run() {
    let cluster = Arc::new(MockClusterClient::new());
    let mut request = request();
    request.skip_dry_run = true;

    deploy(&cluster, WEB, &request).await.unwrap();

    assert_eq!(cluster.dry_runs(), 0);
    assert_eq!(cluster.applied().len(), 1);
}

#[tokio::test]
async fn test_new_pods_are_tagged() {
    let cluster = Arc::new(MockClusterClient::new());
    cluster.set_existing_pods(vec![pod("old")]);
    cluster.set_pods_after_apply(vec![pod("old"), pod("new")]);

    let response = deploy(&cluster, WEB, &request()).await.unwrap();

    assert_eq!(response.pods.len(), 2);
    let new: Vec<&str> = response.new_pods().map(|p| p.uid.as_str()).collect();
    assert_eq!(new, vec!["new"]);
}

#[tokio::test]
async fn test_load_balancer_endpoint_is_reported() {
    let cluster = Arc::new(MockClusterClient::new());
    let manifests = format!(
        "{}---\napiVersion: v1\nkind: Service\nmetadata:\n  name: web\nspec:\n  type: LoadBalancer\n  ports:\n  - port: 443\n",
        WEB
    );
    let service = ResourceId::new("v1", "Service", Some(NAMESPACE), "web");
    cluster.set_load_balancer(&service, "lb.example.com");

    let response = deploy(&cluster, &manifests, &request()).await.unwrap();

    assert_eq!(
        response.load_balancer.as_deref(),
        Some("https://lb.example.com/")
    );
}

#[tokio::test]
async fn test_pending_load_balancer_is_omitted() {
    let cluster = Arc::new(MockClusterClient::new());

    let response = deploy(&cluster, WEB, &request()).await.unwrap();

    assert_eq!(response.load_balancer, None);
}

#[tokio::test]
async fn test_no_workloads_skips_status_check() {
    let cluster = Arc::new(MockClusterClient::new());
    let sink = Arc::new(MockLogSink::new());

    deployer(&cluster, &sink, &config_maps(&["a", "b"]))
        .deploy(&request(), CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(cluster.status_calls(), 0);
    assert_eq!(cluster.revision_calls(), 0);
    assert!(sink
        .messages()
        .iter()
        .any(|m| m == "Skipping Status Check since there is no Managed Workload."));
    // Only the terminal save; no intermediate save without workloads
    assert_eq!(cluster.saves().len(), 1);
}

// ============================================================================
// Release numbering
// ============================================================================

#[tokio::test]
async fn test_release_numbers_increase_across_failures() {
    let failing = Arc::new(MockClusterClient::new());
    failing.fail_apply();
    let err = deploy(&failing, WEB, &request()).await.unwrap_err();
    assert_eq!(err.release_number, Some(1));

    let cluster = Arc::new(MockClusterClient::new());
    cluster.set_history(NAMESPACE, RELEASE, &failing.history(NAMESPACE, RELEASE).unwrap());

    let response = deploy(&cluster, WEB, &request()).await.unwrap();
    assert_eq!(response.release_number, 2);

    let history = stored_history(&cluster);
    let statuses: Vec<(u32, ReleaseStatus)> = history
        .releases
        .iter()
        .map(|r| (r.number, r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![(1, ReleaseStatus::Failed), (2, ReleaseStatus::Succeeded)]
    );
}

#[tokio::test]
async fn test_canary_updates_latest_release_in_place() {
    let cluster = Arc::new(MockClusterClient::new());
    deploy(&cluster, &config_maps(&["a"]), &request()).await.unwrap();

    let mut canary = request();
    canary.in_canary_workflow = true;
    let response = deploy(&cluster, &config_maps(&["a", "b"]), &canary)
        .await
        .unwrap();

    assert_eq!(response.release_number, 1);
    let history = stored_history(&cluster);
    assert_eq!(history.releases.len(), 1);
    let release = history.latest_release().unwrap();
    assert_eq!(release.number, 1);
    assert_eq!(
        release.resources,
        vec![config_map_id("a"), config_map_id("b")]
    );
}

#[tokio::test]
async fn test_canary_without_history_fails_in_prepare() {
    let cluster = Arc::new(MockClusterClient::new());
    let mut canary = request();
    canary.in_canary_workflow = true;

    let err = deploy(&cluster, WEB, &canary).await.unwrap_err();

    assert_eq!(err.stage, Stage::Prepare);
    assert!(matches!(err.error, RolloutError::MissingCanaryRelease(_)));
    assert!(cluster.applied().is_empty());
    assert!(cluster.saves().is_empty());
}

// ============================================================================
// Failure persistence
// ============================================================================

#[tokio::test]
async fn test_invalid_request_touches_nothing() {
    let cluster = Arc::new(MockClusterClient::new());
    let request = RollingDeployRequest::new("Shop_Frontend", NAMESPACE);

    let err = deploy(&cluster, WEB, &request).await.unwrap_err();

    assert_eq!(err.stage, Stage::Init);
    assert!(matches!(err.error, RolloutError::Validation(_)));
    assert_eq!(cluster.dry_runs(), 0);
}

#[tokio::test]
async fn test_dry_run_failure_persists_nothing() {
    let cluster = Arc::new(MockClusterClient::new());
    cluster.fail_dry_run();
    let sink = Arc::new(MockLogSink::new());

    let err = deployer(&cluster, &sink, WEB)
        .deploy(&request(), CancelSignal::never())
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Init);
    assert!(matches!(err.error, RolloutError::DryRun(_)));
    assert_eq!(err.release_number, None);
    assert!(cluster.applied().is_empty());
    assert!(cluster.saves().is_empty());
    assert_eq!(
        sink.unit_statuses(),
        vec![(CommandUnit::Init, CommandExecutionStatus::Failure)]
    );
}

#[tokio::test]
async fn test_apply_failure_persists_failed_release() {
    let cluster = Arc::new(MockClusterClient::new());
    cluster.fail_apply();

    let err = deploy(&cluster, WEB, &request()).await.unwrap_err();

    assert_eq!(err.stage, Stage::Apply);
    assert!(matches!(err.error, RolloutError::Cluster(_)));
    let history = stored_history(&cluster);
    let release = history.latest_release().unwrap();
    assert_eq!(release.number, 1);
    assert_eq!(release.status, ReleaseStatus::Failed);
}

#[tokio::test]
async fn test_wait_failure_persists_failed_release_and_refreshes_revisions() {
    let cluster = Arc::new(MockClusterClient::new());
    cluster.script_rollout(
        &web_id(),
        vec![RolloutState::Failed("ProgressDeadlineExceeded".to_string())],
    );

    let err = deploy(&cluster, WEB, &request()).await.unwrap_err();

    assert_eq!(err.stage, Stage::WaitSteadyState);
    assert_eq!(err.release_number, Some(1));
    assert!(matches!(
        err.error,
        RolloutError::Wait(WaitError::WorkloadFailed { .. })
    ));
    // One capture after apply, one refresh after the failed wait
    assert_eq!(cluster.revision_calls(), 2);

    let history = stored_history(&cluster);
    let release = history.release(1).unwrap();
    assert_eq!(release.status, ReleaseStatus::Failed);
    assert_eq!(release.managed_workloads[0].workload, web_id());
}

#[tokio::test]
async fn test_refresh_records_revision_after_wait() {
    let cluster = Arc::new(MockClusterClient::new());
    cluster.set_revision(&web_id(), "7");

    deploy(&cluster, WEB, &request()).await.unwrap();

    let history = stored_history(&cluster);
    let release = history.latest_release().unwrap();
    assert_eq!(release.managed_workloads[0].revision.as_deref(), Some("7"));
    assert_eq!(cluster.revision_calls(), 2);
}

#[tokio::test]
async fn test_final_save_failure_fails_wrap_up() {
    let cluster = Arc::new(MockClusterClient::new());
    cluster.fail_save();

    let err = deploy(&cluster, &config_maps(&["a"]), &request())
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::WrapUp);
    assert!(matches!(err.error, RolloutError::Cluster(_)));
}

#[tokio::test]
async fn test_cancellation_during_wait_persists_failed_release() {
    let cluster = Arc::new(MockClusterClient::new());
    cluster.script_rollout(
        &web_id(),
        vec![RolloutState::NotReady("0 of 3 updated replicas available".to_string())],
    );
    let sink = Arc::new(MockLogSink::new());
    let deployer = deployer(&cluster, &sink, WEB);
    let (handle, signal) = cancel_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });
    let err = deployer.deploy(&request(), signal).await.unwrap_err();

    assert_eq!(err.stage, Stage::WaitSteadyState);
    assert!(matches!(
        err.error,
        RolloutError::Cancelled | RolloutError::Wait(WaitError::Cancelled)
    ));
    let history = stored_history(&cluster);
    assert_eq!(history.release(1).unwrap().status, ReleaseStatus::Failed);
}

#[tokio::test]
async fn test_cancelled_before_start_does_nothing() {
    let cluster = Arc::new(MockClusterClient::new());
    let sink = Arc::new(MockLogSink::new());
    let (handle, signal) = cancel_channel();
    handle.cancel();

    let err = deployer(&cluster, &sink, WEB)
        .deploy(&request(), signal)
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Init);
    assert!(matches!(err.error, RolloutError::Cancelled));
    assert!(cluster.saves().is_empty());
}

// ============================================================================
// Pruning
// ============================================================================

#[tokio::test]
async fn test_pruning_baseline_starts_with_first_pruning_release() {
    let cluster = Arc::new(MockClusterClient::new());

    // Attempt 1: pruning disabled, no specs recorded
    let first = deploy(&cluster, &config_maps(&["a", "b"]), &request())
        .await
        .unwrap();
    assert_eq!(first.release_number, 1);
    assert!(first.pruned_resource_ids.is_empty());

    let mut pruning = request();
    pruning.pruning_enabled = true;

    // Attempt 2: previous release has no specs, nothing to diff against
    let second = deploy(&cluster, &config_maps(&["b", "c"]), &pruning)
        .await
        .unwrap();
    assert_eq!(second.release_number, 2);
    assert!(second.pruned_resource_ids.is_empty());
    assert!(cluster.deleted().is_empty());

    // Attempt 3: release 2 is the baseline
    let third = deploy(&cluster, &config_maps(&["c"]), &pruning)
        .await
        .unwrap();
    assert_eq!(third.release_number, 3);
    assert_eq!(third.pruned_resource_ids, vec![config_map_id("b")]);
    assert_eq!(cluster.deleted(), vec![config_map_id("b")]);

    let history = stored_history(&cluster);
    assert_eq!(history.latest_release().unwrap().status, ReleaseStatus::Succeeded);
}

#[tokio::test]
async fn test_partial_prune_failure_still_succeeds() {
    let cluster = Arc::new(MockClusterClient::new());
    let mut pruning = request();
    pruning.pruning_enabled = true;
    deploy(&cluster, &config_maps(&["a", "b", "c"]), &pruning)
        .await
        .unwrap();
    cluster.fail_delete(&config_map_id("a"));

    let response = deploy(&cluster, &config_maps(&["c"]), &pruning)
        .await
        .unwrap();

    assert_eq!(response.pruned_resource_ids, vec![config_map_id("b")]);
    assert_eq!(cluster.delete_attempts().len(), 2);
}

// ============================================================================
// Metrics
// ============================================================================

#[tokio::test]
async fn test_metrics_record_outcomes() {
    let metrics = RolloutMetrics::new().unwrap();
    let cluster = Arc::new(MockClusterClient::new());
    let sink = Arc::new(MockLogSink::new());
    let ctx = Context::new(
        cluster.clone(),
        Arc::new(StringManifestSource::new(WEB)),
        sink.clone(),
        Arc::new(MockClock::new(Utc::now())),
    )
    .with_poll_interval(Duration::from_millis(5))
    .with_metrics(metrics.clone());
    let deployer = RollingDeployer::new(ctx);

    deployer.deploy(&request(), CancelSignal::never()).await.unwrap();
    cluster.fail_apply();
    deployer
        .deploy(&request(), CancelSignal::never())
        .await
        .unwrap_err();

    assert_eq!(metrics.attempts(OUTCOME_SUCCEEDED, "Completed"), 1);
    assert_eq!(metrics.attempts(OUTCOME_FAILED, "Apply"), 1);
}

#[test]
fn test_failure_display_names_stage_and_release() {
    let failure = RolloutFailure {
        stage: Stage::WaitSteadyState,
        release_number: Some(4),
        error: RolloutError::Cancelled,
    };

    assert_eq!(
        failure.to_string(),
        "rollout failed during WaitSteadyState (release 4)"
    );
}
