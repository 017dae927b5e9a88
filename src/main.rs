use kroll::cluster::KubeClusterClient;
use kroll::config::Config;
use kroll::controller::clock::SystemClock;
use kroll::controller::log_sink::{ExecutionLogSink, HttpLogSink, TracingLogSink};
use kroll::controller::manifests::FileManifestSource;
use kroll::controller::{Context, RollingDeployer};
use kroll::server::{cancel_channel, cancel_on, wait_for_signal, RolloutMetrics};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // reqwest and kube both sit on rustls; pick ring before either builds a client
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::from_env()?;
    info!(
        release = %config.release_name,
        namespace = %config.namespace,
        manifests = %config.manifest_path.display(),
        "Starting kroll rolling deployment"
    );

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let log_sink: Arc<dyn ExecutionLogSink> = match &config.log_sink_url {
        Some(url) => {
            info!(url = %url, "Execution logs forwarded over HTTP");
            Arc::new(HttpLogSink::new(Some(url.clone())))
        }
        None => Arc::new(TracingLogSink),
    };
    let metrics = RolloutMetrics::new()?;

    let ctx = Context::new(
        Arc::new(KubeClusterClient::new(client)),
        Arc::new(FileManifestSource::new(config.manifest_path.clone())),
        log_sink,
        Arc::new(SystemClock),
    )
    .with_metrics(metrics.clone())
    .with_poll_interval(config.poll_interval)
    .with_attempt_grace(config.attempt_grace);
    let deployer = RollingDeployer::new(ctx);

    let (cancel_handle, cancel_signal) = cancel_channel();
    let signal_task = tokio::spawn(cancel_on(cancel_handle, wait_for_signal()));

    let result = deployer.deploy(&config.to_request(), cancel_signal).await;
    signal_task.abort();
    info!(metrics = %metrics.render(), "Rollout metrics");

    match result {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(failure) => {
            error!(
                stage = %failure.stage,
                release_number = ?failure.release_number,
                error = %failure.error,
                "Rollout failed"
            );
            Err(failure.into())
        }
    }
}
