use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kube::{Client, CustomResourceExt};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use registry_cache_operator::bundle::KubeBundlePublisher;
use registry_cache_operator::controllers::retry::RetryTracker;
use registry_cache_operator::controllers::ControllerContext;
use registry_cache_operator::discovery::KubeEndpointSource;
use registry_cache_operator::health::{run_health_server, KubeApiProbe, ProbeState};
use registry_cache_operator::reconciler::MirrorReconciler;
use registry_cache_operator::{OperatorSettings, RegistryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().nth(1).as_deref() == Some("crd") {
        print!(
            "{}",
            serde_yaml::to_string(&RegistryConfig::crd()).context("Failed to render CRD")?
        );
        return Ok(());
    }

    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("registry-cache-operator starting");

    let settings = Arc::new(OperatorSettings::from_env().context("Invalid operator settings")?);

    info!(
        cache_image = %settings.cache_image,
        agent_image = %settings.agent_image,
        namespace = %settings.cache_namespace,
        default_size = %settings.default_cache_size.0,
        discovery_attempts = settings.discovery.max_attempts,
        discovery_interval_secs = settings.discovery.poll_interval.as_secs(),
        "Loaded settings"
    );

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let reconciler = MirrorReconciler::new(
        settings.clone(),
        Arc::new(KubeBundlePublisher::new(
            kube_client.clone(),
            settings.delete_poll_interval,
        )),
        Arc::new(KubeEndpointSource::new(
            kube_client.clone(),
            settings.cache_namespace.clone(),
        )),
    );

    let ctx = Arc::new(ControllerContext {
        settings: settings.clone(),
        reconciler: Arc::new(reconciler),
        kube_client: kube_client.clone(),
        retry_tracker: Arc::new(RetryTracker::new()),
    });

    let health = Arc::new(ProbeState::new(Arc::new(KubeApiProbe::new(
        kube_client.clone(),
    ))));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    let controller = tokio::spawn(registry_cache_operator::controllers::registry_config::run(
        kube_client.clone(),
        ctx.clone(),
    ));

    select! {
        result = controller => {
            return handle_controller_exit(result);
        }
        result = run_health_server(health, settings.health_port) => {
            match result {
                Ok(()) => bail!("Health server exited unexpectedly"),
                Err(e) => return Err(e).context("Health server failed"),
            }
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    // The controller stops on the same signal, give in-flight reconciles a moment
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("Shutdown complete");

    Ok(())
}

/// Handle a controller task exit, returning an error to trigger pod restart
fn handle_controller_exit(result: std::result::Result<(), tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(()) => {
            // shutdown_on_signal ends the stream on SIGTERM
            info!("Controller stopped");
            Ok(())
        }
        Err(e) if e.is_panic() => {
            error!("Controller panicked");
            bail!("RegistryConfig controller panicked: {:?}", e.into_panic())
        }
        Err(e) if e.is_cancelled() => {
            warn!("Controller was cancelled");
            bail!("RegistryConfig controller was cancelled")
        }
        Err(e) => {
            error!(error = ?e, "Controller task failed");
            bail!("RegistryConfig controller task failed: {}", e)
        }
    }
}
