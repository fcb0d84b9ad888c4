//! Liveness and readiness endpoints
//!
//! `/healthz` answers as long as the process serves HTTP. `/readyz` also
//! requires the listener to be up and the API server to answer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use kube::Client;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Checks that the Kubernetes API answers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApiProbe: Send + Sync {
    async fn check(&self) -> Result<(), kube::Error>;
}

/// [`ApiProbe`] asking the API server for its version.
pub struct KubeApiProbe {
    client: Client,
}

impl KubeApiProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ApiProbe for KubeApiProbe {
    async fn check(&self) -> Result<(), kube::Error> {
        let version = self.client.apiserver_version().await?;
        debug!(git_version = %version.git_version, "API server reachable");
        Ok(())
    }
}

pub struct ProbeState<P: ApiProbe> {
    listening: AtomicBool,
    api: Arc<P>,
}

impl<P: ApiProbe> ProbeState<P> {
    pub fn new(api: Arc<P>) -> Self {
        Self {
            listening: AtomicBool::new(false),
            api,
        }
    }

    pub fn set_listening(&self) {
        if !self.listening.swap(true, Ordering::SeqCst) {
            info!("Probe endpoints serving");
        }
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

fn probe_router<P: ApiProbe + 'static>(state: Arc<ProbeState<P>>) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness::<P>))
        .with_state(state)
}

/// All interfaces, the kubelet connects to the pod IP
fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

/// Serve the probe endpoints until the server fails.
pub async fn run_health_server<P: ApiProbe + 'static>(
    state: Arc<ProbeState<P>>,
    port: u16,
) -> std::io::Result<()> {
    let addr = listen_addr(port);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Probe listener bound");

    state.set_listening();
    axum::serve(listener, probe_router(state)).await
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn readiness<P: ApiProbe + 'static>(State(state): State<Arc<ProbeState<P>>>) -> StatusCode {
    if !state.listening() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.api.check().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Not ready, API server did not answer");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
