//! Endpoint discovery
//!
//! Cache workloads take a variable time to get a network address after they
//! are published. [`EndpointWaiter`] lists the cache Services with a fixed
//! interval until every configured cache is observable, and returns either the
//! complete set of endpoints or an error. A partial set is never returned.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::Client;
use registry_cache_common::names::labels;
use registry_cache_common::CacheIdentity;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::settings::DiscoveryPolicy;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(
        "caches not reachable after {attempts} attempts: {}{}",
        .missing.join(", "),
        last_error_suffix(.last_error)
    )]
    Timeout {
        attempts: u32,
        missing: Vec<String>,
        last_error: Option<String>,
    },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}

/// Address of a cache Service as seen in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEndpoint {
    /// Cache name from the upstream-host label
    pub name: String,
    pub address: SocketAddr,
}

impl ObservedEndpoint {
    /// Read the cluster-internal address and first port of a cache Service.
    ///
    /// Returns `None` while the Service has no usable address.
    pub fn from_service(svc: &Service) -> Option<Self> {
        let name = svc.metadata.labels.as_ref()?.get(labels::UPSTREAM_HOST)?;
        let spec = svc.spec.as_ref()?;
        let ip: IpAddr = spec.cluster_ip.as_deref()?.parse().ok()?;
        let port = spec.ports.as_ref()?.first()?.port;
        let port = u16::try_from(port).ok().filter(|p| *p != 0)?;
        Some(Self {
            name: name.clone(),
            address: SocketAddr::new(ip, port),
        })
    }
}

/// A configured cache with its reachable address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    pub identity: CacheIdentity,
    pub address: SocketAddr,
}

/// Lists cache Services
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// List all Services carrying the upstream-host label
    async fn list_cache_services(&self) -> Result<Vec<Service>, kube::Error>;
}

/// [`EndpointSource`] backed by the Kubernetes API
pub struct KubeEndpointSource {
    client: Client,
    namespace: String,
}

impl KubeEndpointSource {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl EndpointSource for KubeEndpointSource {
    async fn list_cache_services(&self) -> Result<Vec<Service>, kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = api
            .list(&ListParams::default().labels(labels::UPSTREAM_HOST))
            .await?;
        Ok(list.items)
    }
}

/// Polls an [`EndpointSource`] until every expected cache is observable
pub struct EndpointWaiter<'a, S: EndpointSource + ?Sized> {
    source: &'a S,
    policy: DiscoveryPolicy,
}

impl<'a, S: EndpointSource + ?Sized> EndpointWaiter<'a, S> {
    pub fn new(source: &'a S, policy: DiscoveryPolicy) -> Self {
        Self { source, policy }
    }

    /// Wait for the endpoints of `expected`, in the order given.
    ///
    /// Each attempt is one full list. A failed list counts as an attempt.
    /// Dropping the returned future cancels the wait.
    #[instrument(skip(self, expected), fields(expected = expected.len()))]
    pub async fn wait_for(
        &self,
        expected: &[CacheIdentity],
    ) -> Result<Vec<DiscoveredEndpoint>, DiscoveryError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;
        let mut missing: Vec<String> = expected.iter().map(ToString::to_string).collect();

        for attempt in 1..=max_attempts {
            match self.source.list_cache_services().await {
                Ok(services) => {
                    let observed: BTreeMap<String, SocketAddr> = services
                        .iter()
                        .filter_map(ObservedEndpoint::from_service)
                        .map(|e| (e.name, e.address))
                        .collect();

                    missing = expected
                        .iter()
                        .filter(|id| !observed.contains_key(id.as_str()))
                        .map(ToString::to_string)
                        .collect();

                    if missing.is_empty() {
                        let endpoints = expected
                            .iter()
                            .filter_map(|id| {
                                observed.get(id.as_str()).map(|address| DiscoveredEndpoint {
                                    identity: id.clone(),
                                    address: *address,
                                })
                            })
                            .collect();
                        info!(attempt, "All cache endpoints discovered");
                        return Ok(endpoints);
                    }

                    debug!(
                        attempt,
                        observed = expected.len() - missing.len(),
                        missing = ?missing,
                        "Cache endpoints not yet observable"
                    );
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to list cache services");
                    last_error = Some(e.to_string());
                }
            }

            if attempt < max_attempts {
                sleep(self.policy.poll_interval).await;
            }
        }

        Err(DiscoveryError::Timeout {
            attempts: max_attempts,
            missing,
            last_error,
        })
    }
}
