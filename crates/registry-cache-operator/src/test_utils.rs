//! In-memory cluster for reconcile tests

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use parking_lot::Mutex;
use registry_cache_common::names::{annotations, host};

use crate::bundle::{Bundle, BundleError, BundlePublisher, ObjectRef};
use crate::config::{RegistryCache, REGISTRY_ENSURER_RESOURCE_NAME, REGISTRY_RESOURCE_NAME};
use crate::discovery::EndpointSource;
use crate::settings::{DiscoveryPolicy, OperatorSettings};

pub fn cache(upstream: &str) -> RegistryCache {
    RegistryCache {
        upstream: upstream.to_string(),
        size: None,
        garbage_collection_enabled: None,
        storage_class_name: None,
    }
}

fn decode<K: serde::de::DeserializeOwned>(bundle: &Bundle, kind: &str) -> Vec<K> {
    bundle
        .objects()
        .iter()
        .filter(|o| o.kind() == kind)
        .map(|o| serde_json::from_value(serde_json::to_value(o.object()).unwrap()).unwrap())
        .collect()
}

#[derive(Default)]
struct State {
    bundles: BTreeMap<String, Bundle>,
    published: Vec<String>,
    unreachable: BTreeSet<String>,
    addresses: BTreeMap<String, SocketAddr>,
}

/// Publishes bundles into memory and serves the published cache Services,
/// assigning each a stable cluster IP unless its upstream is unreachable
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings() -> OperatorSettings {
        OperatorSettings {
            discovery: DiscoveryPolicy {
                poll_interval: Duration::from_millis(1),
                max_attempts: 3,
            },
            ..Default::default()
        }
    }

    /// Never assign an address to the cache of `upstream`
    pub fn make_unreachable(&self, upstream: &str) {
        self.state.lock().unreachable.insert(upstream.to_string());
    }

    /// Bundle names in publish order
    pub fn published(&self) -> Vec<String> {
        self.state.lock().published.clone()
    }

    /// Mirror fragment of the published agent bundle
    pub fn fragment(&self) -> Option<String> {
        let state = self.state.lock();
        let bundle = state.bundles.get(REGISTRY_ENSURER_RESOURCE_NAME)?;
        decode::<ConfigMap>(bundle, "ConfigMap")
            .into_iter()
            .next()?
            .data?
            .remove(host::FRAGMENT_NAME)
    }

    pub fn address_of(&self, cache_name: &str) -> Option<SocketAddr> {
        self.state.lock().addresses.get(cache_name).copied()
    }

    /// Object kinds of a published bundle in publish order
    pub fn kinds(&self, bundle: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .bundles
            .get(bundle)
            .map(|b| b.objects().iter().map(|o| o.kind().to_string()).collect())
            .unwrap_or_default()
    }

    /// Services in the published cache bundle
    pub fn service_count(&self) -> usize {
        let state = self.state.lock();
        state
            .bundles
            .get(REGISTRY_RESOURCE_NAME)
            .map(|b| decode::<Service>(b, "Service").len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BundlePublisher for FakeCluster {
    async fn publish(&self, bundle: &Bundle) -> Result<String, BundleError> {
        let version = bundle.version()?;
        let mut state = self.state.lock();
        state.published.push(bundle.name().to_string());
        state
            .bundles
            .insert(bundle.name().to_string(), bundle.clone());
        Ok(version)
    }

    async fn delete(&self, name: &str, _namespace: &str) -> Result<Vec<ObjectRef>, BundleError> {
        Ok(self
            .state
            .lock()
            .bundles
            .remove(name)
            .map(|b| b.refs())
            .unwrap_or_default())
    }

    async fn wait_until_deleted(
        &self,
        _name: &str,
        _namespace: &str,
        _objects: &[ObjectRef],
        _timeout: Duration,
    ) -> Result<(), BundleError> {
        Ok(())
    }
}

#[async_trait]
impl EndpointSource for FakeCluster {
    async fn list_cache_services(&self) -> Result<Vec<Service>, kube::Error> {
        let mut state = self.state.lock();
        let Some(bundle) = state.bundles.get(REGISTRY_RESOURCE_NAME) else {
            return Ok(vec![]);
        };
        let services = decode::<Service>(bundle, "Service");

        let mut listed = Vec::new();
        for mut svc in services {
            let upstream = svc
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(annotations::UPSTREAM))
                .cloned()
                .unwrap_or_default();
            if state.unreachable.contains(&upstream) {
                listed.push(svc);
                continue;
            }

            let name = svc.metadata.name.clone().unwrap_or_default();
            let next = state.addresses.len() + 1;
            let address = *state
                .addresses
                .entry(name)
                .or_insert_with(|| SocketAddr::from(([10, 96, 0, next as u8], 5000)));
            if let Some(spec) = svc.spec.as_mut() {
                spec.cluster_ip = Some(address.ip().to_string());
            }
            listed.push(svc);
        }
        Ok(listed)
    }
}
