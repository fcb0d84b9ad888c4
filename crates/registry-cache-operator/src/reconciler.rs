//! Reconcile orchestration
//!
//! One pass builds the cache workloads, publishes them, waits until every
//! cache is reachable, renders the mirror directive and publishes the node
//! agent with it. Every pass rebuilds from the declared configuration; nothing
//! is carried over from earlier passes.

use std::sync::Arc;

use registry_cache_common::CacheIdentity;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::agent_manifest::AgentManifestBuilder;
use crate::bundle::{Bundle, BundleError, BundlePublisher};
use crate::config::{
    CacheStatus, RegistryCache, REGISTRY_ENSURER_RESOURCE_NAME, REGISTRY_RESOURCE_NAME,
};
use crate::controllers::retry::ErrorKind;
use crate::discovery::{DiscoveryError, EndpointSource, EndpointWaiter};
use crate::mirror::{DirectiveError, MirrorDirective, RenderError};
use crate::settings::OperatorSettings;
use crate::upstream::{resolve_upstreams, ConfigErrors};
use crate::workload::CacheWorkloadBuilder;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigErrors),
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),
    #[error("endpoint discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("incomplete mirror directive: {0}")]
    Directive(#[from] DirectiveError),
    #[error("rendering failed: {0}")]
    Render(#[from] RenderError),
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("RegistryConfig {owner} already manages the registry caches")]
    Conflict { owner: String },
}

impl ReconcileError {
    /// Retry classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Bundle(_)
            | ReconcileError::Discovery(_)
            | ReconcileError::Directive(_)
            | ReconcileError::Kube(_) => ErrorKind::Transient,
            ReconcileError::Config(_)
            | ReconcileError::Render(_)
            | ReconcileError::MissingField(_)
            | ReconcileError::Conflict { .. } => ErrorKind::Permanent,
        }
    }

    /// Condition reason recorded in the status
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Config(_) | ReconcileError::MissingField(_) => "InvalidConfiguration",
            ReconcileError::Bundle(e) if e.is_timeout() => "DeletionTimeout",
            ReconcileError::Bundle(_) => "BundleFailed",
            ReconcileError::Discovery(_) => "DiscoveryTimeout",
            ReconcileError::Directive(_) => "IncompleteDirective",
            ReconcileError::Render(_) => "RenderFailed",
            ReconcileError::Kube(_) => "ApiError",
            ReconcileError::Conflict { .. } => "ConflictingConfiguration",
        }
    }
}

/// Result of a successful pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Discovered caches in declared order
    pub caches: Vec<CacheStatus>,
    /// Digest of the published mirror fragment
    pub artifact_digest: String,
}

/// Drives the cache and agent bundles of one configuration
pub struct MirrorReconciler {
    settings: Arc<OperatorSettings>,
    publisher: Arc<dyn BundlePublisher>,
    endpoints: Arc<dyn EndpointSource>,
}

impl MirrorReconciler {
    pub fn new(
        settings: Arc<OperatorSettings>,
        publisher: Arc<dyn BundlePublisher>,
        endpoints: Arc<dyn EndpointSource>,
    ) -> Self {
        Self {
            settings,
            publisher,
            endpoints,
        }
    }

    /// Converge the cluster towards `caches`.
    ///
    /// `namespace` holds the bundle inventories. The agent bundle is only
    /// published once every cache endpoint is known. When the inventories
    /// share the cache namespace, that namespace is left out of the bundle so
    /// deleting the bundle never takes the inventories with it.
    #[instrument(skip(self, caches), fields(caches = caches.len()))]
    pub async fn reconcile(
        &self,
        namespace: &str,
        caches: &[RegistryCache],
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let upstreams = resolve_upstreams(caches, &self.settings)?;

        let builder = CacheWorkloadBuilder::new(&self.settings);
        let mut cache_bundle = Bundle::new(REGISTRY_RESOURCE_NAME, namespace);
        if namespace != self.settings.cache_namespace {
            cache_bundle.push(&builder.namespace())?;
        }
        for spec in &upstreams {
            let workload = builder.build(spec);
            cache_bundle.push(&workload.service)?;
            cache_bundle.push(&workload.stateful_set)?;
        }
        let version = self.publisher.publish(&cache_bundle).await?;
        info!(bundle = REGISTRY_RESOURCE_NAME, version = %version, "Cache workloads published");

        let expected: Vec<CacheIdentity> = upstreams.iter().map(|s| s.identity.clone()).collect();
        let endpoints = EndpointWaiter::new(self.endpoints.as_ref(), self.settings.discovery)
            .wait_for(&expected)
            .await?;

        let directive = MirrorDirective::assemble(&upstreams, &endpoints)?;
        let artifact = directive.render()?;

        let manifest = AgentManifestBuilder::new(&self.settings).build(&artifact);
        let mut agent_bundle = Bundle::new(REGISTRY_ENSURER_RESOURCE_NAME, namespace);
        agent_bundle.push(&manifest.config_map)?;
        agent_bundle.push(&manifest.daemon_set)?;
        let version = self.publisher.publish(&agent_bundle).await?;
        info!(
            bundle = REGISTRY_ENSURER_RESOURCE_NAME,
            version = %version,
            digest = %artifact.digest(),
            mirrors = directive.len(),
            "Node agent published"
        );

        let caches = upstreams
            .iter()
            .zip(&endpoints)
            .map(|(spec, endpoint)| CacheStatus {
                upstream: spec.upstream.mirror_key(),
                name: spec.identity.to_string(),
                endpoint: format!("http://{}", endpoint.address),
            })
            .collect();

        Ok(ReconcileOutcome {
            caches,
            artifact_digest: artifact.digest(),
        })
    }

    /// Remove both bundles, agent first, waiting for each to be gone
    #[instrument(skip(self))]
    pub async fn delete(&self, namespace: &str) -> Result<(), ReconcileError> {
        for bundle in [REGISTRY_ENSURER_RESOURCE_NAME, REGISTRY_RESOURCE_NAME] {
            let objects = self.publisher.delete(bundle, namespace).await?;
            if let Err(e) = self
                .publisher
                .wait_until_deleted(bundle, namespace, &objects, self.settings.delete_timeout)
                .await
            {
                warn!(bundle, error = %e, "Bundle deletion did not complete");
                return Err(e.into());
            }
            info!(bundle, "Bundle removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{MockBundlePublisher, ObjectRef};
    use crate::discovery::MockEndpointSource;
    use crate::test_utils::{cache, FakeCluster};
    use crate::upstream::ConfigError;
    use std::time::Duration;

    fn statefulset_ref(name: &str) -> ObjectRef {
        ObjectRef {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            name: name.to_string(),
            namespace: Some("registry-cache".to_string()),
        }
    }

    fn reconciler(cluster: &Arc<FakeCluster>) -> MirrorReconciler {
        MirrorReconciler::new(
            Arc::new(FakeCluster::settings()),
            cluster.clone(),
            cluster.clone(),
        )
    }

    #[tokio::test]
    async fn test_two_caches_render_two_stanzas() {
        let cluster = Arc::new(FakeCluster::new());
        let outcome = reconciler(&cluster)
            .reconcile("garden", &[cache("registry-1.docker.io"), cache("gcr.io")])
            .await
            .unwrap();

        assert_eq!(outcome.caches.len(), 2);
        assert_eq!(outcome.caches[0].upstream, "registry-1.docker.io");
        assert_eq!(outcome.caches[1].upstream, "gcr.io");

        let fragment = cluster.fragment().unwrap();
        assert_eq!(fragment.matches("[plugins.").count(), 2);
        for status in &outcome.caches {
            let address = cluster.address_of(&status.name).unwrap();
            assert!(fragment.contains(&format!(
                "mirrors.\"{}\"]\n  endpoint = [\"http://{}\"]",
                status.upstream, address
            )));
            assert_eq!(status.endpoint, format!("http://{address}"));
        }
        assert_eq!(cluster.published(), vec![REGISTRY_RESOURCE_NAME, REGISTRY_ENSURER_RESOURCE_NAME]);
    }

    #[tokio::test]
    async fn test_unreachable_cache_blocks_agent_publish() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.make_unreachable("gcr.io");

        let err = reconciler(&cluster)
            .reconcile("garden", &[cache("registry-1.docker.io"), cache("gcr.io")])
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Discovery(_)));
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("registry-gcr-io"));
        assert!(cluster.fragment().is_none());
        assert_eq!(cluster.published(), vec![REGISTRY_RESOURCE_NAME]);
    }

    #[tokio::test]
    async fn test_removed_upstream_leaves_the_fragment() {
        let cluster = Arc::new(FakeCluster::new());
        let reconciler = reconciler(&cluster);

        reconciler
            .reconcile("garden", &[cache("registry-1.docker.io"), cache("gcr.io")])
            .await
            .unwrap();
        let before = cluster.fragment().unwrap();
        assert!(before.contains("\"gcr.io\""));

        let outcome = reconciler
            .reconcile("garden", &[cache("registry-1.docker.io")])
            .await
            .unwrap();
        let after = cluster.fragment().unwrap();

        assert_eq!(outcome.caches.len(), 1);
        assert!(!after.contains("\"gcr.io\""));
        assert!(after.contains("\"registry-1.docker.io\""));
        assert_eq!(cluster.service_count(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_is_repeatable() {
        let cluster = Arc::new(FakeCluster::new());
        let reconciler = reconciler(&cluster);
        let caches = [cache("quay.io"), cache("gcr.io")];

        let first = reconciler.reconcile("garden", &caches).await.unwrap();
        let second = reconciler.reconcile("garden", &caches).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cache_namespace_owned_only_outside_it() {
        let cluster = Arc::new(FakeCluster::new());
        let reconciler = reconciler(&cluster);

        reconciler.reconcile("garden", &[cache("gcr.io")]).await.unwrap();
        assert!(cluster.kinds(REGISTRY_RESOURCE_NAME).contains(&"Namespace".to_string()));

        reconciler
            .reconcile("registry-cache", &[cache("gcr.io")])
            .await
            .unwrap();
        assert_eq!(
            cluster.kinds(REGISTRY_RESOURCE_NAME),
            vec!["Service", "StatefulSet"]
        );
    }

    #[tokio::test]
    async fn test_invalid_configuration_publishes_nothing() {
        let mut publisher = MockBundlePublisher::new();
        publisher.expect_publish().never();
        let mut endpoints = MockEndpointSource::new();
        endpoints.expect_list_cache_services().never();

        let reconciler = MirrorReconciler::new(
            Arc::new(FakeCluster::settings()),
            Arc::new(publisher),
            Arc::new(endpoints),
        );
        let err = reconciler
            .reconcile("garden", &[cache("gcr.io"), cache("GCR.io")])
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            ReconcileError::Config(e) if matches!(e.errors(), [ConfigError::Duplicate { .. }])
        ));
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(err.reason(), "InvalidConfiguration");
    }

    #[tokio::test]
    async fn test_publish_failure_is_surfaced() {
        let mut publisher = MockBundlePublisher::new();
        publisher.expect_publish().times(1).returning(|_| {
            Err(BundleError::Unnamed {
                kind: "Service".to_string(),
            })
        });
        let mut endpoints = MockEndpointSource::new();
        endpoints.expect_list_cache_services().never();

        let reconciler = MirrorReconciler::new(
            Arc::new(FakeCluster::settings()),
            Arc::new(publisher),
            Arc::new(endpoints),
        );
        let err = reconciler
            .reconcile("garden", &[cache("gcr.io")])
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Bundle(_)));
        assert_eq!(err.reason(), "BundleFailed");
    }

    #[tokio::test]
    async fn test_delete_removes_agent_first() {
        let mut seq = mockall::Sequence::new();
        let mut publisher = MockBundlePublisher::new();
        for bundle in [REGISTRY_ENSURER_RESOURCE_NAME, REGISTRY_RESOURCE_NAME] {
            publisher
                .expect_delete()
                .withf(move |name, ns| name == bundle && ns == "garden")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|name, _| Ok(vec![statefulset_ref(name)]));
            publisher
                .expect_wait_until_deleted()
                .withf(move |name, _, objects, timeout| {
                    name == bundle
                        && objects == [statefulset_ref(bundle)].as_slice()
                        && *timeout == Duration::from_secs(120)
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _, _| Ok(()));
        }

        let reconciler = MirrorReconciler::new(
            Arc::new(FakeCluster::settings()),
            Arc::new(publisher),
            Arc::new(MockEndpointSource::new()),
        );
        reconciler.delete("garden").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_timeout_is_distinct() {
        let mut publisher = MockBundlePublisher::new();
        publisher.expect_delete().times(1).returning(|_, _| Ok(vec![]));
        publisher
            .expect_wait_until_deleted()
            .times(1)
            .returning(|name, _, _, timeout| {
                Err(BundleError::DeleteTimeout {
                    bundle: name.to_string(),
                    timeout,
                    remaining: 1,
                })
            });

        let reconciler = MirrorReconciler::new(
            Arc::new(FakeCluster::settings()),
            Arc::new(publisher),
            Arc::new(MockEndpointSource::new()),
        );
        let err = reconciler.delete("garden").await.unwrap_err();
        assert_eq!(err.reason(), "DeletionTimeout");
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
