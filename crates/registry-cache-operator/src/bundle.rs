//! Managed bundles
//!
//! A bundle is a named set of objects published and removed as a unit. Objects
//! are server-side applied, and an inventory ConfigMap `bundle-<name>` next to
//! the owning resource records what was published so that later publishes can
//! prune objects that dropped out and deletion knows what to remove.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams,
};
use kube::core::TypeMeta;
use kube::{Client, Resource};
use registry_cache_common::content_digest;
use registry_cache_common::names::{annotations, labels, FIELD_MANAGER};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

/// Inventory key holding the multi-document manifest
pub const INVENTORY_MANIFEST_KEY: &str = "manifest.yaml";
/// Inventory key holding the published object references
pub const INVENTORY_OBJECTS_KEY: &str = "objects.json";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to serialize {kind}: {source}")]
    Serialize {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} object has no name")]
    Unnamed { kind: String },
    #[error("failed to render manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),
    #[error("inventory of bundle {bundle} is unreadable: {source}")]
    Inventory {
        bundle: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("bundle {bundle} still has {remaining} objects after {timeout:?}")]
    DeleteTimeout {
        bundle: String,
        timeout: Duration,
        remaining: usize,
    },
}

impl BundleError {
    /// Whether this is the bounded wait giving up rather than a failed call
    pub fn is_timeout(&self) -> bool {
        matches!(self, BundleError::DeleteTimeout { .. })
    }
}

/// Reference to a published object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectRef {
    fn api_resource(&self) -> ApiResource {
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        };
        ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &self.kind))
    }

    fn api(&self, client: &Client) -> Api<DynamicObject> {
        let resource = self.api_resource();
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
            None => Api::all_with(client.clone(), &resource),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A typed object erased for publishing
#[derive(Debug, Clone)]
pub struct BundleObject {
    resource: ApiResource,
    object: DynamicObject,
}

impl BundleObject {
    pub fn from_typed<K>(obj: &K) -> Result<Self, BundleError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let resource = ApiResource::erase::<K>(&());
        let to_error = |source| BundleError::Serialize {
            kind: resource.kind.clone(),
            source,
        };
        let value = serde_json::to_value(obj).map_err(to_error)?;
        let mut object: DynamicObject = serde_json::from_value(value).map_err(to_error)?;
        object.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        if object.metadata.name.is_none() {
            return Err(BundleError::Unnamed {
                kind: resource.kind,
            });
        }
        Ok(Self { resource, object })
    }

    pub fn kind(&self) -> &str {
        &self.resource.kind
    }

    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }

    pub fn object(&self) -> &DynamicObject {
        &self.object
    }

    pub fn reference(&self) -> ObjectRef {
        ObjectRef {
            api_version: self.resource.api_version.clone(),
            kind: self.resource.kind.clone(),
            name: self.name().to_string(),
            namespace: self.namespace().map(str::to_string),
        }
    }

    fn set_label(&mut self, key: &str, value: &str) {
        self.object
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }
}

/// Named set of objects published as a unit
#[derive(Debug, Clone)]
pub struct Bundle {
    name: String,
    namespace: String,
    objects: Vec<BundleObject>,
}

impl Bundle {
    /// `namespace` is where the inventory is kept, objects carry their own
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            objects: Vec::new(),
        }
    }

    /// Add an object, labelled as a member of this bundle
    pub fn push<K>(&mut self, obj: &K) -> Result<(), BundleError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut object = BundleObject::from_typed(obj)?;
        object.set_label(labels::BUNDLE, &self.name);
        self.objects.push(object);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Objects in publish order
    pub fn objects(&self) -> &[BundleObject] {
        &self.objects
    }

    pub fn refs(&self) -> Vec<ObjectRef> {
        self.objects.iter().map(BundleObject::reference).collect()
    }

    /// Multi-document YAML of all objects
    pub fn manifest(&self) -> Result<String, BundleError> {
        let mut out = String::new();
        for object in &self.objects {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(&object.object)?);
        }
        Ok(out)
    }

    /// Content version of the bundle
    pub fn version(&self) -> Result<String, BundleError> {
        Ok(content_digest(self.manifest()?.as_bytes()))
    }
}

/// Name of the inventory ConfigMap of a bundle
pub fn inventory_name(bundle: &str) -> String {
    format!("bundle-{bundle}")
}

/// Inventory ConfigMap recording the objects and manifest of a published bundle
fn inventory(bundle: &Bundle, version: &str) -> Result<ConfigMap, BundleError> {
    let objects = serde_json::to_string(&bundle.refs()).map_err(|source| BundleError::Serialize {
        kind: "ConfigMap".to_string(),
        source,
    })?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(inventory_name(bundle.name())),
            namespace: Some(bundle.namespace().to_string()),
            labels: Some(BTreeMap::from([
                (labels::BUNDLE.to_string(), bundle.name().to_string()),
                (labels::MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
            ])),
            annotations: Some(BTreeMap::from([(
                annotations::BUNDLE_VERSION.to_string(),
                version.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (INVENTORY_MANIFEST_KEY.to_string(), bundle.manifest()?),
            (INVENTORY_OBJECTS_KEY.to_string(), objects),
        ])),
        ..Default::default()
    })
}

/// Publishes and removes bundles
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BundlePublisher: Send + Sync {
    /// Apply every object of the bundle and prune objects no longer part of it.
    ///
    /// Returns the published version. Publishing identical content again has
    /// no observable effect.
    async fn publish(&self, bundle: &Bundle) -> Result<String, BundleError>;

    /// Request deletion of every object of a bundle and return what was requested.
    ///
    /// Unknown bundles are not an error and yield no objects.
    async fn delete(&self, name: &str, namespace: &str) -> Result<Vec<ObjectRef>, BundleError>;

    /// Wait until every one of `objects` is gone, then drop the inventory
    async fn wait_until_deleted(
        &self,
        name: &str,
        namespace: &str,
        objects: &[ObjectRef],
        timeout: Duration,
    ) -> Result<(), BundleError>;
}

/// [`BundlePublisher`] backed by the Kubernetes API
pub struct KubeBundlePublisher {
    client: Client,
    poll_interval: Duration,
}

impl KubeBundlePublisher {
    pub fn new(client: Client, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    fn inventory_api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn read_inventory(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Vec<ObjectRef>>, BundleError> {
        let Some(cm) = self
            .inventory_api(namespace)
            .get_opt(&inventory_name(name))
            .await?
        else {
            return Ok(None);
        };

        let raw = cm
            .data
            .as_ref()
            .and_then(|d| d.get(INVENTORY_OBJECTS_KEY))
            .map(String::as_str)
            .unwrap_or("[]");
        let refs = serde_json::from_str(raw).map_err(|source| BundleError::Inventory {
            bundle: name.to_string(),
            source,
        })?;
        Ok(Some(refs))
    }

    async fn write_inventory(&self, bundle: &Bundle, version: &str) -> Result<(), BundleError> {
        self.inventory_api(bundle.namespace())
            .patch(
                &inventory_name(bundle.name()),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&inventory(bundle, version)?),
            )
            .await?;
        Ok(())
    }

    async fn delete_object(&self, object: &ObjectRef) -> Result<(), BundleError> {
        match object
            .api(&self.client)
            .delete(&object.name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                debug!(object = %object, "Deleted object");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remaining(&self, refs: &[ObjectRef]) -> Result<usize, BundleError> {
        let mut remaining = 0;
        for object in refs {
            if object.api(&self.client).get_opt(&object.name).await?.is_some() {
                remaining += 1;
            }
        }
        Ok(remaining)
    }
}

#[async_trait]
impl BundlePublisher for KubeBundlePublisher {
    #[instrument(skip(self, bundle), fields(bundle = %bundle.name()))]
    async fn publish(&self, bundle: &Bundle) -> Result<String, BundleError> {
        let version = bundle.version()?;
        let previous = self
            .read_inventory(bundle.name(), bundle.namespace())
            .await?
            .unwrap_or_default();

        let params = PatchParams::apply(FIELD_MANAGER).force();
        for object in bundle.objects() {
            let reference = object.reference();
            reference
                .api(&self.client)
                .patch(object.name(), &params, &Patch::Apply(object.object()))
                .await?;
            debug!(object = %reference, "Applied object");
        }

        let current: BTreeSet<ObjectRef> = bundle.refs().into_iter().collect();
        let stale: Vec<&ObjectRef> = previous.iter().filter(|r| !current.contains(r)).collect();
        for object in stale.iter().rev() {
            info!(object = %object, "Pruning object no longer part of bundle");
            self.delete_object(object).await?;
        }

        self.write_inventory(bundle, &version).await?;

        info!(
            version = %version,
            objects = bundle.objects().len(),
            pruned = stale.len(),
            "Published bundle"
        );
        Ok(version)
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str, namespace: &str) -> Result<Vec<ObjectRef>, BundleError> {
        let Some(refs) = self.read_inventory(name, namespace).await? else {
            debug!("No inventory, nothing to delete");
            return Ok(Vec::new());
        };

        for object in refs.iter().rev() {
            self.delete_object(object).await?;
        }
        info!(objects = refs.len(), "Requested bundle deletion");
        Ok(refs)
    }

    #[instrument(skip(self, objects), fields(objects = objects.len()))]
    async fn wait_until_deleted(
        &self,
        name: &str,
        namespace: &str,
        objects: &[ObjectRef],
        timeout: Duration,
    ) -> Result<(), BundleError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.remaining(objects).await?;
            if remaining == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(remaining, timeout_secs = timeout.as_secs(), "Bundle deletion timed out");
                return Err(BundleError::DeleteTimeout {
                    bundle: name.to_string(),
                    timeout,
                    remaining,
                });
            }
            debug!(remaining, "Waiting for bundle objects to disappear");
            sleep(self.poll_interval.min(deadline - now)).await;
        }

        match self
            .inventory_api(namespace)
            .delete(&inventory_name(name), &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        info!("Bundle deleted");
        Ok(())
    }
}
