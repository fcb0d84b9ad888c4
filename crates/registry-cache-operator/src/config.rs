//! CRD types for the declared registry cache configuration

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Bundle holding the cache namespace, Services and StatefulSets
pub const REGISTRY_RESOURCE_NAME: &str = "extension-registry-cache";

/// Bundle holding the node agent ConfigMap and DaemonSet
pub const REGISTRY_ENSURER_RESOURCE_NAME: &str = "extension-registry-cache-cri-ensurer";

/// Finalizer guarding bundle deletion
pub const FINALIZER: &str = "registry-cache.extensions.io/finalizer";

const READY_CONDITION: &str = "Ready";

/// A registry cache to deploy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCache {
    /// Remote registry host (and optionally port) to cache
    pub upstream: String,
    /// Size of the cache volume, defaults to the operator setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Enables cache garbage collection, defaults to true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection_enabled: Option<bool>,
    /// StorageClass for the cache volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// RegistryConfig spec
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "registry-cache.extensions.io",
    version = "v1alpha1",
    kind = "RegistryConfig",
    plural = "registryconfigs",
    shortname = "rcc",
    namespaced = true,
    status = "RegistryConfigStatus",
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Digest", "type":"string", "jsonPath":".status.artifactDigest"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfigSpec {
    /// Registry caches to deploy
    #[serde(default)]
    pub caches: Vec<RegistryCache>,
}

/// A cache that was deployed and discovered
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// Upstream as host[:port]
    pub upstream: String,
    /// Derived cache name
    pub name: String,
    /// Endpoint nodes pull through
    pub endpoint: String,
}

/// RegistryConfig status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfigStatus {
    /// Generation the status refers to
    pub observed_generation: Option<i64>,
    /// Whether the mirror configuration was published
    #[serde(default)]
    pub ready: bool,
    /// Discovered caches
    #[serde(default)]
    pub caches: Vec<CacheStatus>,
    /// Digest of the published mirror configuration
    pub artifact_digest: Option<String>,
    /// Last time the status changed
    pub last_reconcile_time: Option<String>,
    /// Failure of the last reconcile, cleared on success
    pub error: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Status condition, only `Ready` is reported
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// `True` or `False`
    pub status: String,
    /// RFC 3339 time `status` last flipped
    pub last_transition_time: String,
    /// CamelCase cause, e.g. `DiscoveryTimeout`
    pub reason: String,
    pub message: String,
}

impl Condition {
    pub fn ready(ready: bool, reason: &str, message: &str) -> Self {
        let status = match ready {
            true => "True",
            false => "False",
        };
        Self {
            type_: READY_CONDITION.to_string(),
            status: status.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Keep the transition time of a previous condition of the same type and status
    pub fn since(mut self, previous: &[Condition]) -> Self {
        if let Some(prev) = previous
            .iter()
            .find(|c| c.type_ == self.type_ && c.status == self.status)
        {
            self.last_transition_time = prev.last_transition_time.clone();
        }
        self
    }
}
