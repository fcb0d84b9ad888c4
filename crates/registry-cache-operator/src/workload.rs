//! Cache workload spec builder
//!
//! Builds a single-replica StatefulSet with a persistent cache volume and a
//! ClusterIP Service for one [`UpstreamSpec`]. Construction is pure; objects are
//! applied through the bundle publisher.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Namespace, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use registry_cache_common::names::{annotations, labels, FIELD_MANAGER};
use registry_cache_common::CacheIdentity;

use crate::settings::OperatorSettings;
use crate::upstream::UpstreamSpec;

/// Port the cache server listens on
pub const REGISTRY_PORT: i32 = 5000;
/// Name of the container and its port
pub const REGISTRY_INTERNAL_NAME: &str = "registry-cache";

const CACHE_VOLUME_NAME: &str = "cache-volume";
const CACHE_VOLUME_MOUNT_PATH: &str = "/var/lib/registry";

/// Upstream the cache server proxies to
pub const ENV_REMOTE_URL: &str = "REGISTRY_PROXY_REMOTEURL";
/// Enables blob deletion, which the proxy scheduler uses for garbage collection
pub const ENV_DELETE_ENABLED: &str = "REGISTRY_STORAGE_DELETE_ENABLED";

/// Objects making up one cache
#[derive(Debug, Clone)]
pub struct CacheWorkload {
    pub identity: CacheIdentity,
    pub service: Service,
    pub stateful_set: StatefulSet,
}

/// Selector labels of a cache
pub fn selector_labels(identity: &CacheIdentity) -> BTreeMap<String, String> {
    BTreeMap::from([(labels::APP.to_string(), identity.to_string())])
}

fn object_labels(identity: &CacheIdentity) -> BTreeMap<String, String> {
    let mut result = selector_labels(identity);
    result.insert(labels::UPSTREAM_HOST.to_string(), identity.to_string());
    result.insert(labels::MANAGED_BY.to_string(), FIELD_MANAGER.to_string());
    result
}

/// Builds cache workloads from operator settings
pub struct CacheWorkloadBuilder<'a> {
    settings: &'a OperatorSettings,
}

impl<'a> CacheWorkloadBuilder<'a> {
    pub fn new(settings: &'a OperatorSettings) -> Self {
        Self { settings }
    }

    /// Namespace holding all caches
    pub fn namespace(&self) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(self.settings.cache_namespace.clone()),
                labels: Some(BTreeMap::from([(
                    labels::MANAGED_BY.to_string(),
                    FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn build(&self, spec: &UpstreamSpec) -> CacheWorkload {
        let name = spec.identity.to_string();
        let cache_labels = object_labels(&spec.identity);
        let selector = selector_labels(&spec.identity);

        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.settings.cache_namespace.clone()),
                labels: Some(cache_labels.clone()),
                annotations: Some(BTreeMap::from([(
                    annotations::UPSTREAM.to_string(),
                    spec.upstream.mirror_key(),
                )])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector.clone()),
                ports: Some(vec![ServicePort {
                    name: Some(REGISTRY_INTERNAL_NAME.to_string()),
                    port: REGISTRY_PORT,
                    protocol: Some("TCP".to_string()),
                    target_port: Some(IntOrString::String(REGISTRY_INTERNAL_NAME.to_string())),
                    ..Default::default()
                }]),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = Container {
            name: REGISTRY_INTERNAL_NAME.to_string(),
            image: Some(self.settings.cache_image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            ports: Some(vec![ContainerPort {
                container_port: REGISTRY_PORT,
                name: Some(REGISTRY_INTERNAL_NAME.to_string()),
                ..Default::default()
            }]),
            env: Some(vec![
                EnvVar {
                    name: ENV_REMOTE_URL.to_string(),
                    value: Some(spec.upstream.remote_url()),
                    ..Default::default()
                },
                EnvVar {
                    name: ENV_DELETE_ENABLED.to_string(),
                    value: Some(spec.garbage_collection_enabled.to_string()),
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: CACHE_VOLUME_NAME.to_string(),
                mount_path: CACHE_VOLUME_MOUNT_PATH.to_string(),
                read_only: Some(false),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let volume_claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(CACHE_VOLUME_NAME.to_string()),
                labels: Some(cache_labels.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: spec.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        spec.volume_size.clone(),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let stateful_set = StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.settings.cache_namespace.clone()),
                labels: Some(cache_labels.clone()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                service_name: name.into(),
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(cache_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![volume_claim]),
                ..Default::default()
            }),
            ..Default::default()
        };

        CacheWorkload {
            identity: spec.identity.clone(),
            service,
            stateful_set,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use registry_cache_common::Upstream;

    fn spec(upstream: &str, gc: bool, storage_class: Option<&str>) -> UpstreamSpec {
        UpstreamSpec::new(
            Upstream::parse(upstream).unwrap(),
            Quantity("5Gi".to_string()),
            gc,
            storage_class.map(str::to_string),
        )
    }

    fn env_value(workload: &CacheWorkload, name: &str) -> Option<String> {
        workload.stateful_set.spec.as_ref()?.template.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .clone()
    }

    #[test]
    fn test_names_and_namespace() {
        let settings = OperatorSettings::default();
        let s = spec("gcr.io", true, None);
        let workload = CacheWorkloadBuilder::new(&settings).build(&s);

        assert_eq!(workload.service.metadata.name.as_deref(), Some(s.identity.as_str()));
        assert_eq!(
            workload.stateful_set.metadata.name.as_deref(),
            Some(s.identity.as_str())
        );
        assert_eq!(
            workload.service.metadata.namespace.as_deref(),
            Some("registry-cache")
        );
    }

    #[test]
    fn test_service_is_discoverable() {
        let settings = OperatorSettings::default();
        let s = spec("gcr.io", true, None);
        let workload = CacheWorkloadBuilder::new(&settings).build(&s);

        let svc_labels = workload.service.metadata.labels.as_ref().unwrap();
        assert_eq!(
            svc_labels.get(labels::UPSTREAM_HOST),
            Some(&s.identity.to_string())
        );

        let svc_annotations = workload.service.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            svc_annotations.get(annotations::UPSTREAM).map(String::as_str),
            Some("gcr.io")
        );

        let svc_spec = workload.service.spec.as_ref().unwrap();
        assert_eq!(svc_spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(svc_spec.ports.as_ref().unwrap()[0].port, REGISTRY_PORT);
        assert_eq!(svc_spec.selector, Some(selector_labels(&s.identity)));
    }

    #[test]
    fn test_statefulset_shape() {
        let settings = OperatorSettings::default();
        let s = spec("registry-1.docker.io", false, Some("premium"));
        let workload = CacheWorkloadBuilder::new(&settings).build(&s);

        let sts = workload.stateful_set.spec.as_ref().unwrap();
        assert_eq!(sts.replicas, Some(1));
        let rendered = serde_json::to_value(&workload.stateful_set).unwrap();
        assert_eq!(rendered["spec"]["serviceName"], s.identity.as_str());

        let pod = sts.template.spec.as_ref().unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("registry:2"));

        let claim = &sts.volume_claim_templates.as_ref().unwrap()[0];
        let claim_spec = claim.spec.as_ref().unwrap();
        assert_eq!(claim_spec.storage_class_name.as_deref(), Some("premium"));
        let requests = claim_spec.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests.get("storage"), Some(&Quantity("5Gi".to_string())));
    }

    #[test]
    fn test_cache_parameters() {
        let settings = OperatorSettings::default();
        let workload =
            CacheWorkloadBuilder::new(&settings).build(&spec("localhost:5001", false, None));
        assert_eq!(
            env_value(&workload, ENV_REMOTE_URL).as_deref(),
            Some("https://localhost:5001")
        );
        assert_eq!(
            env_value(&workload, ENV_DELETE_ENABLED).as_deref(),
            Some("false")
        );

        let workload = CacheWorkloadBuilder::new(&settings).build(&spec("quay.io", true, None));
        assert_eq!(env_value(&workload, ENV_DELETE_ENABLED).as_deref(), Some("true"));
    }

    #[test]
    fn test_namespace_uses_settings() {
        let settings = OperatorSettings {
            cache_namespace: "mirrors".to_string(),
            ..Default::default()
        };
        let ns = CacheWorkloadBuilder::new(&settings).namespace();
        assert_eq!(ns.metadata.name.as_deref(), Some("mirrors"));
    }
}
