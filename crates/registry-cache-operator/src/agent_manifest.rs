//! Node agent packaging
//!
//! The rendered fragment is shipped in a ConfigMap mounted into a privileged
//! DaemonSet on every node. The agent is only told where the fragment lives,
//! mirror data never appears on its command line.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, HostPathVolumeSource, PodSpec,
    PodTemplateSpec, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use registry_cache_common::names::{annotations, host, labels, FIELD_MANAGER};

use crate::mirror::RenderedArtifact;
use crate::settings::OperatorSettings;

/// Name of the agent ConfigMap, DaemonSet and container
pub const AGENT_NAME: &str = "cri-config-ensurer";

const WORK_VOLUME: &str = "work";
const HOST_VOLUME: &str = "host";

#[derive(Debug, Clone)]
pub struct AgentManifest {
    pub config_map: ConfigMap,
    pub daemon_set: DaemonSet,
}

fn agent_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(labels::APP.to_string(), AGENT_NAME.to_string())])
}

pub struct AgentManifestBuilder<'a> {
    settings: &'a OperatorSettings,
}

impl<'a> AgentManifestBuilder<'a> {
    pub fn new(settings: &'a OperatorSettings) -> Self {
        Self { settings }
    }

    pub fn build(&self, artifact: &RenderedArtifact) -> AgentManifest {
        let namespace = self.settings.cache_namespace.clone();
        let mut object_labels = agent_labels();
        object_labels.insert(labels::MANAGED_BY.to_string(), FIELD_MANAGER.to_string());

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(AGENT_NAME.to_string()),
                namespace: Some(namespace.clone()),
                labels: Some(object_labels.clone()),
                annotations: Some(BTreeMap::from([(
                    annotations::ARTIFACT_DIGEST.to_string(),
                    artifact.digest(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                host::FRAGMENT_NAME.to_string(),
                artifact.content().to_string(),
            )])),
            ..Default::default()
        };

        let input = format!("{}/{}", host::WORK_DIR, host::FRAGMENT_NAME);
        let container = Container {
            name: AGENT_NAME.to_string(),
            image: Some(self.settings.agent_image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec!["--input".to_string(), input]),
            env: Some(vec![
                EnvVar {
                    name: "AGENT_HOST_ROOT".to_string(),
                    value: Some(host::HOST_ROOT.to_string()),
                    ..Default::default()
                },
                EnvVar {
                    name: "RUST_LOG".to_string(),
                    value: Some("info".to_string()),
                    ..Default::default()
                },
            ]),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: WORK_VOLUME.to_string(),
                    mount_path: host::WORK_DIR.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
                VolumeMount {
                    name: HOST_VOLUME.to_string(),
                    mount_path: host::HOST_ROOT.to_string(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let daemon_set = DaemonSet {
            metadata: ObjectMeta {
                name: Some(AGENT_NAME.to_string()),
                namespace: Some(namespace),
                labels: Some(object_labels.clone()),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(agent_labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(object_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        host_pid: Some(true),
                        containers: vec![container],
                        tolerations: Some(vec![Toleration {
                            operator: Some("Exists".to_string()),
                            ..Default::default()
                        }]),
                        volumes: Some(vec![
                            Volume {
                                name: WORK_VOLUME.to_string(),
                                config_map: Some(ConfigMapVolumeSource {
                                    name: AGENT_NAME.to_string().into(),
                                    default_mode: Some(0o644),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                            Volume {
                                name: HOST_VOLUME.to_string(),
                                host_path: Some(HostPathVolumeSource {
                                    path: "/".to_string(),
                                    type_: Some("Directory".to_string()),
                                }),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        AgentManifest {
            config_map,
            daemon_set,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MirrorDirective;

    fn artifact() -> RenderedArtifact {
        let mut directive = MirrorDirective::default();
        directive
            .insert("gcr.io".to_string(), "10.0.0.2:5000".parse().unwrap())
            .unwrap();
        directive.render().unwrap()
    }

    #[test]
    fn test_config_map_carries_artifact() {
        let settings = OperatorSettings::default();
        let artifact = artifact();
        let manifest = AgentManifestBuilder::new(&settings).build(&artifact);

        let data = manifest.config_map.data.as_ref().unwrap();
        assert_eq!(
            data.get(host::FRAGMENT_NAME).map(String::as_str),
            Some(artifact.content())
        );
        let digest = manifest
            .config_map
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::ARTIFACT_DIGEST))
            .cloned();
        assert_eq!(digest, Some(artifact.digest()));
    }

    #[test]
    fn test_daemon_set_privileges_and_mounts() {
        let settings = OperatorSettings::default();
        let manifest = AgentManifestBuilder::new(&settings).build(&artifact());

        let pod = manifest
            .daemon_set
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .unwrap();
        assert_eq!(pod.host_pid, Some(true));

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry-cache-agent:latest"));
        assert_eq!(
            container.security_context.as_ref().and_then(|s| s.privileged),
            Some(true)
        );

        let mounts = container.volume_mounts.as_ref().unwrap();
        let work = mounts.iter().find(|m| m.name == WORK_VOLUME).unwrap();
        assert_eq!(work.mount_path, "/work");
        assert_eq!(work.read_only, Some(true));
        let host_mount = mounts.iter().find(|m| m.name == HOST_VOLUME).unwrap();
        assert_eq!(host_mount.mount_path, "/host");

        let volumes = pod.volumes.as_ref().unwrap();
        let host_volume = volumes.iter().find(|v| v.name == HOST_VOLUME).unwrap();
        assert_eq!(host_volume.host_path.as_ref().unwrap().path, "/");
    }

    #[test]
    fn test_command_line_names_only_the_input() {
        let settings = OperatorSettings::default();
        let manifest = AgentManifestBuilder::new(&settings).build(&artifact());
        let pod = manifest.daemon_set.spec.unwrap().template.spec.unwrap();
        let args = pod.containers[0].args.clone().unwrap();
        assert_eq!(
            args,
            vec![
                "--input".to_string(),
                "/work/zz-extension-registry-cache.toml".to_string()
            ]
        );
        assert!(pod.containers[0].command.is_none());
    }

    #[test]
    fn test_objects_live_in_cache_namespace() {
        let settings = OperatorSettings {
            cache_namespace: "mirrors".to_string(),
            ..Default::default()
        };
        let manifest = AgentManifestBuilder::new(&settings).build(&artifact());
        assert_eq!(manifest.config_map.metadata.namespace.as_deref(), Some("mirrors"));
        assert_eq!(manifest.daemon_set.metadata.namespace.as_deref(), Some("mirrors"));
    }
}
