use std::collections::BTreeMap;

use derive_builder::Builder;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, PodSpec,
    PodTemplateSpec, SecretVolumeSource, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::core::ObjectMeta;

use crate::netconf::{NetworkConfig, NETCONF_KEY};

use super::labels::get_agent_labels;
use super::secret::agent_tls_secret_name;
use super::ResourceGenerationError;

pub fn agent_name(node_name: &str) -> String {
    format!("fabedge-agent-{node_name}")
}

pub fn agent_config_name(node_name: &str) -> String {
    format!("fabedge-agent-config-{node_name}")
}

const TLS_MOUNT_PATH: &str = "/etc/fabedge/tls";
const CONFIG_MOUNT_PATH: &str = "/etc/fabedge";
const IPSEC_RUN_PATH: &str = "/var/run/strongswan";

/// Everything needed to materialize one edge node's agent workload.
#[derive(Debug, Clone, Builder)]
pub struct AgentRelease {
    pub namespace: String,
    pub node_name: String,
    pub endpoint_name: String,
    pub agent_image: String,
    pub strongswan_image: String,
    pub image_pull_policy: String,
    pub log_level: i32,
    pub mtu: i32,
    pub enable_hairpin: bool,
    pub use_xfrm: bool,
    pub masq_outgoing: bool,
    pub enable_proxy: bool,
    pub owner: Option<OwnerReference>,
}

impl AgentRelease {
    pub fn get_name(&self) -> String {
        agent_name(&self.node_name)
    }

    pub fn get_config_name(&self) -> String {
        agent_config_name(&self.node_name)
    }

    pub fn get_secret_name(&self) -> String {
        agent_tls_secret_name(&self.node_name)
    }

    pub fn generate_metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            labels: Some(get_agent_labels(&self.node_name)),
            namespace: Some(self.namespace.to_owned()),
            name: Some(name),
            owner_references: self.owner.as_ref().map(|owner| vec![owner.to_owned()]),
            ..Default::default()
        }
    }

    pub fn generate_configmap(
        &self,
        config: &NetworkConfig,
    ) -> Result<ConfigMap, ResourceGenerationError> {
        let payload = config
            .to_json()
            .map_err(|error| ResourceGenerationError::PayloadEncoding(error.to_string()))?;

        Ok(ConfigMap {
            metadata: self.generate_metadata(self.get_config_name()),
            data: Some(BTreeMap::from([(NETCONF_KEY.to_owned(), payload)])),
            ..Default::default()
        })
    }

    pub fn generate_deployment(&self) -> Deployment {
        let labels = get_agent_labels(&self.node_name);

        let agent_container = Container {
            name: "agent".to_owned(),
            image: Some(self.agent_image.to_owned()),
            image_pull_policy: Some(self.image_pull_policy.to_owned()),
            args: Some(self.agent_args()),
            security_context: privileged_context(),
            volume_mounts: Some(vec![
                mount("tls", TLS_MOUNT_PATH, true),
                mount("netconf", CONFIG_MOUNT_PATH, true),
                mount("ipsec-run", IPSEC_RUN_PATH, false),
            ]),
            ..Default::default()
        };

        let strongswan_container = Container {
            name: "strongswan".to_owned(),
            image: Some(self.strongswan_image.to_owned()),
            image_pull_policy: Some(self.image_pull_policy.to_owned()),
            security_context: privileged_context(),
            volume_mounts: Some(vec![
                mount("tls", TLS_MOUNT_PATH, true),
                mount("ipsec-run", IPSEC_RUN_PATH, false),
            ]),
            ..Default::default()
        };

        let pod_spec = PodSpec {
            automount_service_account_token: Some(false),
            node_name: Some(self.node_name.to_owned()),
            host_network: Some(true),
            containers: vec![agent_container, strongswan_container],
            // edge nodes are routinely tainted; the agent must land anyway
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_owned()),
                ..Default::default()
            }]),
            volumes: Some(vec![
                Volume {
                    name: "tls".to_owned(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(self.get_secret_name()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "netconf".to_owned(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(self.get_config_name()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "ipsec-run".to_owned(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        Deployment {
            metadata: self.generate_metadata(self.get_name()),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_expressions: None,
                    match_labels: Some(labels.to_owned()),
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn agent_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--endpoint-name={}", self.endpoint_name),
            format!("--log-level={}", self.log_level),
            format!("--mtu={}", self.mtu),
        ];

        if self.enable_hairpin {
            args.push("--enable-hairpinmode".to_owned());
        }
        if self.use_xfrm {
            args.push("--use-xfrm".to_owned());
        }
        if self.masq_outgoing {
            args.push("--masq-outgoing".to_owned());
        }
        if self.enable_proxy {
            args.push("--enable-proxy".to_owned());
        }

        args
    }
}

fn privileged_context() -> Option<SecurityContext> {
    Some(SecurityContext {
        allow_privilege_escalation: Some(true),
        capabilities: Some(Capabilities {
            add: Some(vec!["NET_ADMIN".to_owned()]),
            ..Default::default()
        }),
        privileged: Some(true),
        ..Default::default()
    })
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_owned(),
        mount_path: path.to_owned(),
        read_only: Some(read_only),
        ..Default::default()
    }
}
