use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipnet::IpNet;
use kube::Client;

use fabedge_core::cert::CertManager;
use fabedge_core::endpoint::EndpointNamer;
use fabedge_core::store::EndpointStore;

use crate::allocator::Allocator;
use crate::cli::CniType;
use crate::pod_cidr_store::PodCidrStore;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub agent_image: String,
    pub strongswan_image: String,
    pub image_pull_policy: String,
    pub log_level: i32,
    pub mtu: i32,
    pub enable_hairpin: bool,
    pub use_xfrm: bool,
    pub masq_outgoing: bool,
    pub enable_proxy: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub public_addresses: Vec<String>,
    pub provided_subnets: Vec<IpNet>,
    pub sync_interval: Duration,
    pub debounce: Duration,
}

/// Everything the controllers share. One instance per process, threaded
/// through explicitly instead of living in globals.
pub struct OperatorContext {
    pub client: Client,
    pub namespace: String,
    pub cni: CniType,
    pub edge_labels: BTreeMap<String, String>,
    pub namer: EndpointNamer,
    pub store: Arc<EndpointStore>,
    pub allocator: Option<Arc<Mutex<Allocator>>>,
    pub pod_cidrs: Arc<PodCidrStore>,
    pub cert_manager: Arc<dyn CertManager>,
    pub agent: AgentOptions,
    pub connector: ConnectorOptions,
}

impl OperatorContext {
    /// `key=value,key2=` selector string for edge nodes.
    pub fn edge_selector(&self) -> String {
        self.edge_labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Selector matching everything that is not an edge node.
    pub fn cloud_selector(&self) -> String {
        self.edge_labels
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    format!("!{key}")
                } else {
                    format!("{key}!={value}")
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}
