use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, bail};
use clap::{Parser, ValueEnum};
use ipnet::{IpNet, Ipv4Net};
use regex::Regex;

use fabedge_core::ip::{nets_overlap, parse_subnets};

pub const DEFAULT_ENDPOINT_ID_FORMAT: &str = "C=CN, O=fabedge.io, CN={node}";
pub const DEFAULT_EDGE_LABELS: &str = "node-role.kubernetes.io/edge=";

// from client-go's leader election
const LEADER_JITTER_FACTOR: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClusterRole {
    Host,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CniType {
    Calico,
    Flannel,
}

impl Display for CniType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CniType::Calico => f.write_str("calico"),
            CniType::Flannel => f.write_str("flannel"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "The FabEdge cluster operator")]
pub struct Cli {
    /// name of this cluster, unique among all federated clusters (RFC 1123 DNS label)
    #[arg(long)]
    pub cluster: String,
    /// role of this cluster in the federation
    #[arg(long, value_enum, default_value_t = ClusterRole::Host)]
    pub cluster_role: ClusterRole,
    /// namespace in which the operator gets or creates objects
    #[arg(long, default_value = fabedge_core::DEFAULT_NAMESPACE)]
    pub namespace: String,
    /// the CNI used by this cluster
    #[arg(long, value_enum)]
    pub cni_type: CniType,

    /// range of IP addresses for edge pods; when set the operator allocates a
    /// CIDR block for every edge node (required with Calico)
    #[arg(long)]
    pub edge_pod_cidr: Option<Ipv4Net>,
    /// prefix length of the per-node blocks carved out of edge-pod-cidr
    #[arg(long, default_value_t = 26)]
    pub edge_pod_cidr_block_size: u8,
    /// id format of tunnel endpoints, {node} is substituted
    #[arg(long, default_value = DEFAULT_ENDPOINT_ID_FORMAT)]
    pub endpoint_id_format: String,
    /// labels selecting edge nodes, e.g. key2=,key3=value3
    #[arg(long, value_delimiter = ',', default_value = DEFAULT_EDGE_LABELS)]
    pub edge_labels: Vec<String>,

    /// the connector's public addresses, reachable from every edge node
    #[arg(long, value_delimiter = ',', required = true)]
    pub connector_public_addresses: Vec<String>,
    /// subnets served by the connector, mostly pod and service CIDRs
    #[arg(long, value_delimiter = ',')]
    pub connector_subnets: Vec<String>,
    /// interval between connector config synchronizations
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub connector_config_sync_interval: Duration,
    /// quiet window applied to bursts of store changes before republishing
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub connector_config_debounce: Duration,

    /// image of the agent container of agent pods
    #[arg(long, default_value = "fabedge/agent:latest")]
    pub agent_image: String,
    /// image of the strongswan container of agent pods
    #[arg(long, default_value = "fabedge/strongswan:latest")]
    pub agent_strongswan_image: String,
    /// imagePullPolicy for all containers of agent pods
    #[arg(long, default_value = "IfNotPresent")]
    pub agent_image_pull_policy: String,
    /// log level of agents
    #[arg(long, default_value_t = 3)]
    pub agent_log_level: i32,
    /// let agents use xfrm if the edge OS supports it
    #[arg(long)]
    pub agent_use_xfrm: bool,
    /// enable the agent proxy feature
    #[arg(long)]
    pub agent_enable_proxy: bool,
    /// perform outbound NAT from edge pods to outside of the cluster
    #[arg(long)]
    pub agent_masq_outgoing: bool,
    /// enable hairpin mode for edge node pods
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub agent_enable_hairpin: bool,
    /// network plugin MTU on edge nodes
    #[arg(long, default_value_t = 1400)]
    pub agent_mtu: i32,

    /// name of the secret holding the CA cert and key
    #[arg(long, default_value = "fabedge-ca")]
    pub ca_secret: String,
    /// organization name written into issued certs
    #[arg(long, default_value = "fabedge.io")]
    pub cert_organization: String,
    /// validity period for issued certs, in days
    #[arg(long, default_value_t = 3650)]
    pub cert_validity_period: i64,

    /// use lease-based leader election
    #[arg(long)]
    pub leader_election: bool,
    /// name of the lease used for holding the leader lock
    #[arg(long, default_value = "fabedge-operator-leader")]
    pub leader_election_id: String,
    /// duration non-leader candidates wait before force-acquiring leadership
    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration)]
    pub leader_lease_duration: Duration,
    /// duration the acting leader retries refreshing leadership before giving up
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub leader_renew_deadline: Duration,
    /// wait between leader election actions
    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    pub leader_retry_period: Duration,

    /// address the federation API server listens on (host role)
    #[arg(long, default_value = "0.0.0.0:3030")]
    pub api_server_listen_address: SocketAddr,
    /// extra subject alternative names for the API server certificate
    #[arg(long, value_delimiter = ',')]
    pub api_server_cert_sans: Vec<String>,
    /// address of the host cluster's API server (member role)
    #[arg(long)]
    pub api_server_address: Option<String>,
    /// token used to initialize the TLS cert for the API client (member role)
    #[arg(long)]
    pub init_token: Option<String>,
    /// validity duration of enrollment tokens generated for member clusters
    #[arg(long, default_value = "12h", value_parser = humantime::parse_duration)]
    pub token_valid_period: Duration,

    /// interval between federation synchronizations
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub sync_interval: Duration,
    /// member clusters whose last report is older than this have their
    /// endpoints dropped from the store
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pub cluster_expire_duration: Duration,
}

fn dns1123_label() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap())
}

/// Parses `key=value` pairs, an empty value selecting on key existence.
pub fn parse_labels(raw: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();

    for entry in raw {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid label '{entry}', expected key=value"))?;
        if key.is_empty() {
            bail!("invalid label '{entry}', the key must not be empty");
        }

        labels.insert(key.to_owned(), value.to_owned());
    }

    Ok(labels)
}

impl Cli {
    /// Startup validation. Everything here is a config error: fatal, exit
    /// non-zero, nothing has touched the cluster yet.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !dns1123_label().is_match(&self.cluster) {
            bail!("invalid cluster name: {}", self.cluster);
        }

        if self.cluster_role == ClusterRole::Member {
            if self.init_token.is_none() {
                bail!("an initialization token is needed when the cluster role is member");
            }
            if self.api_server_address.is_none() {
                bail!("the host API server address is needed when the cluster role is member");
            }
        }

        if parse_labels(&self.edge_labels)?.is_empty() {
            bail!("edge labels are needed");
        }

        if self.connector_public_addresses.is_empty() {
            bail!("connector public addresses are needed");
        }

        let connector_subnets: Vec<IpNet> = parse_subnets(&self.connector_subnets)?;

        if self.cni_type == CniType::Calico {
            let pool = self
                .edge_pod_cidr
                .ok_or_else(|| anyhow!("an edge pod CIDR is required with Calico"))?;

            if self.edge_pod_cidr_block_size <= pool.prefix_len()
                || self.edge_pod_cidr_block_size > 30
            {
                bail!(
                    "edge pod CIDR block size must lie between {} and 30",
                    pool.prefix_len() + 1
                );
            }

            let pool = IpNet::V4(pool);
            for subnet in &connector_subnets {
                if nets_overlap(&pool, subnet) {
                    bail!("the edge pod CIDR overlaps with connector subnet {subnet}");
                }
            }
        }

        match self.agent_image_pull_policy.as_str() {
            "Always" | "IfNotPresent" | "Never" => {}
            other => bail!("not a supported image pull policy: {other}"),
        }

        self.validate_leader_timings()
    }

    /// Enforces `leaseDuration > renewDeadline > retryPeriod * 1.2 >= 1s`;
    /// the chain bounds the longer periods, so only the jittered retry
    /// period needs the one-second floor.
    fn validate_leader_timings(&self) -> anyhow::Result<()> {
        let lease = self.leader_lease_duration;
        let renew = self.leader_renew_deadline;
        let retry = self.leader_retry_period;

        if lease <= renew {
            bail!("leader lease duration must be greater than the renew deadline");
        }
        if renew.as_secs_f64() <= retry.as_secs_f64() * LEADER_JITTER_FACTOR {
            bail!("leader renew deadline must be greater than retry period * {LEADER_JITTER_FACTOR}");
        }
        if retry.as_secs_f64() * LEADER_JITTER_FACTOR < 1.0 {
            bail!("leader retry period * {LEADER_JITTER_FACTOR} must be at least one second");
        }

        Ok(())
    }
}
