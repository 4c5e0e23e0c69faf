use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CniType {
    Calico,
    Flannel,
}

#[derive(Debug, Parser)]
#[command(version, about = "The FabEdge connector manager")]
pub struct Cli {
    /// namespace holding the connector config object
    #[arg(long, default_value = fabedge_core::DEFAULT_NAMESPACE)]
    pub namespace: String,
    /// name of the connector config object to watch
    #[arg(long, default_value = fabedge_core::resources::connector::CONNECTOR_CONFIG_NAME)]
    pub config_name: String,
    /// the CNI used by this cluster
    #[arg(long, value_enum)]
    pub cni_type: CniType,

    /// interval between synchronizations of tunnels, routes, ipset and iptables
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub sync_period: Duration,
    /// quiet window applied after a config change before resynchronizing
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub debounce_duration: Duration,

    /// path of the IPsec daemon's command socket
    #[arg(long, default_value = "/run/strongswan/charon.vici")]
    pub vici_socket: String,
    /// path of the connector's TLS certificate, as mounted next to the daemon
    #[arg(long, default_value = "/etc/fabedge/tls/tls.crt")]
    pub cert_file: String,
    /// interface carrying tunneled traffic towards the edges
    #[arg(long, default_value = "eth0")]
    pub tunnel_interface: String,
    /// SNAT cloud-bound traffic from edge pods
    #[arg(long)]
    pub enable_masquerade: bool,

    /// cloud-agent addresses seeding the gossip cluster
    #[arg(long, value_delimiter = ',')]
    pub init_members: Vec<SocketAddr>,
    /// address the gossip endpoint binds to
    #[arg(long, default_value = "0.0.0.0:7946")]
    pub gossip_listen_address: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployment_layout() {
        let cli = Cli::parse_from(["fabedge-connector", "--cni-type", "flannel"]);

        assert_eq!(cli.namespace, "fabedge");
        assert_eq!(cli.config_name, "fabedge-connector-config");
        assert_eq!(cli.vici_socket, "/run/strongswan/charon.vici");
        assert_eq!(cli.sync_period, Duration::from_secs(5));
        assert!(!cli.enable_masquerade);
        assert!(cli.init_members.is_empty());
    }

    #[test]
    fn init_members_accept_a_comma_separated_list() {
        let cli = Cli::parse_from([
            "fabedge-connector",
            "--cni-type",
            "calico",
            "--init-members",
            "10.0.0.1:7946,10.0.0.2:7946",
        ]);

        assert_eq!(cli.init_members.len(), 2);
    }
}
