use async_trait::async_trait;

use fabedge_core::endpoint::TunnelEndpoint;

pub mod strongswan;
pub mod vici;

pub use strongswan::StrongSwanManager;
pub use vici::ViciError;

/// The desired shape of one IPsec connection: who we are, who the peer is,
/// and which traffic selectors the child SA carries. Two configs comparing
/// equal means the loaded connection needs no touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnConfig {
    pub name: String,
    pub local_id: String,
    pub remote_id: String,
    pub remote_addresses: Vec<String>,
    pub local_subnets: Vec<String>,
    pub remote_subnets: Vec<String>,
}

impl ConnConfig {
    /// Derives the connection for one peer endpoint, named after the peer.
    pub fn for_peer(local: &TunnelEndpoint, peer: &TunnelEndpoint) -> Self {
        Self {
            name: peer.name.clone(),
            local_id: local.id.clone(),
            remote_id: peer.id.clone(),
            remote_addresses: peer.public_addresses.clone(),
            local_subnets: local.subnets.iter().map(|net| net.to_string()).collect(),
            remote_subnets: peer.subnets.iter().map(|net| net.to_string()).collect(),
        }
    }
}

/// What the connector needs from the IPsec daemon. A single implementation
/// talks to strongswan over its command socket; the trait exists so the
/// sync logic stays testable without a daemon.
#[async_trait]
pub trait TunnelManager: Send {
    async fn load_conn(&mut self, conn: &ConnConfig) -> Result<(), ViciError>;

    async fn unload_conn(&mut self, name: &str) -> Result<(), ViciError>;

    async fn list_conn_names(&mut self) -> Result<Vec<String>, ViciError>;

    /// Whether at least one security association is up.
    async fn is_active(&mut self) -> Result<bool, ViciError>;
}

#[cfg(test)]
mod tests {
    use fabedge_core::endpoint::EndpointType;

    use super::*;

    fn endpoint(name: &str, subnet: &str) -> TunnelEndpoint {
        TunnelEndpoint {
            name: name.to_owned(),
            id: format!("C=CN, O=fabedge.io, CN={name}"),
            endpoint_type: EndpointType::EdgeNode,
            public_addresses: vec!["203.0.113.7".into()],
            subnets: vec![subnet.parse().unwrap()],
            node_subnets: vec!["192.0.2.7/32".parse().unwrap()],
        }
    }

    #[test]
    fn conn_config_is_keyed_by_the_tunnel_tuple() {
        let local = endpoint("bj.connector", "10.233.0.0/16");
        let peer = endpoint("sh.edge1", "10.20.1.0/26");

        let conn = ConnConfig::for_peer(&local, &peer);
        assert_eq!(conn.name, "sh.edge1");
        assert_eq!(conn.local_id, "C=CN, O=fabedge.io, CN=bj.connector");
        assert_eq!(conn.remote_subnets, vec!["10.20.1.0/26"]);

        // identical inputs produce an identical (no-op) config
        assert_eq!(conn, ConnConfig::for_peer(&local, &peer));

        // a subnet change is a config change
        let peer_changed = endpoint("sh.edge1", "10.20.2.0/26");
        assert_ne!(conn, ConnConfig::for_peer(&local, &peer_changed));
    }
}
