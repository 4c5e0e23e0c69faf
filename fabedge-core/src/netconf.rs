use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint::TunnelEndpoint;

/// The key under which a network config is stored in its ConfigMap.
pub const NETCONF_KEY: &str = "netconf.json";

#[derive(Debug, Error)]
pub enum NetconfError {
    #[error("Network config couldn't be decoded! Reason: {}", .0)]
    Decode(serde_json::Error),
    #[error("Network config couldn't be encoded! Reason: {}", .0)]
    Encode(serde_json::Error),
}

/// The published tunnel configuration consumed by the connector and by the
/// per-node agents: the consumer's own endpoint plus everything it must
/// tunnel to.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub local_endpoint: TunnelEndpoint,
    pub peers: Vec<TunnelEndpoint>,
}

impl NetworkConfig {
    pub fn new(local_endpoint: TunnelEndpoint, mut peers: Vec<TunnelEndpoint>) -> Self {
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers.dedup_by(|a, b| a.name == b.name);

        Self {
            local_endpoint,
            peers,
        }
    }

    pub fn to_json(&self) -> Result<String, NetconfError> {
        serde_json::to_string_pretty(self).map_err(NetconfError::Encode)
    }

    pub fn from_json(data: &str) -> Result<Self, NetconfError> {
        serde_json::from_str(data).map_err(NetconfError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointType;

    fn endpoint(name: &str) -> TunnelEndpoint {
        TunnelEndpoint {
            name: name.to_owned(),
            id: format!("C=CN, O=fabedge.io, CN={name}"),
            endpoint_type: EndpointType::EdgeNode,
            public_addresses: vec!["192.0.2.1".into()],
            subnets: vec!["10.10.1.0/24".parse().unwrap()],
            node_subnets: vec!["192.0.2.1/32".parse().unwrap()],
        }
    }

    #[test]
    fn peers_are_sorted_and_deduplicated() {
        let config = NetworkConfig::new(
            endpoint("bj.connector"),
            vec![endpoint("bj.edge2"), endpoint("bj.edge1"), endpoint("bj.edge2")],
        );

        let names: Vec<_> = config.peers.iter().map(|peer| peer.name.as_str()).collect();
        assert_eq!(names, vec!["bj.edge1", "bj.edge2"]);
    }

    #[test]
    fn json_roundtrip_preserves_config() {
        let config = NetworkConfig::new(endpoint("bj.connector"), vec![endpoint("bj.edge1")]);

        let parsed = NetworkConfig::from_json(&config.to_json().unwrap()).unwrap();

        assert_eq!(parsed, config);
    }
}
