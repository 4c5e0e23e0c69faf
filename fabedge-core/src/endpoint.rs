use std::fmt::Display;

use ipnet::IpNet;
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum EndpointType {
    #[default]
    EdgeNode,
    Connector,
}

/// Identity of one participant in the IPsec mesh.
///
/// An endpoint is either an edge node or a cluster's connector. Its name is
/// globally unique across federated clusters (`<cluster>.<node>` or
/// `<cluster>.connector`), its id is the X.509 distinguished name used as
/// the IPsec peer identity.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEndpoint {
    pub name: String,
    pub id: String,
    #[serde(rename = "type", default)]
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub public_addresses: Vec<String>,
    #[serde(default)]
    #[schemars(with = "Vec<String>")]
    pub subnets: Vec<IpNet>,
    #[serde(default)]
    #[schemars(with = "Vec<String>")]
    pub node_subnets: Vec<IpNet>,
}

impl TunnelEndpoint {
    /// An endpoint is usable only when it is reachable and routes something.
    pub fn is_valid(&self) -> bool {
        !self.public_addresses.is_empty() && !self.subnets.is_empty() && !self.node_subnets.is_empty()
    }

    /// The `<cluster>` part of the endpoint name.
    pub fn cluster_prefix(&self) -> Option<&str> {
        self.name.split_once('.').map(|(cluster, _)| cluster)
    }
}

impl Display for TunnelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Derives endpoint names and IPsec identities for one cluster.
#[derive(Debug, Clone)]
pub struct EndpointNamer {
    cluster: String,
    id_format: String,
}

pub const CONNECTOR_NODE_NAME: &str = "connector";

impl EndpointNamer {
    pub fn new(cluster: impl Into<String>, id_format: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            id_format: id_format.into(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn endpoint_name(&self, node_name: &str) -> String {
        format!("{}.{}", self.cluster, node_name)
    }

    pub fn endpoint_id(&self, node_name: &str) -> String {
        self.id_format
            .replace("{node}", &self.endpoint_name(node_name))
    }

    pub fn connector_name(&self) -> String {
        self.endpoint_name(CONNECTOR_NODE_NAME)
    }

    pub fn connector_id(&self) -> String {
        self.endpoint_id(CONNECTOR_NODE_NAME)
    }

    /// Whether a federated endpoint name belongs to this cluster.
    pub fn is_local_name(&self, endpoint_name: &str) -> bool {
        endpoint_name
            .split_once('.')
            .map(|(cluster, _)| cluster == self.cluster)
            .unwrap_or(false)
    }
}

/// Splits a distinguished-name template such as
/// `C=CN, O=fabedge.io, CN=bj.edge1` into its attribute pairs. Malformed
/// segments are dropped with a warning since they usually indicate a typo in
/// the configured id format.
pub fn parse_dn_pairs(dn: &str) -> Vec<(String, String)> {
    dn.split(',')
        .filter_map(|segment| {
            let segment = segment.trim();
            if segment.is_empty() {
                return None;
            }

            match segment.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Some((key.trim().to_owned(), value.trim().to_owned()))
                }
                _ => {
                    warn!("Ignoring malformed DN segment '{segment}'!");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> TunnelEndpoint {
        TunnelEndpoint {
            name: name.to_owned(),
            id: format!("C=CN, O=fabedge.io, CN={name}"),
            endpoint_type: EndpointType::EdgeNode,
            public_addresses: vec!["192.0.2.10".into()],
            subnets: vec!["10.10.1.0/24".parse().unwrap()],
            node_subnets: vec!["192.0.2.10/32".parse().unwrap()],
        }
    }

    #[test]
    fn endpoint_without_required_fields_is_invalid() {
        let mut ep = endpoint("bj.edge1");
        assert!(ep.is_valid());

        ep.public_addresses.clear();
        assert!(!ep.is_valid());

        let mut ep = endpoint("bj.edge1");
        ep.subnets.clear();
        assert!(!ep.is_valid());

        let mut ep = endpoint("bj.edge1");
        ep.node_subnets.clear();
        assert!(!ep.is_valid());
    }

    #[test]
    fn namer_derives_names_and_ids() {
        let namer = EndpointNamer::new("bj", "C=CN, O=fabedge.io, CN={node}");

        assert_eq!(namer.endpoint_name("edge1"), "bj.edge1");
        assert_eq!(namer.endpoint_id("edge1"), "C=CN, O=fabedge.io, CN=bj.edge1");
        assert_eq!(namer.connector_name(), "bj.connector");
        assert!(namer.is_local_name("bj.edge1"));
        assert!(!namer.is_local_name("sh.edge1"));
        assert!(!namer.is_local_name("no-dot"));
    }

    #[test]
    fn endpoint_serializes_with_wire_field_names() {
        let json = serde_json::to_value(endpoint("bj.edge1")).unwrap();

        assert_eq!(json["name"], "bj.edge1");
        assert_eq!(json["type"], "EdgeNode");
        assert_eq!(json["publicAddresses"][0], "192.0.2.10");
        assert_eq!(json["subnets"][0], "10.10.1.0/24");
        assert_eq!(json["nodeSubnets"][0], "192.0.2.10/32");
    }

    #[test]
    fn dn_pairs_are_parsed_in_order() {
        let pairs = parse_dn_pairs("C=CN, O=fabedge.io, CN=bj.edge1");

        assert_eq!(
            pairs,
            vec![
                ("C".to_owned(), "CN".to_owned()),
                ("O".to_owned(), "fabedge.io".to_owned()),
                ("CN".to_owned(), "bj.edge1".to_owned()),
            ]
        );
    }

    #[test]
    fn malformed_dn_segments_are_dropped() {
        let pairs = parse_dn_pairs("C=CN, bogus, CN=bj.edge1");

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].0, "CN");
    }
}
