pub mod cert;
pub mod community;
pub mod crds;
pub mod endpoint;
pub mod ip;
pub mod kubernetes;
pub mod netconf;
pub mod proto;
pub mod resources;
pub mod store;
pub mod token;

pub const DEFAULT_NAMESPACE: &str = "fabedge";

/// Annotation carrying a manual override for a node's public addresses,
/// comma separated.
pub const PUBLIC_ADDRESSES_ANNOTATION: &str = "fabedge.io/node-public-addresses";

/// Annotation recording the pod CIDRs the operator allocated for an edge
/// node (Calico clusters only), comma separated.
pub const EDGE_POD_CIDRS_ANNOTATION: &str = "fabedge.io/edge-pod-cidrs";

/// The CN suffix every member API client certificate must carry.
pub const API_CLIENT_CN_SUFFIX: &str = "fabedge-client";

pub fn api_client_common_name(cluster: &str) -> String {
    format!("{cluster}.{API_CLIENT_CN_SUFFIX}")
}
