use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::community::Community as CommunityRecord;
use crate::endpoint::TunnelEndpoint;

/// Declares a full-mesh set: every pair of members establishes a tunnel when
/// both exist. Authored by the user, mirrored verbatim into the store.
#[derive(CustomResource, Deserialize, Serialize, Default, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "fabedge.io",
    version = "v1alpha1",
    kind = "Community",
    derive = "Default"
)]
pub struct CommunitySpec {
    pub members: Vec<String>,
}

impl Community {
    pub fn to_record(&self) -> Option<CommunityRecord> {
        let name = self.metadata.name.as_ref()?;

        Some(CommunityRecord::new(name.clone(), self.spec.members.clone()))
    }
}

/// One record per federated cluster, host side. The host mirrors each
/// member's endpoints here from PUT traffic and maintains the member's
/// enrollment token; the heartbeat drives stale-member pruning.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Default, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "fabedge.io",
    version = "v1alpha1",
    kind = "Cluster",
    status = "ClusterStatus",
    derive = "Default"
)]
pub struct ClusterSpec {
    /// a one-shot bootstrap token the member uses to enroll
    pub token: Option<String>,
    /// the endpoints this cluster exports, mostly its connector
    #[serde(default)]
    pub endpoints: Vec<TunnelEndpoint>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// RFC 3339 timestamp of the last endpoint report from this cluster
    pub last_heartbeat: Option<String>,
    /// SHA-256 fingerprint of the client certificate issued at enrollment
    pub client_cert_fingerprint: Option<String>,
}

/// A Calico allocation block. Only the fields the operator mirrors are
/// declared; everything else in the object is ignored.
#[derive(CustomResource, Deserialize, Serialize, Default, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "crd.projectcalico.org",
    version = "v1",
    kind = "IPAMBlock",
    derive = "Default"
)]
pub struct IPAMBlockSpec {
    pub cidr: String,
    pub affinity: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl IPAMBlock {
    /// The node this block is affine to, from the `host:<node>` affinity.
    pub fn node_name(&self) -> Option<&str> {
        self.spec.affinity.as_deref()?.strip_prefix("host:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn community_crd_maps_to_record() {
        let mut community = Community::new("edges", CommunitySpec {
            members: vec!["bj.edge1".into(), "bj.edge1".into(), "bj.edge2".into()],
        });

        let record = community.to_record().unwrap();
        assert_eq!(record.name, "edges");
        assert_eq!(record.members.len(), 2);

        community.metadata.name = None;
        assert!(community.to_record().is_none());
    }

    #[test]
    fn ipam_block_affinity_yields_node_name() {
        let mut block = IPAMBlock::new("10-244-0-0-26", IPAMBlockSpec {
            cidr: "10.244.0.0/26".into(),
            affinity: Some("host:worker-1".into()),
            deleted: false,
        });
        assert_eq!(block.node_name(), Some("worker-1"));

        block.spec.affinity = Some("virtual:foo".into());
        assert_eq!(block.node_name(), None);

        block.spec.affinity = None;
        assert_eq!(block.node_name(), None);
    }
}
