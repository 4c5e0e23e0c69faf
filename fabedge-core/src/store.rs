use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use log::warn;
use tokio::sync::watch;

use crate::community::Community;
use crate::endpoint::TunnelEndpoint;

/// In-memory registry of tunnel endpoints and communities.
///
/// This is the source of truth for what must be tunneled. Writers are the
/// controllers handling the triggering event; readers get cloned snapshots,
/// so a lookup never observes a half-applied mutation. Removing an endpoint
/// does not touch communities referencing it; stale member names resolve to
/// "absent" when a peer set is materialized.
pub struct EndpointStore {
    inner: RwLock<Inner>,
    version: watch::Sender<u64>,
}

#[derive(Default)]
struct Inner {
    endpoints: HashMap<String, TunnelEndpoint>,
    communities: HashMap<String, Community>,
    // endpoint name -> names of communities it belongs to
    memberships: HashMap<String, BTreeSet<String>>,
}

impl Default for EndpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            version: watch::channel(0).0,
        }
    }

    /// A receiver that changes whenever the store content changes. Used by
    /// the connector controller to debounce config publication.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    /// Stores an endpoint. Entries failing the validity invariant (empty
    /// public addresses, subnets or node subnets) are skipped, not stored.
    /// Re-saving an unchanged endpoint doesn't signal subscribers.
    pub fn save_endpoint(&self, endpoint: TunnelEndpoint) {
        if !endpoint.is_valid() {
            warn!("Skipping invalid endpoint '{}'!", endpoint.name);
            return;
        }

        {
            let mut inner = self.inner.write().unwrap();
            if inner.endpoints.get(&endpoint.name) == Some(&endpoint) {
                return;
            }
            inner.endpoints.insert(endpoint.name.clone(), endpoint);
        }
        self.bump();
    }

    pub fn delete_endpoint(&self, name: &str) {
        let removed = {
            let mut inner = self.inner.write().unwrap();
            inner.endpoints.remove(name).is_some()
        };

        if removed {
            self.bump();
        }
    }

    pub fn get_endpoint(&self, name: &str) -> Option<TunnelEndpoint> {
        self.inner.read().unwrap().endpoints.get(name).cloned()
    }

    pub fn save_community(&self, community: Community) {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.communities.get(&community.name) == Some(&community) {
                return;
            }
            inner.remove_memberships(&community.name);

            for member in &community.members {
                inner
                    .memberships
                    .entry(member.clone())
                    .or_default()
                    .insert(community.name.clone());
            }

            inner.communities.insert(community.name.clone(), community);
        }
        self.bump();
    }

    pub fn delete_community(&self, name: &str) {
        let removed = {
            let mut inner = self.inner.write().unwrap();
            inner.remove_memberships(name);
            inner.communities.remove(name).is_some()
        };

        if removed {
            self.bump();
        }
    }

    pub fn get_communities_by_endpoint(&self, endpoint_name: &str) -> Vec<Community> {
        let inner = self.inner.read().unwrap();

        inner
            .memberships
            .get(endpoint_name)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| inner.communities.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_endpoints_by_community(&self, community_name: &str) -> Vec<TunnelEndpoint> {
        let inner = self.inner.read().unwrap();

        inner
            .communities
            .get(community_name)
            .map(|community| {
                community
                    .members
                    .iter()
                    .filter_map(|member| inner.endpoints.get(member).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The peer set of `endpoint_name`: the union over every community
    /// containing it of the other members that resolve to a stored endpoint.
    /// Sorted by name so repeated materializations compare equal.
    pub fn peers_of(&self, endpoint_name: &str) -> Vec<TunnelEndpoint> {
        let inner = self.inner.read().unwrap();

        let mut names: BTreeSet<&str> = BTreeSet::new();
        if let Some(communities) = inner.memberships.get(endpoint_name) {
            for community_name in communities {
                if let Some(community) = inner.communities.get(community_name) {
                    names.extend(
                        community
                            .members
                            .iter()
                            .map(String::as_str)
                            .filter(|member| *member != endpoint_name),
                    );
                }
            }
        }

        names
            .into_iter()
            .filter_map(|name| inner.endpoints.get(name).cloned())
            .collect()
    }

    /// A consistent snapshot of every endpoint and community, both sorted by
    /// name.
    pub fn snapshot_all(&self) -> (Vec<TunnelEndpoint>, Vec<Community>) {
        let inner = self.inner.read().unwrap();

        let mut endpoints: Vec<_> = inner.endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));

        let mut communities: Vec<_> = inner.communities.values().cloned().collect();
        communities.sort_by(|a, b| a.name.cmp(&b.name));

        (endpoints, communities)
    }

    /// Atomically replaces every endpoint whose cluster prefix differs from
    /// `local_prefix` with the given set, and mirrors the given communities.
    /// Local entries and locally-authored communities are left untouched.
    ///
    /// This is the member-side sync path: the host's answer is authoritative
    /// for everything foreign.
    pub fn replace_foreign(
        &self,
        local_prefix: &str,
        endpoints: Vec<TunnelEndpoint>,
        communities: Vec<Community>,
    ) {
        {
            let mut inner = self.inner.write().unwrap();
            let endpoints_before = inner.endpoints.clone();
            let communities_before = inner.communities.clone();

            inner
                .endpoints
                .retain(|name, _| name.split_once('.').map(|(c, _)| c) == Some(local_prefix));

            for endpoint in endpoints {
                if endpoint.cluster_prefix() == Some(local_prefix) {
                    continue;
                }
                if !endpoint.is_valid() {
                    warn!("Skipping invalid endpoint '{}' from host!", endpoint.name);
                    continue;
                }
                inner.endpoints.insert(endpoint.name.clone(), endpoint);
            }

            for community in communities {
                inner.remove_memberships(&community.name);
                for member in &community.members {
                    inner
                        .memberships
                        .entry(member.clone())
                        .or_default()
                        .insert(community.name.clone());
                }
                inner.communities.insert(community.name.clone(), community);
            }

            if inner.endpoints == endpoints_before && inner.communities == communities_before {
                return;
            }
        }
        self.bump();
    }

    /// Drops every endpoint of one federated cluster. Used by the host when
    /// a member cluster's heartbeat goes stale.
    pub fn remove_cluster(&self, cluster_prefix: &str) {
        let removed = {
            let mut inner = self.inner.write().unwrap();
            let before = inner.endpoints.len();
            inner
                .endpoints
                .retain(|name, _| name.split_once('.').map(|(c, _)| c) != Some(cluster_prefix));
            before != inner.endpoints.len()
        };

        if removed {
            self.bump();
        }
    }
}

impl Inner {
    fn remove_memberships(&mut self, community_name: &str) {
        if let Some(old) = self.communities.get(community_name) {
            let members: Vec<_> = old.members.iter().cloned().collect();
            for member in members {
                if let Some(set) = self.memberships.get_mut(&member) {
                    set.remove(community_name);
                    if set.is_empty() {
                        self.memberships.remove(&member);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointType;

    fn endpoint(name: &str, subnet: &str) -> TunnelEndpoint {
        TunnelEndpoint {
            name: name.to_owned(),
            id: format!("C=CN, O=fabedge.io, CN={name}"),
            endpoint_type: if name.ends_with(".connector") {
                EndpointType::Connector
            } else {
                EndpointType::EdgeNode
            },
            public_addresses: vec!["192.0.2.1".into()],
            subnets: vec![subnet.parse().unwrap()],
            node_subnets: vec!["192.0.2.1/32".parse().unwrap()],
        }
    }

    #[test]
    fn save_and_lookup_roundtrip() {
        let store = EndpointStore::new();
        store.save_endpoint(endpoint("bj.edge1", "10.10.1.0/24"));

        assert_eq!(store.get_endpoint("bj.edge1").unwrap().name, "bj.edge1");

        store.delete_endpoint("bj.edge1");
        assert!(store.get_endpoint("bj.edge1").is_none());
    }

    #[test]
    fn invalid_endpoints_are_not_stored() {
        let store = EndpointStore::new();
        let mut ep = endpoint("bj.edge1", "10.10.1.0/24");
        ep.public_addresses.clear();

        store.save_endpoint(ep);

        assert!(store.get_endpoint("bj.edge1").is_none());
    }

    #[test]
    fn reverse_index_follows_community_updates() {
        let store = EndpointStore::new();
        store.save_community(Community::new("edges", ["bj.edge1", "bj.edge2"]));

        assert_eq!(store.get_communities_by_endpoint("bj.edge1").len(), 1);

        // edge1 drops out of the community on update
        store.save_community(Community::new("edges", ["bj.edge2"]));
        assert!(store.get_communities_by_endpoint("bj.edge1").is_empty());

        store.delete_community("edges");
        assert!(store.get_communities_by_endpoint("bj.edge2").is_empty());
    }

    #[test]
    fn stale_community_members_resolve_to_absent() {
        let store = EndpointStore::new();
        store.save_endpoint(endpoint("bj.edge1", "10.10.1.0/24"));
        store.save_community(Community::new("edges", ["bj.edge1", "bj.gone"]));

        let members = store.get_endpoints_by_community("edges");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "bj.edge1");
    }

    #[test]
    fn peers_are_the_union_of_shared_communities() {
        let store = EndpointStore::new();
        store.save_endpoint(endpoint("bj.connector", "10.233.0.0/16"));
        store.save_endpoint(endpoint("bj.edge1", "10.10.1.0/24"));
        store.save_endpoint(endpoint("bj.edge2", "10.10.2.0/24"));
        store.save_endpoint(endpoint("sh.edge1", "10.20.1.0/24"));

        store.save_community(Community::new("cloud", ["bj.connector", "bj.edge1"]));
        store.save_community(Community::new("cross", ["bj.edge1", "sh.edge1"]));

        let connector_peers = store.peers_of("bj.connector");
        assert_eq!(connector_peers.len(), 1);
        assert_eq!(connector_peers[0].name, "bj.edge1");

        let edge1_peers: Vec<_> = store
            .peers_of("bj.edge1")
            .into_iter()
            .map(|ep| ep.name)
            .collect();
        assert_eq!(edge1_peers, vec!["bj.connector", "sh.edge1"]);

        // edge2 shares no community with anyone
        assert!(store.peers_of("bj.edge2").is_empty());
    }

    #[test]
    fn replace_foreign_keeps_local_entries() {
        let store = EndpointStore::new();
        store.save_endpoint(endpoint("sh.edge1", "10.20.1.0/24"));
        store.save_endpoint(endpoint("sh.connector", "10.234.0.0/16"));
        store.save_endpoint(endpoint("bj.edge1", "10.10.1.0/24"));

        store.replace_foreign(
            "sh",
            vec![endpoint("bj.connector", "10.233.0.0/16")],
            vec![Community::new("cross", ["sh.connector", "bj.connector"])],
        );

        // the previously known bj.edge1 is gone, bj.connector replaced it
        assert!(store.get_endpoint("bj.edge1").is_none());
        assert!(store.get_endpoint("bj.connector").is_some());
        // local entries survived
        assert!(store.get_endpoint("sh.edge1").is_some());
        assert!(store.get_endpoint("sh.connector").is_some());

        let peers = store.peers_of("sh.connector");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "bj.connector");
    }

    #[test]
    fn remove_cluster_drops_only_that_prefix() {
        let store = EndpointStore::new();
        store.save_endpoint(endpoint("bj.edge1", "10.10.1.0/24"));
        store.save_endpoint(endpoint("sh.edge1", "10.20.1.0/24"));

        store.remove_cluster("sh");

        assert!(store.get_endpoint("bj.edge1").is_some());
        assert!(store.get_endpoint("sh.edge1").is_none());
    }

    #[test]
    fn mutations_signal_subscribers() {
        let store = EndpointStore::new();
        let receiver = store.subscribe();
        let before = *receiver.borrow();

        store.save_endpoint(endpoint("bj.edge1", "10.10.1.0/24"));

        assert!(*receiver.borrow() > before);
    }
}
