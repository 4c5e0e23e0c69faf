use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Mirrors the CNI's per-node pod CIDR allocation blocks for cloud nodes.
/// Fed by the IPAMBlock monitor on Calico clusters; the connector controller
/// reads it to build the connector endpoint's subnets.
#[derive(Default)]
pub struct PodCidrStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_node: HashMap<String, BTreeSet<String>>,
    node_of: HashMap<String, String>,
}

impl PodCidrStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, node_name: &str, cidr: &str) {
        let mut inner = self.inner.write().unwrap();

        // a block can move between nodes on reallocation
        if let Some(previous) = inner.node_of.insert(cidr.to_owned(), node_name.to_owned()) {
            if previous != node_name {
                if let Some(set) = inner.by_node.get_mut(&previous) {
                    set.remove(cidr);
                }
            }
        }

        inner
            .by_node
            .entry(node_name.to_owned())
            .or_default()
            .insert(cidr.to_owned());
    }

    pub fn remove_block(&self, cidr: &str) {
        let mut inner = self.inner.write().unwrap();

        if let Some(node) = inner.node_of.remove(cidr) {
            if let Some(set) = inner.by_node.get_mut(&node) {
                set.remove(cidr);
                if set.is_empty() {
                    inner.by_node.remove(&node);
                }
            }
        }
    }

    pub fn get(&self, node_name: &str) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .by_node
            .get(node_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every known block, across all nodes, sorted.
    pub fn all(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut blocks: Vec<_> = inner.node_of.keys().cloned().collect();
        blocks.sort();

        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_follow_their_node() {
        let store = PodCidrStore::new();
        store.append("n1", "10.244.0.0/26");
        store.append("n1", "10.244.0.64/26");
        store.append("n2", "10.244.0.128/26");

        assert_eq!(store.get("n1").len(), 2);
        assert_eq!(store.all().len(), 3);

        // the block moves to n2
        store.append("n2", "10.244.0.0/26");
        assert_eq!(store.get("n1"), vec!["10.244.0.64/26".to_owned()]);

        store.remove_block("10.244.0.64/26");
        assert!(store.get("n1").is_empty());
        assert_eq!(store.all().len(), 2);
    }
}
