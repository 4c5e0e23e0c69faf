use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::watcher::{watcher, Config, Event};
use kube::runtime::WatchStreamExt;
use kube::ResourceExt;
use log::{info, warn};

use fabedge_core::crds::Community;
use fabedge_core::endpoint::{EndpointType, TunnelEndpoint};
use fabedge_core::ip::host_cidr;
use fabedge_core::kubernetes::list_cluster_resources;
use fabedge_core::{EDGE_POD_CIDRS_ANNOTATION, PUBLIC_ADDRESSES_ANNOTATION};

use crate::cli::CniType;
use crate::controllers::{agent, context::OperatorContext, ReconcilerError};

const RESYNC_PERIOD_SECS: u64 = 60 * 5;
const ERROR_REQUEUE_SECS: u64 = 10;
const RETRY_ATTEMPTS: u32 = 3;

/// Watches edge nodes, synthesizes their tunnel endpoints and keeps the
/// per-node agent artifacts in shape. Store changes (new communities, new
/// federated endpoints) trigger a config-only refresh of every agent.
pub async fn start_node_controller(context: Arc<OperatorContext>) -> anyhow::Result<()> {
    info!("Starting the edge node controller...");

    let api: Api<Node> = Api::all(context.client.clone());
    let watcher_config = Config::default().labels(&context.edge_selector());
    let mut stream = pin!(watcher(api, watcher_config).default_backoff());

    let mut resync = tokio::time::interval(Duration::from_secs(RESYNC_PERIOD_SECS));
    resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut store_changes = context.store.subscribe();

    loop {
        tokio::select! {
            _ = resync.tick() => {
                resync_all(&context).await;
            }
            changed = store_changes.changed() => {
                if changed.is_err() {
                    break;
                }
                // let a burst of store updates settle before rewriting configs
                tokio::time::sleep(context.connector.debounce).await;
                store_changes.mark_unchanged();
                refresh_agent_configs(&context).await;
            }
            event = stream.try_next() => match event {
                Ok(Some(Event::Apply(node) | Event::InitApply(node))) => {
                    reconcile_with_retries(&context, &node).await;
                }
                Ok(Some(Event::Delete(node))) => {
                    cleanup_node(&context, &node.name_any()).await;
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(error) => warn!("Edge node watcher hiccuped! {error}"),
            }
        }
    }

    info!("Exiting the edge node controller...");

    Ok(())
}

/// Primes the allocator and the store from the current cluster state. Must
/// run after leader election and before the controllers start, otherwise
/// their view of allocations could be stale.
pub async fn record_existing(context: &OperatorContext) -> Result<(), ReconcilerError> {
    let communities: Vec<Community> =
        list_cluster_resources(&context.client, &ListParams::default()).await?;
    for community in communities {
        if let Some(record) = community.to_record() {
            context.store.save_community(record);
        }
    }

    let nodes: Vec<Node> = list_cluster_resources(
        &context.client,
        &ListParams::default().labels(&context.edge_selector()),
    )
    .await?;

    for node in nodes {
        let node_name = node.name_any();

        if let Some(allocator) = &context.allocator {
            let mut allocator = allocator.lock().unwrap();
            for block in annotation_pod_cidrs(&node) {
                if let IpNet::V4(block) = block {
                    if let Err(error) = allocator.record(&node_name, block) {
                        warn!("Couldn't record existing block of node '{node_name}'! {error}");
                    }
                }
            }
        }

        if let Some(endpoint) = observed_endpoint(context, &node) {
            context.store.save_endpoint(endpoint);
        }
    }

    Ok(())
}

async fn reconcile_with_retries(context: &OperatorContext, node: &Node) {
    let node_name = node.name_any();

    for attempt in 1..=RETRY_ATTEMPTS {
        match reconcile_node(context, node).await {
            Ok(()) => {
                info!("Reconciled edge node '{node_name}'.");
                return;
            }
            Err(error) if attempt < RETRY_ATTEMPTS => {
                warn!("Reconciling edge node '{node_name}' failed (attempt {attempt}): {error}");
                tokio::time::sleep(Duration::from_secs(ERROR_REQUEUE_SECS * attempt as u64)).await;
            }
            Err(error) => {
                warn!(
                    "Reconciling edge node '{node_name}' failed: {error}. \
                        Will retry at the next resync."
                );
            }
        }
    }
}

async fn reconcile_node(context: &OperatorContext, node: &Node) -> Result<(), ReconcilerError> {
    let node_name = node
        .metadata
        .name
        .as_deref()
        .ok_or(ReconcilerError::MissingObjectMetadata)?;

    let subnets = match context.cni {
        CniType::Flannel => spec_pod_cidrs(node),
        CniType::Calico => ensure_calico_pod_cidrs(context, node, node_name).await?,
    };

    let endpoint = TunnelEndpoint {
        name: context.namer.endpoint_name(node_name),
        id: context.namer.endpoint_id(node_name),
        endpoint_type: EndpointType::EdgeNode,
        public_addresses: node_public_addresses(node),
        subnets,
        node_subnets: node_host_subnets(node),
    };

    if !endpoint.is_valid() {
        warn!(
            "Edge node '{node_name}' doesn't yield a usable endpoint yet, skipping. \
                (addresses: {}, subnets: {})",
            endpoint.public_addresses.len(),
            endpoint.subnets.len()
        );
        return Ok(());
    }

    context.store.save_endpoint(endpoint.clone());

    agent::ensure(context, node, &endpoint).await
}

async fn cleanup_node(context: &OperatorContext, node_name: &str) {
    info!("Edge node '{node_name}' is gone, removing its endpoint and agent...");

    context
        .store
        .delete_endpoint(&context.namer.endpoint_name(node_name));

    if let Some(allocator) = &context.allocator {
        allocator.lock().unwrap().release(node_name);
    }

    if let Err(error) = agent::undo(context, node_name).await {
        warn!("Couldn't remove agent resources of node '{node_name}'! {error}");
    }
}

async fn resync_all(context: &OperatorContext) {
    let nodes: Result<Vec<Node>, _> = list_cluster_resources(
        &context.client,
        &ListParams::default().labels(&context.edge_selector()),
    )
    .await;

    match nodes {
        Ok(nodes) => {
            for node in nodes {
                reconcile_with_retries(context, &node).await;
            }
        }
        Err(error) => warn!("Couldn't list edge nodes for resync! {error}"),
    }
}

async fn refresh_agent_configs(context: &OperatorContext) {
    let nodes: Result<Vec<Node>, _> = list_cluster_resources(
        &context.client,
        &ListParams::default().labels(&context.edge_selector()),
    )
    .await;

    match nodes {
        Ok(nodes) => {
            for node in nodes {
                let node_name = node.name_any();
                if let Err(error) = agent::ensure_config(context, &node, &node_name).await {
                    warn!("Couldn't refresh agent config of node '{node_name}'! {error}");
                }
            }
        }
        Err(error) => warn!("Couldn't list edge nodes for a config refresh! {error}"),
    }
}

/// Endpoint synthesis without side effects, used by the initial record pass
/// (Calico CIDRs must already sit in the node annotation at that point).
fn observed_endpoint(context: &OperatorContext, node: &Node) -> Option<TunnelEndpoint> {
    let node_name = node.metadata.name.as_deref()?;

    let subnets = match context.cni {
        CniType::Flannel => spec_pod_cidrs(node),
        CniType::Calico => annotation_pod_cidrs(node),
    };

    let endpoint = TunnelEndpoint {
        name: context.namer.endpoint_name(node_name),
        id: context.namer.endpoint_id(node_name),
        endpoint_type: EndpointType::EdgeNode,
        public_addresses: node_public_addresses(node),
        subnets,
        node_subnets: node_host_subnets(node),
    };

    endpoint.is_valid().then_some(endpoint)
}

async fn ensure_calico_pod_cidrs(
    context: &OperatorContext,
    node: &Node,
    node_name: &str,
) -> Result<Vec<IpNet>, ReconcilerError> {
    let recorded = annotation_pod_cidrs(node);
    if !recorded.is_empty() {
        if let Some(allocator) = &context.allocator {
            let mut allocator = allocator.lock().unwrap();
            for block in &recorded {
                if let IpNet::V4(block) = block {
                    let _ = allocator.record(node_name, *block);
                }
            }
        }
        return Ok(recorded);
    }

    let allocator = context
        .allocator
        .as_ref()
        .ok_or(ReconcilerError::MissingObjectData("allocator".into()))?;

    let block = allocator.lock().unwrap().get_or_allocate(node_name)?;

    let api: Api<Node> = Api::all(context.client.clone());
    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                EDGE_POD_CIDRS_ANNOTATION: block.to_string(),
            }
        }
    });
    api.patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(vec![IpNet::V4(block)])
}

pub fn node_public_addresses(node: &Node) -> Vec<String> {
    if let Some(overridden) = node.annotations().get(PUBLIC_ADDRESSES_ANNOTATION) {
        return overridden
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(str::to_owned)
            .collect();
    }

    let addresses_of = |wanted: &str| -> Vec<String> {
        node.status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .map(|addresses| {
                addresses
                    .iter()
                    .filter(|address| address.type_ == wanted)
                    .map(|address| address.address.clone())
                    .collect()
            })
            .unwrap_or_default()
    };

    let external = addresses_of("ExternalIP");
    if !external.is_empty() {
        return external;
    }

    addresses_of("InternalIP")
}

pub fn node_host_subnets(node: &Node) -> Vec<IpNet> {
    let mut subnets: Vec<IpNet> = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .filter(|address| address.type_ == "InternalIP" || address.type_ == "ExternalIP")
                .filter_map(|address| address.address.parse().ok())
                .map(host_cidr)
                .collect()
        })
        .unwrap_or_default();

    subnets.sort();
    subnets.dedup();

    subnets
}

pub fn spec_pod_cidrs(node: &Node) -> Vec<IpNet> {
    let Some(spec) = node.spec.as_ref() else {
        return Vec::new();
    };

    if let Some(cidrs) = &spec.pod_cidrs {
        return cidrs.iter().filter_map(|cidr| cidr.parse().ok()).collect();
    }

    spec.pod_cidr
        .as_ref()
        .and_then(|cidr| cidr.parse().ok())
        .into_iter()
        .collect()
}

pub fn annotation_pod_cidrs(node: &Node) -> Vec<IpNet> {
    node.annotations()
        .get(EDGE_POD_CIDRS_ANNOTATION)
        .map(|raw| {
            raw.split(',')
                .filter_map(|cidr| cidr.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus};

    use super::*;

    fn node(external: Option<&str>, internal: Option<&str>, pod_cidr: Option<&str>) -> Node {
        let mut addresses = Vec::new();
        if let Some(address) = external {
            addresses.push(NodeAddress {
                type_: "ExternalIP".to_owned(),
                address: address.to_owned(),
            });
        }
        if let Some(address) = internal {
            addresses.push(NodeAddress {
                type_: "InternalIP".to_owned(),
                address: address.to_owned(),
            });
        }

        Node {
            spec: Some(NodeSpec {
                pod_cidr: pod_cidr.map(str::to_owned),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                addresses: Some(addresses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn external_addresses_win_over_internal() {
        let node = node(Some("203.0.113.10"), Some("192.168.1.10"), None);

        assert_eq!(node_public_addresses(&node), vec!["203.0.113.10"]);
    }

    #[test]
    fn internal_addresses_are_the_fallback() {
        let node = node(None, Some("192.168.1.10"), None);

        assert_eq!(node_public_addresses(&node), vec!["192.168.1.10"]);
    }

    #[test]
    fn annotation_overrides_node_addresses() {
        let mut node = node(Some("203.0.113.10"), None, None);
        node.metadata.annotations = Some(BTreeMap::from([(
            PUBLIC_ADDRESSES_ANNOTATION.to_owned(),
            "edge1.example.org, 198.51.100.7".to_owned(),
        )]));

        assert_eq!(
            node_public_addresses(&node),
            vec!["edge1.example.org", "198.51.100.7"]
        );
    }

    #[test]
    fn host_subnets_are_full_prefix_cidrs() {
        let node = node(Some("203.0.113.10"), Some("192.168.1.10"), None);

        let subnets: Vec<String> = node_host_subnets(&node)
            .into_iter()
            .map(|subnet| subnet.to_string())
            .collect();

        assert_eq!(subnets, vec!["192.168.1.10/32", "203.0.113.10/32"]);
    }

    #[test]
    fn flannel_pod_cidrs_come_from_the_spec() {
        let node = node(None, Some("192.168.1.10"), Some("10.10.1.0/24"));

        let cidrs = spec_pod_cidrs(&node);
        assert_eq!(cidrs.len(), 1);
        assert_eq!(cidrs[0].to_string(), "10.10.1.0/24");
    }

    #[test]
    fn calico_pod_cidrs_come_from_the_annotation() {
        let mut node = node(None, Some("192.168.1.10"), None);
        node.metadata.annotations = Some(BTreeMap::from([(
            EDGE_POD_CIDRS_ANNOTATION.to_owned(),
            "10.20.0.0/26,10.20.0.64/26".to_owned(),
        )]));

        assert_eq!(annotation_pod_cidrs(&node).len(), 2);
        assert!(spec_pod_cidrs(&node).is_empty());
    }
}
