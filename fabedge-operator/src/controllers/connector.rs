use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, PatchParams};
use log::{info, warn};

use fabedge_core::endpoint::{EndpointType, TunnelEndpoint};
use fabedge_core::ip::parse_subnets;
use fabedge_core::kubernetes::{apply_resource, list_cluster_resources};
use fabedge_core::netconf::NetworkConfig;
use fabedge_core::resources::connector::generate_connector_configmap;

use crate::cli::CniType;
use crate::controllers::node::{node_host_subnets, spec_pod_cidrs};

use super::context::OperatorContext;
use super::{ReconcilerError, OPERATOR_FIELD_MANAGER};

/// Maintains the connector endpoint and publishes the connector's config
/// artifact: the union of endpoints from every community the connector
/// belongs to. Runs periodically and, debounced, on store changes.
pub async fn start_connector_controller(context: Arc<OperatorContext>) -> anyhow::Result<()> {
    info!("Starting the connector controller...");

    let mut interval = tokio::time::interval(context.connector.sync_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut store_changes = context.store.subscribe();
    let mut last_published: Option<String> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = store_changes.changed() => {
                if changed.is_err() {
                    break;
                }
                tokio::time::sleep(context.connector.debounce).await;
                store_changes.mark_unchanged();
            }
        }

        if let Err(error) = sync_connector_config(&context, &mut last_published).await {
            warn!("Connector config synchronization failed! {error}");
        }
    }

    info!("Exiting the connector controller...");

    Ok(())
}

async fn sync_connector_config(
    context: &OperatorContext,
    last_published: &mut Option<String>,
) -> Result<(), ReconcilerError> {
    let endpoint = match compute_connector_endpoint(context).await? {
        Some(endpoint) => endpoint,
        None => {
            warn!("The connector endpoint isn't usable yet, skipping publication.");
            return Ok(());
        }
    };

    context.store.save_endpoint(endpoint.clone());

    let peers = context.store.peers_of(&endpoint.name);
    let config = NetworkConfig::new(endpoint, peers);
    let payload = config
        .to_json()
        .map_err(|error| ReconcilerError::MissingObjectData(error.to_string().into()))?;

    if last_published.as_deref() == Some(payload.as_str()) {
        return Ok(());
    }

    let configmap = generate_connector_configmap(&context.namespace, &config)?;
    apply_resource(
        &context.client,
        &configmap,
        &PatchParams::apply(OPERATOR_FIELD_MANAGER),
    )
    .await?;

    info!(
        "Published connector config with {} peer(s).",
        config.peers.len()
    );
    *last_published = Some(payload);

    Ok(())
}

/// The connector endpoint: configured public addresses, the provided subnets
/// plus all cloud pod CIDRs, and the cloud nodes' host CIDRs.
async fn compute_connector_endpoint(
    context: &OperatorContext,
) -> Result<Option<TunnelEndpoint>, ReconcilerError> {
    let cloud_nodes: Vec<Node> = list_cluster_resources(
        &context.client,
        &ListParams::default().labels(&context.cloud_selector()),
    )
    .await?;

    let mut subnets = context.connector.provided_subnets.clone();
    match context.cni {
        CniType::Calico => {
            let blocks = context.pod_cidrs.all();
            subnets.extend(parse_subnets(&blocks).unwrap_or_else(|error| {
                warn!("Ignoring unparsable IPAM block! {error}");
                Vec::new()
            }));
        }
        CniType::Flannel => {
            for node in &cloud_nodes {
                subnets.extend(spec_pod_cidrs(node));
            }
        }
    }
    subnets.sort();
    subnets.dedup();

    let mut node_subnets = Vec::new();
    for node in &cloud_nodes {
        node_subnets.extend(node_host_subnets(node));
    }
    node_subnets.sort();
    node_subnets.dedup();

    let endpoint = TunnelEndpoint {
        name: context.namer.connector_name(),
        id: context.namer.connector_id(),
        endpoint_type: EndpointType::Connector,
        public_addresses: context.connector.public_addresses.clone(),
        subnets,
        node_subnets,
    };

    Ok(endpoint.is_valid().then_some(endpoint))
}
