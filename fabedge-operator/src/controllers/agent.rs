use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use kube::api::PatchParams;
use kube::{Resource, ResourceExt};
use log::info;

use fabedge_core::cert::{
    der_to_cert_pem, needs_renewal, new_cert_request_with_dn, CertManager,
    EXT_KEY_USAGES_SERVER_AND_CLIENT,
};
use fabedge_core::endpoint::{parse_dn_pairs, EndpointNamer, TunnelEndpoint};
use fabedge_core::kubernetes::{apply_resource, try_get_resource, try_remove_resource};
use fabedge_core::netconf::NetworkConfig;
use fabedge_core::resources::agent::{agent_config_name, agent_name, AgentRelease, AgentReleaseBuilder};
use fabedge_core::resources::labels::get_agent_labels;
use fabedge_core::resources::secret::{
    agent_tls_secret_name, build_tls_secret, secret_data, TLS_CERT_KEY,
};
use fabedge_core::store::EndpointStore;

use super::context::OperatorContext;
use super::{ReconcilerError, OPERATOR_FIELD_MANAGER};

/// Materializes everything one edge node needs: the TLS secret, the tunnel
/// config and the agent workload itself.
pub async fn ensure(
    context: &OperatorContext,
    node: &Node,
    endpoint: &TunnelEndpoint,
) -> Result<(), ReconcilerError> {
    let node_name = node
        .metadata
        .name
        .as_deref()
        .ok_or(ReconcilerError::MissingObjectMetadata)?;

    let release = build_release(context, node, endpoint)?;

    ensure_tls_secret(context, &release, endpoint).await?;

    let config = compute_agent_config(&context.store, &context.namer, endpoint);
    let patch_params = PatchParams::apply(OPERATOR_FIELD_MANAGER);
    apply_resource(&context.client, &release.generate_configmap(&config)?, &patch_params).await?;
    apply_resource(&context.client, &release.generate_deployment(), &patch_params).await?;

    info!("Agent resources of node '{node_name}' are in place.");

    Ok(())
}

/// Refreshes only the per-node tunnel config, used when the store changed
/// but the node itself didn't.
pub async fn ensure_config(
    context: &OperatorContext,
    node: &Node,
    node_name: &str,
) -> Result<(), ReconcilerError> {
    let endpoint_name = context.namer.endpoint_name(node_name);
    let Some(endpoint) = context.store.get_endpoint(&endpoint_name) else {
        // the node never produced a valid endpoint; nothing to refresh
        return Ok(());
    };

    let release = build_release(context, node, &endpoint)?;
    let config = compute_agent_config(&context.store, &context.namer, &endpoint);

    apply_resource(
        &context.client,
        &release.generate_configmap(&config)?,
        &PatchParams::apply(OPERATOR_FIELD_MANAGER),
    )
    .await?;

    Ok(())
}

/// Removes the artifacts of a deleted node.
pub async fn undo(context: &OperatorContext, node_name: &str) -> Result<(), ReconcilerError> {
    let namespace = &context.namespace;

    try_remove_resource::<Deployment>(&context.client, &agent_name(node_name), namespace).await?;
    try_remove_resource::<ConfigMap>(&context.client, &agent_config_name(node_name), namespace)
        .await?;
    try_remove_resource::<Secret>(&context.client, &agent_tls_secret_name(node_name), namespace)
        .await?;

    Ok(())
}

/// The node's tunnel peers: every other member of every community the node
/// belongs to, plus always the local connector.
pub fn compute_agent_config(
    store: &EndpointStore,
    namer: &EndpointNamer,
    endpoint: &TunnelEndpoint,
) -> NetworkConfig {
    let mut peers = store.peers_of(&endpoint.name);

    let connector_name = namer.connector_name();
    if endpoint.name != connector_name && !peers.iter().any(|peer| peer.name == connector_name) {
        if let Some(connector) = store.get_endpoint(&connector_name) {
            peers.push(connector);
        }
    }

    NetworkConfig::new(endpoint.clone(), peers)
}

fn build_release(
    context: &OperatorContext,
    node: &Node,
    endpoint: &TunnelEndpoint,
) -> Result<AgentRelease, ReconcilerError> {
    AgentReleaseBuilder::default()
        .namespace(context.namespace.clone())
        .node_name(node.name_any())
        .endpoint_name(endpoint.name.clone())
        .agent_image(context.agent.agent_image.clone())
        .strongswan_image(context.agent.strongswan_image.clone())
        .image_pull_policy(context.agent.image_pull_policy.clone())
        .log_level(context.agent.log_level)
        .mtu(context.agent.mtu)
        .enable_hairpin(context.agent.enable_hairpin)
        .use_xfrm(context.agent.use_xfrm)
        .masq_outgoing(context.agent.masq_outgoing)
        .enable_proxy(context.agent.enable_proxy)
        .owner(node.controller_owner_ref(&()))
        .build()
        .map_err(|error| {
            ReconcilerError::MissingObjectData(format!("agent release: {error}").into())
        })
}

/// Issues (or re-issues) the node's TLS secret when it is missing, fails
/// verification against the CA, or nears its expiry. The private key is
/// generated here and never leaves the cluster; the cert subject is the
/// node's endpoint id, usable for both server and client auth.
async fn ensure_tls_secret(
    context: &OperatorContext,
    release: &AgentRelease,
    endpoint: &TunnelEndpoint,
) -> Result<(), ReconcilerError> {
    let secret_name = release.get_secret_name();

    if let Some(secret) =
        try_get_resource::<Secret>(&context.client, &secret_name, &context.namespace).await?
    {
        if let Ok(cert_pem) = secret_data(&secret, TLS_CERT_KEY) {
            let verified = context
                .cert_manager
                .verify_cert(cert_pem, EXT_KEY_USAGES_SERVER_AND_CLIENT)
                .is_ok();

            if verified && !needs_renewal(cert_pem) {
                return Ok(());
            }
        }

        info!("TLS secret '{secret_name}' is stale, re-issuing...");
    }

    let request = new_cert_request_with_dn(&parse_dn_pairs(&endpoint.id))?;
    let cert_der = context.cert_manager.sign_cert(&request.csr_der).await?;

    let secret = build_tls_secret(
        &secret_name,
        &context.namespace,
        get_agent_labels(&release.node_name),
        &context.cert_manager.ca_cert_pem(),
        &der_to_cert_pem(&cert_der),
        request.key_pem.as_bytes(),
    );

    apply_resource(
        &context.client,
        &secret,
        &PatchParams::apply(OPERATOR_FIELD_MANAGER),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use fabedge_core::community::Community;
    use fabedge_core::endpoint::EndpointType;

    use super::*;

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
    fn agent_peers_are_community_peers_plus_connector() {
        let store = EndpointStore::new();
        let namer = EndpointNamer::new("bj", "C=CN, O=fabedge.io, CN={node}");

        store.save_endpoint(endpoint("bj.connector", "10.233.0.0/16"));
        store.save_endpoint(endpoint("bj.edge1", "10.10.1.0/24"));
        store.save_endpoint(endpoint("bj.edge2", "10.10.2.0/24"));
        store.save_endpoint(endpoint("sh.edge9", "10.20.9.0/24"));
        store.save_community(Community {
            name: "pair".into(),
            members: BTreeSet::from(["bj.edge1".to_owned(), "bj.edge2".to_owned()]),
        });

        let edge1 = store.get_endpoint("bj.edge1").unwrap();
        let config = compute_agent_config(&store, &namer, &edge1);

        let names: Vec<_> = config.peers.iter().map(|peer| peer.name.as_str()).collect();
        // community peer + implicit connector; sh.edge9 shares no community
        assert_eq!(names, vec!["bj.connector", "bj.edge2"]);
        assert_eq!(config.local_endpoint.name, "bj.edge1");
    }

    #[test]
    fn connector_is_not_duplicated_when_already_a_peer() {
        let store = EndpointStore::new();
        let namer = EndpointNamer::new("bj", "C=CN, O=fabedge.io, CN={node}");

        store.save_endpoint(endpoint("bj.connector", "10.233.0.0/16"));
        store.save_endpoint(endpoint("bj.edge1", "10.10.1.0/24"));
        store.save_community(Community {
            name: "cloud".into(),
            members: BTreeSet::from(["bj.connector".to_owned(), "bj.edge1".to_owned()]),
        });

        let edge1 = store.get_endpoint("bj.edge1").unwrap();
        let config = compute_agent_config(&store, &namer, &edge1);

        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].name, "bj.connector");
    }
}
