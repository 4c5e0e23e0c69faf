use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::PatchParams;
use kube::core::ObjectMeta;
use kube::Client;
use log::{info, warn};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;

use fabedge_core::cert::{CertManager, LocalCertManager, RemoteCertManager};
use fabedge_core::endpoint::EndpointNamer;
use fabedge_core::ip::parse_subnets;
use fabedge_core::kubernetes::{apply_resource, try_get_resource};
use fabedge_core::resources::labels::get_operator_labels;
use fabedge_core::resources::secret::{secret_data, CA_CERT_KEY, CA_KEY_KEY};
use fabedge_core::store::EndpointStore;
use fabedge_core::token::TokenManager;

use crate::allocator::Allocator;
use crate::cli::{parse_labels, Cli, ClusterRole, CniType};
use crate::controllers::context::{AgentOptions, ConnectorOptions, OperatorContext};
use crate::controllers::{community, connector, ipam_block, node, OPERATOR_FIELD_MANAGER};
use crate::federation::client::SharedApiClient;
use crate::federation::routines::{
    ensure_api_client, start_host_routines, start_member_sync, HostConfig, MemberConfig,
};
use crate::federation::server::{self, ApiServerConfig, ApiState};
use crate::leader::LeaderElection;
use crate::pod_cidr_store::PodCidrStore;

const CA_VALIDITY_DAYS: i64 = 3650;
const API_SERVER_CERT_CN: &str = "fabedge-api-server";

/// Wires everything together and runs until a signal arrives or a worker
/// dies. The rough order mirrors the startup constraints: leadership first,
/// then allocator/store priming, then controllers and federation.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("couldn't create the cluster API client")?;

    let _leader = if cli.leader_election {
        let election = LeaderElection {
            client: client.clone(),
            namespace: cli.namespace.clone(),
            lease_name: cli.leader_election_id.clone(),
            identity: instance_identity(),
            lease_duration: cli.leader_lease_duration,
            renew_deadline: cli.leader_renew_deadline,
            retry_period: cli.leader_retry_period,
        };
        Some(election.acquire().await?)
    } else {
        None
    };

    let edge_labels = parse_labels(&cli.edge_labels)?;
    let namer = EndpointNamer::new(&cli.cluster, &cli.endpoint_id_format);
    let store = Arc::new(EndpointStore::new());
    let pod_cidrs = Arc::new(PodCidrStore::new());

    let allocator = match (cli.cni_type, cli.edge_pod_cidr) {
        (CniType::Calico, Some(pool)) => Some(Arc::new(Mutex::new(Allocator::new(
            pool,
            cli.edge_pod_cidr_block_size,
        )?))),
        _ => None,
    };

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cert_manager: Arc<dyn CertManager> = match cli.cluster_role {
        ClusterRole::Host => {
            let local = ensure_ca(&client, &cli).await?;
            let tokens = Arc::new(
                TokenManager::from_pkcs8(&local.ca_key_pkcs8()?)
                    .map_err(|error| anyhow::anyhow!("unusable CA key for tokens: {error}"))?,
            );

            let (server_cert, server_key) =
                local.issue_server_cert(API_SERVER_CERT_CN, &server_cert_sans(&cli))?;

            let local: Arc<dyn CertManager> = Arc::new(local);
            let (reports_tx, reports_rx) = mpsc::unbounded_channel();

            let state = ApiState {
                store: store.clone(),
                cert_manager: local.clone(),
                tokens: tokens.clone(),
                reports: reports_tx,
                local_cluster: cli.cluster.clone(),
            };
            let server_config = ApiServerConfig {
                listen: cli.api_server_listen_address,
                cert_pem: server_cert,
                key_pem: server_key,
            };
            let server_shutdown = shutdown_rx.clone();
            tasks.spawn(async move { server::serve(server_config, state, server_shutdown).await });

            let host_config = HostConfig {
                cluster: cli.cluster.clone(),
                token_valid_period: cli.token_valid_period,
                expire_after: cli.cluster_expire_duration,
                sync_interval: cli.sync_interval,
            };
            let host_client = client.clone();
            let host_store = store.clone();
            let host_namer = namer.clone();
            tasks.spawn(async move {
                start_host_routines(
                    host_client,
                    host_config,
                    host_store,
                    host_namer,
                    tokens,
                    reports_rx,
                )
                .await
            });

            local
        }
        ClusterRole::Member => {
            let member_config = MemberConfig {
                cluster: cli.cluster.clone(),
                namespace: cli.namespace.clone(),
                api_server_address: cli
                    .api_server_address
                    .clone()
                    .expect("validated: member role carries an API server address"),
                init_token: cli.init_token.clone(),
                cert_organization: cli.cert_organization.clone(),
                sync_interval: cli.sync_interval,
            };

            let (api_client, ca) = ensure_api_client(&client, &member_config).await?;
            let shared = Arc::new(RwLock::new(api_client));

            let sync_client = client.clone();
            let sync_store = store.clone();
            let sync_namer = namer.clone();
            let sync_shared = shared.clone();
            tasks.spawn(async move {
                start_member_sync(sync_client, member_config, sync_store, sync_namer, sync_shared)
                    .await
            });

            Arc::new(RemoteCertManager::new(
                ca.der,
                Arc::new(SharedApiClient(shared)),
            ))
        }
    };

    let context = Arc::new(OperatorContext {
        client: client.clone(),
        namespace: cli.namespace.clone(),
        cni: cli.cni_type,
        edge_labels,
        namer,
        store,
        allocator,
        pod_cidrs,
        cert_manager,
        agent: AgentOptions {
            agent_image: cli.agent_image.clone(),
            strongswan_image: cli.agent_strongswan_image.clone(),
            image_pull_policy: cli.agent_image_pull_policy.clone(),
            log_level: cli.agent_log_level,
            mtu: cli.agent_mtu,
            enable_hairpin: cli.agent_enable_hairpin,
            use_xfrm: cli.agent_use_xfrm,
            masq_outgoing: cli.agent_masq_outgoing,
            enable_proxy: cli.agent_enable_proxy,
        },
        connector: ConnectorOptions {
            public_addresses: cli.connector_public_addresses.clone(),
            provided_subnets: parse_subnets(&cli.connector_subnets)?,
            sync_interval: cli.connector_config_sync_interval,
            debounce: cli.connector_config_debounce,
        },
    });

    if cli.cni_type == CniType::Calico {
        ipam_block::record_existing(&context)
            .await
            .context("couldn't record existing IPAM blocks")?;

        let monitor_context = context.clone();
        tasks.spawn(async move { ipam_block::start_ipam_block_monitor(monitor_context).await });
    }

    node::record_existing(&context)
        .await
        .map_err(|error| anyhow::anyhow!("couldn't record existing endpoints: {error}"))?;

    let node_context = context.clone();
    tasks.spawn(async move { node::start_node_controller(node_context).await });

    let community_context = context.clone();
    tasks.spawn(async move { community::start_community_controller(community_context).await });

    let connector_context = context.clone();
    tasks.spawn(async move { connector::start_connector_controller(connector_context).await });

    info!("FabEdge operator is up (cluster '{}').", cli.cluster);

    let outcome = wait_for_exit(&mut tasks, &_leader).await;

    let _ = shutdown_tx.send(true);
    tasks.shutdown().await;

    outcome
}

async fn wait_for_exit(
    tasks: &mut JoinSet<anyhow::Result<()>>,
    leader: &Option<crate::leader::LeaderHandle>,
) -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("couldn't register the SIGTERM handler")?;

    let mut leader_lost = leader.as_ref().map(|handle| handle.lost.clone());
    let leadership = async {
        match leader_lost.as_mut() {
            Some(lost) => {
                // flips exactly once, when renewal fails past the deadline
                while !*lost.borrow() {
                    if lost.changed().await.is_err() {
                        break;
                    }
                }
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down...");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Terminated, shutting down...");
            Ok(())
        }
        _ = leadership => {
            anyhow::bail!("leadership was lost")
        }
        finished = tasks.join_next() => match finished {
            Some(Ok(Ok(()))) => anyhow::bail!("a worker exited unexpectedly"),
            Some(Ok(Err(error))) => Err(error),
            Some(Err(join_error)) => anyhow::bail!("a worker panicked: {join_error}"),
            None => anyhow::bail!("no workers were started"),
        },
    }
}

/// Loads the CA from its secret, creating a fresh self-signed one when the
/// secret doesn't exist yet.
async fn ensure_ca(client: &Client, cli: &Cli) -> anyhow::Result<LocalCertManager> {
    if let Some(secret) =
        try_get_resource::<Secret>(client, &cli.ca_secret, &cli.namespace).await?
    {
        let cert_pem = secret_data(&secret, CA_CERT_KEY)?;
        let key_pem = secret_data(&secret, CA_KEY_KEY)?;

        let manager = LocalCertManager::new(
            String::from_utf8_lossy(cert_pem).into_owned(),
            String::from_utf8_lossy(key_pem).into_owned(),
            cli.cert_validity_period,
        )?;

        return Ok(manager);
    }

    warn!(
        "CA secret '{}' doesn't exist, creating a self-signed CA...",
        cli.ca_secret
    );

    let (cert_pem, key_pem) =
        LocalCertManager::generate_ca(&cli.cert_organization, CA_VALIDITY_DAYS)?;

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(cli.ca_secret.clone()),
            namespace: Some(cli.namespace.clone()),
            labels: Some(get_operator_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (CA_CERT_KEY.to_owned(), ByteString(cert_pem.clone().into_bytes())),
            (CA_KEY_KEY.to_owned(), ByteString(key_pem.clone().into_bytes())),
        ])),
        ..Default::default()
    };
    apply_resource(client, &secret, &PatchParams::apply(OPERATOR_FIELD_MANAGER)).await?;

    Ok(LocalCertManager::new(
        cert_pem,
        key_pem,
        cli.cert_validity_period,
    )?)
}

/// SANs for the API server certificate: whatever the operator configured,
/// plus the addresses members are told to dial.
fn server_cert_sans(cli: &Cli) -> Vec<String> {
    let mut sans: Vec<String> = cli.api_server_cert_sans.clone();
    sans.extend(cli.connector_public_addresses.iter().cloned());

    let listen_ip = cli.api_server_listen_address.ip();
    if !listen_ip.is_unspecified() {
        sans.push(listen_ip.to_string());
    }
    sans.push("localhost".to_owned());

    sans.sort();
    sans.dedup();

    sans
}

fn instance_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("fabedge-operator-{}", std::process::id()))
}
