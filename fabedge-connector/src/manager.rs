use std::collections::{BTreeSet, HashMap};
use std::pin::pin;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::watcher::watch_object;
use kube::Client;
use log::{info, warn};
use tokio::sync::watch;

use fabedge_core::endpoint::EndpointType;
use fabedge_core::netconf::{NetworkConfig, NETCONF_KEY};

use crate::cli::Cli;
use crate::gossip::Gossip;
use crate::ipset::{
    Ipset, IPSET_CLOUD_NODE_CIDR, IPSET_CLOUD_POD_CIDR, IPSET_EDGE_NODE_CIDR, IPSET_EDGE_POD_CIDR,
};
use crate::iptables::Iptables;
use crate::routing::{new_router, Routing};
use crate::tunnel::{ConnConfig, StrongSwanManager, TunnelManager};

/// The connector's reconciliation engine: four periodic tasks on one
/// cooperative loop, re-run early (debounced) when the watched config
/// changes. No task shares kernel state with another, so they simply run in
/// sequence each tick.
pub struct Manager {
    cli: Cli,
    tunnel_manager: Box<dyn TunnelManager>,
    router: Box<dyn Routing>,
    ipset: Ipset,
    iptables: Iptables,
    gossip: Gossip,
    netconf: watch::Receiver<Option<NetworkConfig>>,
    loaded: HashMap<String, ConnConfig>,
}

impl Manager {
    pub async fn new(cli: Cli, client: Client) -> anyhow::Result<Self> {
        let (netconf_tx, netconf_rx) = watch::channel(None);
        tokio::spawn(watch_netconf(
            client,
            cli.namespace.clone(),
            cli.config_name.clone(),
            netconf_tx,
        ));

        let gossip = Gossip::start(
            cli.gossip_listen_address,
            "connector",
            cli.init_members.clone(),
        )
        .await?;

        Ok(Self {
            tunnel_manager: Box::new(StrongSwanManager::new(&cli.vici_socket, &cli.cert_file)),
            router: new_router(cli.cni_type, &cli.tunnel_interface),
            ipset: Ipset::new(),
            iptables: Iptables::new(cli.enable_masquerade),
            gossip,
            netconf: netconf_rx,
            loaded: HashMap::new(),
            cli,
        })
    }

    /// Runs until SIGINT/SIGTERM, then cleans routes and SNAT rules. The
    /// daemon tears the tunnels down itself when it exits.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.cli.sync_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut netconf = self.netconf.clone();

        info!("Connector manager started.");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = netconf.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    tokio::time::sleep(self.cli.debounce_duration).await;
                    netconf.mark_unchanged();
                    info!("The connector config changed, resynchronizing...");
                }
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
            }

            self.sync_all().await;
        }

        info!("Shutting down, cleaning routes and SNAT rules...");
        self.graceful_shutdown().await;
        info!("Connector stopped.");

        Ok(())
    }

    /// One pass of all four tasks. A failing task is logged and retried on
    /// the next tick; the others still run.
    async fn sync_all(&mut self) {
        let Some(config) = self.netconf.borrow().clone() else {
            info!("No connector config yet, nothing to synchronize.");
            return;
        };

        match self.sync_tunnels(&config).await {
            Ok(()) => {
                info!("Tunnels are synced.");
                self.broadcast_prefixes().await;
            }
            Err(error) => warn!("Couldn't sync tunnels! {error}"),
        }

        if let Err(error) = self.sync_routes(&config).await {
            warn!("Couldn't sync routes! {error}");
        } else {
            info!("Routes are synced.");
        }

        if let Err(error) = self.sync_ipsets(&config).await {
            warn!("Couldn't sync ipsets! {error}");
        } else {
            info!("ipsets are synced.");
        }

        if let Err(error) = self.sync_iptables().await {
            warn!("Couldn't sync iptables! {error}");
        } else {
            info!("iptables rules are synced.");
        }
    }

    /// Converges the daemon's connection set to the config: load what is
    /// missing or changed, unload what no longer has a peer. Re-running
    /// against an unchanged config touches nothing.
    async fn sync_tunnels(&mut self, config: &NetworkConfig) -> anyhow::Result<()> {
        let desired = desired_conns(config);
        let active: BTreeSet<String> = self
            .tunnel_manager
            .list_conn_names()
            .await?
            .into_iter()
            .collect();

        for conn in desired.values() {
            let unchanged =
                active.contains(&conn.name) && self.loaded.get(&conn.name) == Some(conn);
            if unchanged {
                continue;
            }

            info!("Loading tunnel '{}'...", conn.name);
            self.tunnel_manager.load_conn(conn).await?;
            self.loaded.insert(conn.name.clone(), conn.clone());
        }

        for name in &active {
            if !desired.contains_key(name) {
                info!("Unloading stale tunnel '{name}'...");
                self.tunnel_manager.unload_conn(name).await?;
                self.loaded.remove(name);
            }
        }

        Ok(())
    }

    /// Routes follow the daemon: installed while at least one SA is up,
    /// removed otherwise.
    async fn sync_routes(&mut self, config: &NetworkConfig) -> anyhow::Result<()> {
        let conns: Vec<ConnConfig> = desired_conns(config).into_values().collect();

        if self.tunnel_manager.is_active().await? {
            self.router.sync_routes(&conns).await?;
        } else {
            self.router.clean_routes(&conns).await?;
        }

        Ok(())
    }

    async fn sync_ipsets(&mut self, config: &NetworkConfig) -> anyhow::Result<()> {
        let memberships = compute_ipset_memberships(config);

        self.ipset
            .sync_set(IPSET_EDGE_POD_CIDR, &memberships.edge_pod)
            .await?;
        self.ipset
            .sync_set(IPSET_EDGE_NODE_CIDR, &memberships.edge_node)
            .await?;
        self.ipset
            .sync_set(IPSET_CLOUD_POD_CIDR, &memberships.cloud_pod)
            .await?;
        self.ipset
            .sync_set(IPSET_CLOUD_NODE_CIDR, &memberships.cloud_node)
            .await?;

        Ok(())
    }

    async fn sync_iptables(&mut self) -> anyhow::Result<()> {
        self.iptables.ensure_forward_rules().await?;
        self.iptables.ensure_nat_rules().await?;
        self.iptables.ensure_input_rules().await?;

        Ok(())
    }

    async fn broadcast_prefixes(&mut self) {
        let prefixes = match self.router.connector_prefixes().await {
            Ok(prefixes) => prefixes,
            Err(error) => {
                warn!("Couldn't read the connector prefixes! {error}");
                return;
            }
        };

        if !prefixes.is_announcable() {
            return;
        }

        self.gossip.broadcast(&prefixes).await;
    }

    async fn graceful_shutdown(&mut self) {
        let conns: Vec<ConnConfig> = self.loaded.values().cloned().collect();

        if let Err(error) = self.router.clean_routes(&conns).await {
            warn!("Couldn't clean routes! {error}");
        }
        if let Err(error) = self.iptables.clean_nat_rules().await {
            warn!("Couldn't clean SNAT rules! {error}");
        }
    }
}

/// Desired connections, keyed by peer name.
fn desired_conns(config: &NetworkConfig) -> HashMap<String, ConnConfig> {
    config
        .peers
        .iter()
        .map(|peer| {
            (
                peer.name.clone(),
                ConnConfig::for_peer(&config.local_endpoint, peer),
            )
        })
        .collect()
}

pub(crate) struct IpsetMemberships {
    pub edge_pod: BTreeSet<String>,
    pub edge_node: BTreeSet<String>,
    pub cloud_pod: BTreeSet<String>,
    pub cloud_node: BTreeSet<String>,
}

/// Exactly the union of the corresponding endpoint fields: edge sets from
/// edge peers, cloud sets from the local endpoint plus peer connectors.
pub(crate) fn compute_ipset_memberships(config: &NetworkConfig) -> IpsetMemberships {
    let mut memberships = IpsetMemberships {
        edge_pod: BTreeSet::new(),
        edge_node: BTreeSet::new(),
        cloud_pod: config
            .local_endpoint
            .subnets
            .iter()
            .map(|net| net.to_string())
            .collect(),
        cloud_node: config
            .local_endpoint
            .node_subnets
            .iter()
            .map(|net| net.to_string())
            .collect(),
    };

    for peer in &config.peers {
        let (pods, nodes) = match peer.endpoint_type {
            EndpointType::EdgeNode => (&mut memberships.edge_pod, &mut memberships.edge_node),
            EndpointType::Connector => (&mut memberships.cloud_pod, &mut memberships.cloud_node),
        };

        pods.extend(peer.subnets.iter().map(|net| net.to_string()));
        nodes.extend(peer.node_subnets.iter().map(|net| net.to_string()));
    }

    memberships
}

/// Watches the published config object and forwards each parseable payload.
async fn watch_netconf(
    client: Client,
    namespace: String,
    config_name: String,
    sender: watch::Sender<Option<NetworkConfig>>,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);

    loop {
        let stream = watch_object(api.clone(), &config_name);
        let mut stream = pin!(stream);

        loop {
            match stream.try_next().await {
                Ok(Some(Some(configmap))) => {
                    let parsed = configmap
                        .data
                        .as_ref()
                        .and_then(|data| data.get(NETCONF_KEY))
                        .and_then(|payload| match NetworkConfig::from_json(payload) {
                            Ok(config) => Some(config),
                            Err(error) => {
                                warn!("The connector config is malformed! {error}");
                                None
                            }
                        });

                    if let Some(config) = parsed {
                        sender.send_replace(Some(config));
                    }
                }
                Ok(Some(None)) => {
                    info!("The connector config object is gone.");
                    sender.send_replace(None);
                }
                Ok(None) => break,
                Err(error) => {
                    warn!("The connector config watch failed! {error}");
                    break;
                }
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use fabedge_core::endpoint::TunnelEndpoint;

    use super::*;

    fn endpoint(name: &str, endpoint_type: EndpointType, subnet: &str, node_subnet: &str) -> TunnelEndpoint {
        TunnelEndpoint {
            name: name.to_owned(),
            id: format!("C=CN, O=fabedge.io, CN={name}"),
            endpoint_type,
            public_addresses: vec!["203.0.113.7".into()],
            subnets: vec![subnet.parse().unwrap()],
            node_subnets: vec![node_subnet.parse().unwrap()],
        }
    }

    fn config() -> NetworkConfig {
        NetworkConfig::new(
            endpoint(
                "bj.connector",
                EndpointType::Connector,
                "10.233.0.0/16",
                "192.168.1.0/24",
            ),
            vec![
                endpoint("bj.edge1", EndpointType::EdgeNode, "10.1.0.0/24", "203.0.113.7/32"),
                endpoint("bj.edge2", EndpointType::EdgeNode, "10.2.0.0/24", "203.0.113.8/32"),
                endpoint(
                    "sh.connector",
                    EndpointType::Connector,
                    "10.234.0.0/16",
                    "192.168.2.0/24",
                ),
            ],
        )
    }

    #[test]
    fn ipset_memberships_are_exactly_the_endpoint_unions() {
        let memberships = compute_ipset_memberships(&config());

        assert_eq!(
            memberships.edge_pod,
            BTreeSet::from(["10.1.0.0/24".to_owned(), "10.2.0.0/24".to_owned()])
        );
        assert_eq!(
            memberships.edge_node,
            BTreeSet::from(["203.0.113.7/32".to_owned(), "203.0.113.8/32".to_owned()])
        );
        assert_eq!(
            memberships.cloud_pod,
            BTreeSet::from(["10.233.0.0/16".to_owned(), "10.234.0.0/16".to_owned()])
        );
        assert_eq!(
            memberships.cloud_node,
            BTreeSet::from(["192.168.1.0/24".to_owned(), "192.168.2.0/24".to_owned()])
        );
    }

    #[test]
    fn ipset_memberships_are_stable_across_runs() {
        let first = compute_ipset_memberships(&config());
        let second = compute_ipset_memberships(&config());

        assert_eq!(first.edge_pod, second.edge_pod);
        assert_eq!(first.cloud_node, second.cloud_node);
    }

    #[test]
    fn desired_conns_cover_every_peer() {
        let conns = desired_conns(&config());

        assert_eq!(conns.len(), 3);
        assert_eq!(conns["bj.edge1"].remote_subnets, vec!["10.1.0.0/24"]);
        assert_eq!(conns["bj.edge1"].local_subnets, vec!["10.233.0.0/16"]);
        assert_eq!(
            conns["sh.connector"].remote_id,
            "C=CN, O=fabedge.io, CN=sh.connector"
        );
    }
}
