use async_trait::async_trait;

use crate::tunnel::ConnConfig;

use super::{
    install_tunnel_routes, parse_route_destinations, remove_tunnel_routes, run_ip,
    ConnectorPrefixes, RouteError, Routing, TUNNEL_ROUTE_TABLE,
};

/// Calico strategy: bird programs the cloud-side pod routes, so everything
/// it owns (including the local pool's blackhole route) is a local prefix.
pub struct CalicoRouter {
    tunnel_interface: String,
}

impl CalicoRouter {
    pub fn new(tunnel_interface: impl Into<String>) -> Self {
        Self {
            tunnel_interface: tunnel_interface.into(),
        }
    }
}

#[async_trait]
impl Routing for CalicoRouter {
    async fn sync_routes(&self, conns: &[ConnConfig]) -> Result<(), RouteError> {
        install_tunnel_routes(&self.tunnel_interface, conns).await
    }

    async fn clean_routes(&self, conns: &[ConnConfig]) -> Result<(), RouteError> {
        remove_tunnel_routes(conns).await
    }

    async fn connector_prefixes(&self) -> Result<ConnectorPrefixes, RouteError> {
        let local = run_ip(&["route", "show", "proto", "bird"]).await?;
        let remote = run_ip(&["route", "show", "table", TUNNEL_ROUTE_TABLE]).await?;

        Ok(ConnectorPrefixes {
            local_prefixes: parse_route_destinations(&local),
            remote_prefixes: parse_route_destinations(&remote),
        })
    }
}
