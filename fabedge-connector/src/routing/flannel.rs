use async_trait::async_trait;

use crate::tunnel::ConnConfig;

use super::{
    install_tunnel_routes, parse_route_destinations, remove_tunnel_routes, run_ip,
    ConnectorPrefixes, RouteError, Routing, TUNNEL_ROUTE_TABLE,
};

/// Flannel strategy: cloud-side pod traffic shows up on `cni0` (local pods)
/// and `flannel.1` (other cloud nodes); both count as local prefixes.
pub struct FlannelRouter {
    tunnel_interface: String,
}

impl FlannelRouter {
    pub fn new(tunnel_interface: impl Into<String>) -> Self {
        Self {
            tunnel_interface: tunnel_interface.into(),
        }
    }
}

#[async_trait]
impl Routing for FlannelRouter {
    async fn sync_routes(&self, conns: &[ConnConfig]) -> Result<(), RouteError> {
        install_tunnel_routes(&self.tunnel_interface, conns).await
    }

    async fn clean_routes(&self, conns: &[ConnConfig]) -> Result<(), RouteError> {
        remove_tunnel_routes(conns).await
    }

    async fn connector_prefixes(&self) -> Result<ConnectorPrefixes, RouteError> {
        let mut local_prefixes = Vec::new();
        for device in ["cni0", "flannel.1"] {
            // the device may not exist on a freshly set up gateway
            if let Ok(output) = run_ip(&["route", "show", "dev", device]).await {
                local_prefixes.extend(parse_route_destinations(&output));
            }
        }
        local_prefixes.sort();
        local_prefixes.dedup();

        let remote = run_ip(&["route", "show", "table", TUNNEL_ROUTE_TABLE]).await?;

        Ok(ConnectorPrefixes {
            local_prefixes,
            remote_prefixes: parse_route_destinations(&remote),
        })
    }
}
