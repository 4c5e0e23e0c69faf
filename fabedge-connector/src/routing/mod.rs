use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::cli::CniType;
use crate::tunnel::ConnConfig;

pub mod calico;
pub mod flannel;

/// Routes to edge subnets live in the IPsec daemon's routing table so they
/// vanish with the daemon instead of blackholing traffic.
pub const TUNNEL_ROUTE_TABLE: &str = "220";

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Couldn't run '{}'! Reason: {}", .command, .source)]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{}' failed: {}", .command, .stderr)]
    CommandFailed { command: String, stderr: String },
}

/// The prefixes gossiped to cloud agents: what sits behind this connector
/// locally, and what is reachable through its tunnels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorPrefixes {
    pub local_prefixes: Vec<String>,
    pub remote_prefixes: Vec<String>,
}

impl ConnectorPrefixes {
    pub fn is_announcable(&self) -> bool {
        !self.local_prefixes.is_empty() && !self.remote_prefixes.is_empty()
    }
}

/// The closed set of per-CNI route strategies.
#[async_trait]
pub trait Routing: Send + Sync {
    async fn sync_routes(&self, conns: &[ConnConfig]) -> Result<(), RouteError>;

    async fn clean_routes(&self, conns: &[ConnConfig]) -> Result<(), RouteError>;

    async fn connector_prefixes(&self) -> Result<ConnectorPrefixes, RouteError>;
}

pub fn new_router(cni: CniType, tunnel_interface: &str) -> Box<dyn Routing> {
    match cni {
        CniType::Calico => Box::new(calico::CalicoRouter::new(tunnel_interface)),
        CniType::Flannel => Box::new(flannel::FlannelRouter::new(tunnel_interface)),
    }
}

pub(crate) async fn run_ip(args: &[&str]) -> Result<String, RouteError> {
    let command = format!("ip {}", args.join(" "));

    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|source| RouteError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(RouteError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Replaces the routes for every remote subnet of the given connections via
/// the tunnel interface.
pub(crate) async fn install_tunnel_routes(
    interface: &str,
    conns: &[ConnConfig],
) -> Result<(), RouteError> {
    for subnet in remote_subnets(conns) {
        run_ip(&[
            "route", "replace", &subnet, "dev", interface, "table", TUNNEL_ROUTE_TABLE, "proto",
            "static",
        ])
        .await?;
    }

    Ok(())
}

pub(crate) async fn remove_tunnel_routes(conns: &[ConnConfig]) -> Result<(), RouteError> {
    for subnet in remote_subnets(conns) {
        // a missing route is already what we want
        let _ = run_ip(&["route", "del", &subnet, "table", TUNNEL_ROUTE_TABLE]).await;
    }

    Ok(())
}

pub(crate) fn remote_subnets(conns: &[ConnConfig]) -> Vec<String> {
    let mut subnets: Vec<String> = conns
        .iter()
        .flat_map(|conn| conn.remote_subnets.iter().cloned())
        .collect();
    subnets.sort();
    subnets.dedup();

    subnets
}

/// Pulls the destination prefixes out of `ip route show` output.
pub(crate) fn parse_route_destinations(output: &str) -> Vec<String> {
    let mut destinations: Vec<String> = output
        .lines()
        .filter_map(|line| {
            line.split_whitespace()
                .find(|token| token.contains('/'))
                .map(str::to_owned)
        })
        .collect();
    destinations.sort();
    destinations.dedup();

    destinations
}
