use std::collections::BTreeSet;

use thiserror::Error;
use tokio::process::Command;

pub const IPSET_EDGE_POD_CIDR: &str = "FABEDGE-EDGE-POD-CIDR";
pub const IPSET_EDGE_NODE_CIDR: &str = "FABEDGE-EDGE-NODE-CIDR";
pub const IPSET_CLOUD_POD_CIDR: &str = "FABEDGE-CLOUD-POD-CIDR";
pub const IPSET_CLOUD_NODE_CIDR: &str = "FABEDGE-CLOUD-NODE-CIDR";

#[derive(Debug, Error)]
pub enum IpsetError {
    #[error("Couldn't run '{}'! Reason: {}", .command, .source)]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{}' failed: {}", .command, .stderr)]
    CommandFailed { command: String, stderr: String },
}

/// Reconciles `hash:net` sets to an exact desired membership via the ipset
/// binary. Create is idempotent (`-exist`), membership converges through an
/// add/del diff, so running a sync twice changes nothing the second time.
#[derive(Default)]
pub struct Ipset;

impl Ipset {
    pub fn new() -> Self {
        Self
    }

    pub async fn sync_set(
        &self,
        name: &str,
        desired: &BTreeSet<String>,
    ) -> Result<(), IpsetError> {
        run_ipset(&["create", name, "hash:net", "-exist"]).await?;

        let output = run_ipset(&["list", name]).await?;
        let current = parse_members(&output);

        let (to_add, to_del) = compute_diff(desired, &current);

        for entry in &to_add {
            run_ipset(&["add", name, entry, "-exist"]).await?;
        }
        for entry in &to_del {
            run_ipset(&["del", name, entry, "-exist"]).await?;
        }

        Ok(())
    }
}

async fn run_ipset(args: &[&str]) -> Result<String, IpsetError> {
    let command = format!("ipset {}", args.join(" "));

    let output = Command::new("ipset")
        .args(args)
        .output()
        .await
        .map_err(|source| IpsetError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(IpsetError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Member entries of `ipset list` output: everything below the `Members:`
/// header.
pub(crate) fn parse_members(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .skip_while(|line| line.trim() != "Members:")
        .skip(1)
        .filter_map(|line| {
            let entry = line.split_whitespace().next()?;

            (!entry.is_empty()).then(|| entry.to_owned())
        })
        .collect()
}

pub(crate) fn compute_diff(
    desired: &BTreeSet<String>,
    current: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let to_add = desired.difference(current).cloned().collect();
    let to_del = current.difference(desired).cloned().collect();

    (to_add, to_del)
}
