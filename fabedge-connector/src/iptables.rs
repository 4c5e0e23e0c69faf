use thiserror::Error;
use tokio::process::Command;

use crate::ipset::{
    IPSET_CLOUD_NODE_CIDR, IPSET_CLOUD_POD_CIDR, IPSET_EDGE_NODE_CIDR, IPSET_EDGE_POD_CIDR,
};

pub const CHAIN_FORWARD: &str = "FABEDGE-FORWARD";
pub const CHAIN_POSTROUTING: &str = "FABEDGE-POSTROUTING";
pub const CHAIN_INPUT: &str = "FABEDGE-INPUT";

#[derive(Debug, Error)]
pub enum IptablesError {
    #[error("Couldn't run '{}'! Reason: {}", .command, .source)]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{}' failed: {}", .command, .stderr)]
    CommandFailed { command: String, stderr: String },
}

/// Owns the FABEDGE chains on the gateway. Each sync flushes and rebuilds
/// the private chains, so a damaged rule set self-heals and a repeated sync
/// is a no-op at the kernel level.
pub struct Iptables {
    masquerade: bool,
}

impl Iptables {
    pub fn new(masquerade: bool) -> Self {
        Self { masquerade }
    }

    /// filter/FORWARD: accept everything to or from the federated CIDR sets.
    pub async fn ensure_forward_rules(&self) -> Result<(), IptablesError> {
        self.rebuild_chain("filter", "FORWARD", CHAIN_FORWARD, &forward_rules())
            .await
    }

    /// nat/POSTROUTING: masquerade cloud-bound edge traffic when enabled.
    pub async fn ensure_nat_rules(&self) -> Result<(), IptablesError> {
        self.rebuild_chain(
            "nat",
            "POSTROUTING",
            CHAIN_POSTROUTING,
            &nat_rules(self.masquerade),
        )
        .await
    }

    /// filter/INPUT: let IKE and ESP reach the daemon.
    pub async fn ensure_input_rules(&self) -> Result<(), IptablesError> {
        self.rebuild_chain("filter", "INPUT", CHAIN_INPUT, &input_rules())
            .await
    }

    /// Drops the SNAT chain on shutdown. The FORWARD chain stays: every
    /// agent reconciles its own node's chain independently.
    pub async fn clean_nat_rules(&self) -> Result<(), IptablesError> {
        let jump = ["-t", "nat", "-D", "POSTROUTING", "-j", CHAIN_POSTROUTING];
        let _ = run_iptables(&jump).await;

        let _ = run_iptables(&["-t", "nat", "-F", CHAIN_POSTROUTING]).await;
        let _ = run_iptables(&["-t", "nat", "-X", CHAIN_POSTROUTING]).await;

        Ok(())
    }

    async fn rebuild_chain(
        &self,
        table: &str,
        parent: &str,
        chain: &str,
        rules: &[Vec<String>],
    ) -> Result<(), IptablesError> {
        run_iptables_tolerant(&["-t", table, "-N", chain]).await?;
        run_iptables(&["-t", table, "-F", chain]).await?;

        for rule in rules {
            let mut args: Vec<&str> = vec!["-t", table, "-A", chain];
            args.extend(rule.iter().map(String::as_str));
            run_iptables(&args).await?;
        }

        // ensure the single jump from the parent chain exists
        let check = ["-t", table, "-C", parent, "-j", chain];
        if run_iptables(&check).await.is_err() {
            run_iptables(&["-t", table, "-I", parent, "1", "-j", chain]).await?;
        }

        Ok(())
    }
}

fn match_set(set: &str, direction: &str) -> Vec<String> {
    vec![
        "-m".into(),
        "set".into(),
        "--match-set".into(),
        set.into(),
        direction.into(),
    ]
}

fn forward_rules() -> Vec<Vec<String>> {
    let mut rules = Vec::new();

    for set in [
        IPSET_EDGE_POD_CIDR,
        IPSET_EDGE_NODE_CIDR,
        IPSET_CLOUD_POD_CIDR,
        IPSET_CLOUD_NODE_CIDR,
    ] {
        for direction in ["src", "dst"] {
            let mut rule = match_set(set, direction);
            rule.extend(["-j".into(), "ACCEPT".into()]);
            rules.push(rule);
        }
    }

    rules
}

fn nat_rules(masquerade: bool) -> Vec<Vec<String>> {
    if !masquerade {
        return Vec::new();
    }

    // SNAT cloud-bound traffic from edge pods unless it stays inside the
    // federated pod networks
    let mut rule = match_set(IPSET_EDGE_POD_CIDR, "src");
    rule.extend(
        ["-m", "set", "!", "--match-set", IPSET_CLOUD_POD_CIDR, "dst"]
            .map(str::to_owned),
    );
    rule.extend(["-j".into(), "MASQUERADE".into()]);

    vec![rule]
}

fn input_rules() -> Vec<Vec<String>> {
    vec![
        vec!["-p".into(), "udp".into(), "--dport".into(), "500".into(), "-j".into(), "ACCEPT".into()],
        vec!["-p".into(), "udp".into(), "--dport".into(), "4500".into(), "-j".into(), "ACCEPT".into()],
        vec!["-p".into(), "esp".into(), "-j".into(), "ACCEPT".into()],
    ]
}

async fn run_iptables(args: &[&str]) -> Result<String, IptablesError> {
    let command = format!("iptables {}", args.join(" "));

    let output = Command::new("iptables")
        .args(args)
        .output()
        .await
        .map_err(|source| IptablesError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(IptablesError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `-N` on an existing chain fails; that's the normal steady state.
async fn run_iptables_tolerant(args: &[&str]) -> Result<(), IptablesError> {
    match run_iptables(args).await {
        Ok(_) => Ok(()),
        Err(IptablesError::CommandFailed { .. }) => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_rules_accept_both_directions_of_every_set() {
        let rules = forward_rules();

        assert_eq!(rules.len(), 8);
        assert!(rules
            .iter()
            .all(|rule| rule.last().map(String::as_str) == Some("ACCEPT")));
        assert!(rules
            .iter()
            .any(|rule| rule.contains(&IPSET_EDGE_POD_CIDR.to_owned())
                && rule.contains(&"dst".to_owned())));
    }

    #[test]
    fn nat_rules_exist_only_with_masquerade() {
        assert!(nat_rules(false).is_empty());

        let rules = nat_rules(true);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].last().map(String::as_str), Some("MASQUERADE"));
    }

    #[test]
    fn input_rules_admit_ike_and_esp() {
        let rules = input_rules();

        assert_eq!(rules.len(), 3);
        assert!(rules.iter().any(|rule| rule.contains(&"500".to_owned())));
        assert!(rules.iter().any(|rule| rule.contains(&"4500".to_owned())));
        assert!(rules.iter().any(|rule| rule.contains(&"esp".to_owned())));
    }
}
