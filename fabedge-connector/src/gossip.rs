use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

use crate::routing::ConnectorPrefixes;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
// a member missing three heartbeats is treated as gone
const SUSPECT_AFTER: Duration = Duration::from_secs(3);
const MAX_DATAGRAM: usize = 64 * 1024;

/// The wire messages of the connector's little membership cluster. Cloud
/// agents learn prefixes from `Prefixes`; everything else is liveness.
/// Unknown payloads are ignored on receive, so the protocol can grow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GossipMessage {
    Alive { name: String },
    Prefixes(ConnectorPrefixes),
}

pub(crate) fn parse_message(payload: &[u8]) -> Option<GossipMessage> {
    serde_json::from_slice(payload).ok()
}

/// A UDP membership cluster with the cloud-agent pods. Delivery is at most
/// once per broadcast round and never relied on for correctness: a lost
/// datagram is healed by the next round.
pub struct Gossip {
    socket: Arc<UdpSocket>,
    name: String,
    init_members: Vec<SocketAddr>,
    members: Arc<RwLock<HashMap<SocketAddr, Instant>>>,
}

impl Gossip {
    pub async fn start(
        listen_address: SocketAddr,
        name: impl Into<String>,
        init_members: Vec<SocketAddr>,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(listen_address).await?);
        let members = Arc::new(RwLock::new(HashMap::new()));

        let gossip = Self {
            socket: socket.clone(),
            name: name.into(),
            init_members,
            members: members.clone(),
        };

        tokio::spawn(receive_loop(socket, members));
        gossip.spawn_heartbeat();

        Ok(gossip)
    }

    fn spawn_heartbeat(&self) {
        let socket = self.socket.clone();
        let members = self.members.clone();
        let init_members = self.init_members.clone();
        let alive = GossipMessage::Alive {
            name: self.name.clone(),
        };

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);

            loop {
                interval.tick().await;

                let payload = match serde_json::to_vec(&alive) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };

                let targets = {
                    let mut members = members.write().await;
                    members.retain(|_, last_seen| last_seen.elapsed() < SUSPECT_AFTER);

                    let mut targets: Vec<SocketAddr> = members.keys().copied().collect();
                    for member in &init_members {
                        if !targets.contains(member) {
                            targets.push(*member);
                        }
                    }
                    targets
                };

                for target in targets {
                    if let Err(error) = socket.send_to(&payload, target).await {
                        debug!("Heartbeat to {target} failed: {error}");
                    }
                }
            }
        });
    }

    /// Sends the current prefixes to every live member. Best effort.
    pub async fn broadcast(&self, prefixes: &ConnectorPrefixes) {
        let message = GossipMessage::Prefixes(prefixes.clone());
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(error) => {
                warn!("Couldn't encode the prefix broadcast! {error}");
                return;
            }
        };

        let targets: Vec<SocketAddr> = {
            let members = self.members.read().await;
            let mut targets: Vec<SocketAddr> = members.keys().copied().collect();
            for member in &self.init_members {
                if !targets.contains(member) {
                    targets.push(*member);
                }
            }
            targets
        };

        for target in targets {
            if let Err(error) = self.socket.send_to(&payload, target).await {
                debug!("Prefix broadcast to {target} failed: {error}");
            }
        }
    }

}

async fn receive_loop(socket: Arc<UdpSocket>, members: Arc<RwLock<HashMap<SocketAddr, Instant>>>) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, sender) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(error) => {
                warn!("The gossip socket failed! {error}");
                return;
            }
        };

        match parse_message(&buffer[..len]) {
            Some(GossipMessage::Alive { name }) => {
                debug!("Member '{name}' at {sender} is alive.");
                members.write().await.insert(sender, Instant::now());
            }
            // the connector is the announcer, not a consumer
            Some(GossipMessage::Prefixes(_)) => {}
            // permissive by design of the protocol: not ours, not an error
            None => debug!("Ignoring an unknown gossip payload from {sender}."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_roundtrip_as_json() {
        let message = GossipMessage::Prefixes(ConnectorPrefixes {
            local_prefixes: vec!["10.233.0.0/16".into()],
            remote_prefixes: vec!["10.20.1.0/26".into()],
        });

        let payload = serde_json::to_vec(&message).unwrap();
        assert_eq!(parse_message(&payload), Some(message));
    }

    #[test]
    fn unknown_payloads_are_ignored() {
        assert_eq!(parse_message(b"not json at all"), None);
        assert_eq!(parse_message(br#"{"type":"somethingElse","x":1}"#), None);
        assert_eq!(parse_message(b""), None);
    }

    #[test]
    fn alive_messages_carry_the_member_name() {
        let payload = br#"{"type":"alive","name":"cloud-agent-1"}"#;

        assert_eq!(
            parse_message(payload),
            Some(GossipMessage::Alive {
                name: "cloud-agent-1".into()
            })
        );
    }
}
