use async_trait::async_trait;
use log::debug;

use super::vici::{check_success, Message, ViciClient, ViciError};
use super::{ConnConfig, TunnelManager};

/// Drives strongswan's charon through the VICI socket. The socket is
/// reconnected lazily after any error; charon restarting underneath us is a
/// normal event, the next sync tick recovers.
pub struct StrongSwanManager {
    socket_path: String,
    cert_file: String,
    client: Option<ViciClient>,
}

impl StrongSwanManager {
    pub fn new(socket_path: impl Into<String>, cert_file: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            cert_file: cert_file.into(),
            client: None,
        }
    }

    async fn client(&mut self) -> Result<&mut ViciClient, ViciError> {
        if self.client.is_none() {
            debug!("Connecting to the IPsec daemon at '{}'...", self.socket_path);
            self.client = Some(ViciClient::connect(&self.socket_path).await?);
        }

        Ok(self.client.as_mut().unwrap())
    }

    fn drop_client_on<T>(&mut self, result: Result<T, ViciError>) -> Result<T, ViciError> {
        if matches!(&result, Err(ViciError::Io(_)) | Err(ViciError::Protocol(_))) {
            self.client = None;
        }

        result
    }

    fn load_conn_message(&self, conn: &ConnConfig) -> Message {
        let child = Message::new()
            .set_list("local_ts", conn.local_subnets.clone())
            .set_list("remote_ts", conn.remote_subnets.clone())
            .set("start_action", "trap")
            .set("dpd_action", "clear");

        let section = Message::new()
            .set("version", "2")
            .set_list("remote_addrs", conn.remote_addresses.clone())
            .set("dpd_delay", "30s")
            .set_section(
                "local",
                Message::new()
                    .set("id", conn.local_id.clone())
                    .set("auth", "pubkey")
                    .set_list("certs", [self.cert_file.clone()]),
            )
            .set_section(
                "remote",
                Message::new()
                    .set("id", conn.remote_id.clone())
                    .set("auth", "pubkey"),
            )
            .set_section(
                "children",
                Message::new().set_section(&conn.name, child),
            );

        Message::new().set_section(&conn.name, section)
    }
}

#[async_trait]
impl TunnelManager for StrongSwanManager {
    async fn load_conn(&mut self, conn: &ConnConfig) -> Result<(), ViciError> {
        let message = self.load_conn_message(conn);

        let result = async {
            let client = self.client().await?;
            let answer = client.request("load-conn", message).await?;
            check_success(&answer)
        }
        .await;

        self.drop_client_on(result)
    }

    async fn unload_conn(&mut self, name: &str) -> Result<(), ViciError> {
        let result = async {
            let client = self.client().await?;

            // tear down live SAs first, then drop the config
            let _ = client
                .request(
                    "terminate",
                    Message::new().set("ike", name).set("timeout", "-1"),
                )
                .await;

            let answer = client
                .request("unload-conn", Message::new().set("name", name))
                .await?;
            check_success(&answer)
        }
        .await;

        self.drop_client_on(result)
    }

    async fn list_conn_names(&mut self) -> Result<Vec<String>, ViciError> {
        let result = async {
            let client = self.client().await?;
            let events = client
                .streamed_request("list-conns", "list-conn", Message::new())
                .await?;

            let mut names = Vec::new();
            for event in events {
                names.extend(event.keys().map(str::to_owned));
            }

            Ok(names)
        }
        .await;

        self.drop_client_on(result)
    }

    async fn is_active(&mut self) -> Result<bool, ViciError> {
        let result = async {
            let client = self.client().await?;
            let events = client
                .streamed_request("list-sas", "list-sa", Message::new())
                .await?;

            Ok(events.iter().any(|event| !event.is_empty()))
        }
        .await;

        self.drop_client_on(result)
    }
}

#[cfg(test)]
mod tests {
    use super::super::vici::Element;
    use super::*;

    #[test]
    fn load_conn_message_mirrors_the_config() {
        let manager = StrongSwanManager::new("/run/charon.vici", "/etc/fabedge/tls/tls.crt");
        let conn = ConnConfig {
            name: "sh.edge1".into(),
            local_id: "C=CN, O=fabedge.io, CN=bj.connector".into(),
            remote_id: "C=CN, O=fabedge.io, CN=sh.edge1".into(),
            remote_addresses: vec!["203.0.113.7".into()],
            local_subnets: vec!["10.233.0.0/16".into()],
            remote_subnets: vec!["10.20.1.0/26".into()],
        };

        let message = manager.load_conn_message(&conn);

        let Some(Element::Section(section)) = message.get("sh.edge1") else {
            panic!("the conn section is missing");
        };
        assert_eq!(section.get_str("version"), Some("2"));

        let Some(Element::Section(local)) = section.get("local") else {
            panic!("the local section is missing");
        };
        assert_eq!(local.get_str("id"), Some("C=CN, O=fabedge.io, CN=bj.connector"));
        assert_eq!(
            local.get("certs"),
            Some(&Element::List(vec!["/etc/fabedge/tls/tls.crt".into()]))
        );

        let Some(Element::Section(children)) = section.get("children") else {
            panic!("the children section is missing");
        };
        let Some(Element::Section(child)) = children.get("sh.edge1") else {
            panic!("the child section is missing");
        };
        assert_eq!(
            child.get("remote_ts"),
            Some(&Element::List(vec!["10.20.1.0/26".into()]))
        );
    }
}
