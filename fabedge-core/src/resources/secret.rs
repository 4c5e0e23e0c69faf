use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;

use super::ResourceGenerationError;

pub const TLS_CA_CERT_KEY: &str = "ca.crt";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";

pub const CA_CERT_KEY: &str = "ca.crt";
pub const CA_KEY_KEY: &str = "ca.key";

/// The per-node agent TLS secret, `<prefix>-<node>-tls`.
pub fn agent_tls_secret_name(node_name: &str) -> String {
    format!("fabedge-agent-{node_name}-tls")
}

pub const API_CLIENT_TLS_SECRET_NAME: &str = "fabedge-api-client-tls";

pub fn build_tls_secret(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    ca_cert_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_owned()),
        data: Some(BTreeMap::from([
            (TLS_CA_CERT_KEY.to_owned(), ByteString(ca_cert_pem.to_vec())),
            (TLS_CERT_KEY.to_owned(), ByteString(cert_pem.to_vec())),
            (TLS_KEY_KEY.to_owned(), ByteString(key_pem.to_vec())),
        ])),
        ..Default::default()
    }
}

pub fn secret_data<'a>(
    secret: &'a Secret,
    key: &'static str,
) -> Result<&'a [u8], ResourceGenerationError> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.as_slice())
        .ok_or(ResourceGenerationError::DependentMissingData(key.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_secret_name_follows_the_convention() {
        assert_eq!(agent_tls_secret_name("edge1"), "fabedge-agent-edge1-tls");
    }

    #[test]
    fn tls_secret_carries_all_three_fields() {
        let secret = build_tls_secret(
            "fabedge-agent-edge1-tls",
            "fabedge",
            BTreeMap::new(),
            b"ca",
            b"cert",
            b"key",
        );

        assert_eq!(secret_data(&secret, TLS_CA_CERT_KEY).unwrap(), b"ca");
        assert_eq!(secret_data(&secret, TLS_CERT_KEY).unwrap(), b"cert");
        assert_eq!(secret_data(&secret, TLS_KEY_KEY).unwrap(), b"key");
        assert!(secret_data(&secret, "missing").is_err());
    }
}
