use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;

use crate::netconf::{NetworkConfig, NETCONF_KEY};

use super::labels::get_connector_labels;
use super::ResourceGenerationError;

/// The config artifact the connector watches.
pub const CONNECTOR_CONFIG_NAME: &str = "fabedge-connector-config";

pub fn generate_connector_configmap(
    namespace: &str,
    config: &NetworkConfig,
) -> Result<ConfigMap, ResourceGenerationError> {
    let payload = config
        .to_json()
        .map_err(|error| ResourceGenerationError::PayloadEncoding(error.to_string()))?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONNECTOR_CONFIG_NAME.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(get_connector_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(NETCONF_KEY.to_owned(), payload)])),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointType, TunnelEndpoint};

    #[test]
    fn configmap_roundtrips_the_config() {
        let config = NetworkConfig::new(
            TunnelEndpoint {
                name: "bj.connector".into(),
                id: "C=CN, O=fabedge.io, CN=bj.connector".into(),
                endpoint_type: EndpointType::Connector,
                public_addresses: vec!["203.0.113.5".into()],
                subnets: vec!["10.233.0.0/16".parse().unwrap()],
                node_subnets: vec!["192.0.2.0/24".parse().unwrap()],
            },
            Vec::new(),
        );

        let configmap = generate_connector_configmap("fabedge", &config).unwrap();

        assert_eq!(
            configmap.metadata.name.as_deref(),
            Some(CONNECTOR_CONFIG_NAME)
        );
        let payload = &configmap.data.unwrap()[NETCONF_KEY];
        assert_eq!(NetworkConfig::from_json(payload).unwrap(), config);
    }
}
