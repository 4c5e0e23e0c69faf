use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::community::Community;
use crate::endpoint::TunnelEndpoint;

/// A certificate as returned by the federation API, in both encodings so
/// callers can pick whichever their TLS stack wants.
#[serde_as]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    #[serde_as(as = "Base64")]
    pub der: Vec<u8>,
    pub pem: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointsAndCommunities {
    pub endpoints: Vec<TunnelEndpoint>,
    pub communities: Vec<Community>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEndpointsRequest {
    pub cluster: String,
    pub endpoints: Vec<TunnelEndpoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_der_travels_as_base64() {
        let cert = Certificate {
            der: vec![1, 2, 3, 4],
            pem: "-----BEGIN CERTIFICATE-----".into(),
        };

        let json = serde_json::to_value(&cert).unwrap();
        assert_eq!(json["der"], "AQIDBA==");

        let back: Certificate = serde_json::from_value(json).unwrap();
        assert_eq!(back, cert);
    }
}
