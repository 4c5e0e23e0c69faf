use log::warn;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use super::CertError;

/// A freshly generated private key with a certificate request for it. The
/// key never leaves the process that created it; only the CSR travels.
pub struct CertRequest {
    pub key_pem: String,
    pub csr_der: Vec<u8>,
    pub csr_pem: String,
}

/// Generates a P-256 key pair and a CSR with the given subject.
pub fn new_cert_request(
    common_name: &str,
    organization: &str,
) -> Result<CertRequest, CertError> {
    new_cert_request_with_dn(&[
        ("O".to_owned(), organization.to_owned()),
        ("CN".to_owned(), common_name.to_owned()),
    ])
}

/// Generates a key pair and a CSR whose subject is built from DN attribute
/// pairs, in order (the parsed form of a configured endpoint id).
pub fn new_cert_request_with_dn(dn_pairs: &[(String, String)]) -> Result<CertRequest, CertError> {
    let key_pair = KeyPair::generate()
        .map_err(|error| CertError::Generation(format!("key generation failed: {error}")))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(dn_pairs)?;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|error| CertError::Generation(format!("CSR serialization failed: {error}")))?;

    Ok(CertRequest {
        key_pem: key_pair.serialize_pem(),
        csr_der: csr.der().to_vec(),
        csr_pem: csr
            .pem()
            .map_err(|error| CertError::Generation(error.to_string()))?,
    })
}

fn distinguished_name(dn_pairs: &[(String, String)]) -> Result<DistinguishedName, CertError> {
    let mut dn = DistinguishedName::new();
    let mut has_cn = false;

    for (key, value) in dn_pairs {
        let dn_type = match key.as_str() {
            "C" => DnType::CountryName,
            "ST" => DnType::StateOrProvinceName,
            "L" => DnType::LocalityName,
            "O" => DnType::OrganizationName,
            "OU" => DnType::OrganizationalUnitName,
            "CN" => {
                has_cn = true;
                DnType::CommonName
            }
            other => {
                warn!("Ignoring unsupported DN attribute '{other}'!");
                continue;
            }
        };

        dn.push(dn_type, value.clone());
    }

    if !has_cn {
        return Err(CertError::Generation(
            "subject has no common name".to_owned(),
        ));
    }

    Ok(dn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::csr_common_name;
    use crate::endpoint::parse_dn_pairs;

    #[test]
    fn request_carries_the_requested_common_name() {
        let request = new_cert_request("sh.fabedge-client", "fabedge.io").unwrap();

        assert_eq!(csr_common_name(&request.csr_der).unwrap(), "sh.fabedge-client");
        assert!(request.key_pem.contains("PRIVATE KEY"));
        assert!(request.csr_pem.contains("CERTIFICATE REQUEST"));
    }

    #[test]
    fn request_from_endpoint_id_template() {
        let pairs = parse_dn_pairs("C=CN, O=fabedge.io, CN=bj.edge1");
        let request = new_cert_request_with_dn(&pairs).unwrap();

        assert_eq!(csr_common_name(&request.csr_der).unwrap(), "bj.edge1");
    }

    #[test]
    fn request_without_common_name_fails() {
        let pairs = vec![("O".to_owned(), "fabedge.io".to_owned())];

        assert!(new_cert_request_with_dn(&pairs).is_err());
    }
}
