use std::sync::OnceLock;

use async_trait::async_trait;
use aws_lc_rs::digest::{digest, SHA256};
use regex::Regex;
use thiserror::Error;
use x509_parser::prelude::*;

pub mod csr;
pub mod local;
pub mod remote;

pub use csr::{new_cert_request, new_cert_request_with_dn, CertRequest};
pub use local::LocalCertManager;
pub use remote::{CsrSigner, RemoteCertManager};

/// Certificates are re-issued once less than this fraction of their validity
/// remains.
pub const RENEWAL_THRESHOLD: f64 = 1.0 / 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtKeyUsage {
    ServerAuth,
    ClientAuth,
}

pub const EXT_KEY_USAGES_SERVER_AND_CLIENT: &[ExtKeyUsage] =
    &[ExtKeyUsage::ServerAuth, ExtKeyUsage::ClientAuth];

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Couldn't parse certificate data! Reason: {}", .0)]
    Parse(String),
    #[error("Couldn't generate certificate material! Reason: {}", .0)]
    Generation(String),
    #[error("The CSR common name '{}' is not permitted!", .0)]
    ForbiddenCommonName(String),
    #[error("The certificate was not issued by this CA!")]
    UntrustedIssuer,
    #[error("The certificate is expired or not yet valid!")]
    OutsideValidityPeriod,
    #[error("The certificate is missing a required key usage!")]
    MissingKeyUsage,
    #[error("Remote signing failed! Reason: {}", .0)]
    RemoteSigning(String),
}

/// The outward contract shared by both manager variants: sign a CSR against
/// the CA, verify a presented cert against the CA, hand out the CA cert.
#[async_trait]
pub trait CertManager: Send + Sync {
    async fn sign_cert(&self, csr_der: &[u8]) -> Result<Vec<u8>, CertError>;

    fn verify_cert(&self, cert_pem: &[u8], usages: &[ExtKeyUsage]) -> Result<(), CertError>;

    fn ca_cert_der(&self) -> Vec<u8>;

    fn ca_cert_pem(&self) -> Vec<u8>;
}

fn dns1123_subdomain() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
    })
}

/// Every identity this CA signs is a dotted DNS-1123 name
/// (`<cluster>.<node>`, `<cluster>.connector`, `<cluster>.fabedge-client`).
/// Anything else in a CSR is an impersonation attempt or a typo; both are
/// rejected before signing.
pub fn validate_common_name(common_name: &str) -> Result<(), CertError> {
    if dns1123_subdomain().is_match(common_name) {
        Ok(())
    } else {
        Err(CertError::ForbiddenCommonName(common_name.to_owned()))
    }
}

/// Extracts the subject CN of a DER-encoded CSR.
pub fn csr_common_name(csr_der: &[u8]) -> Result<String, CertError> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|error| CertError::Parse(format!("bad CSR: {error}")))?;

    let common_name = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned);

    common_name.ok_or_else(|| CertError::Parse("CSR subject has no common name".to_owned()))
}

pub fn pem_to_der(pem_data: &[u8]) -> Result<Vec<u8>, CertError> {
    let parsed = ::pem::parse(pem_data).map_err(|error| CertError::Parse(error.to_string()))?;

    Ok(parsed.contents().to_vec())
}

pub fn der_to_cert_pem(der: &[u8]) -> Vec<u8> {
    ::pem::encode(&::pem::Pem::new("CERTIFICATE", der)).into_bytes()
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
pub fn cert_fingerprint(cert_der: &[u8]) -> String {
    digest(&SHA256, cert_der)
        .as_ref()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Chain, validity window and extended-key-usage verification shared by both
/// manager variants.
pub fn verify_cert_against(
    ca_der: &[u8],
    cert_pem: &[u8],
    usages: &[ExtKeyUsage],
) -> Result<(), CertError> {
    let cert_der = pem_to_der(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|error| CertError::Parse(format!("bad certificate: {error}")))?;
    let (_, ca) = X509Certificate::from_der(ca_der)
        .map_err(|error| CertError::Parse(format!("bad CA certificate: {error}")))?;

    if cert.issuer().as_raw() != ca.subject().as_raw() {
        return Err(CertError::UntrustedIssuer);
    }

    cert.verify_signature(Some(ca.public_key()))
        .map_err(|_| CertError::UntrustedIssuer)?;

    if !cert.validity().is_valid() {
        return Err(CertError::OutsideValidityPeriod);
    }

    if !usages.is_empty() {
        let eku = cert
            .extended_key_usage()
            .map_err(|error| CertError::Parse(error.to_string()))?
            .map(|extension| extension.value)
            .ok_or(CertError::MissingKeyUsage)?;

        for usage in usages {
            let present = match usage {
                ExtKeyUsage::ServerAuth => eku.server_auth,
                ExtKeyUsage::ClientAuth => eku.client_auth,
            };
            if !present {
                return Err(CertError::MissingKeyUsage);
            }
        }
    }

    Ok(())
}

/// Whether a certificate is past its renewal horizon: expired, unparseable
/// or with less than [`RENEWAL_THRESHOLD`] of its validity remaining.
pub fn needs_renewal(cert_pem: &[u8]) -> bool {
    let Ok(cert_der) = pem_to_der(cert_pem) else {
        return true;
    };
    let Ok((_, cert)) = X509Certificate::from_der(&cert_der) else {
        return true;
    };

    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();
    let now = chrono::Utc::now().timestamp();

    let lifetime = not_after - not_before;
    let remaining = not_after - now;

    lifetime <= 0 || (remaining as f64) < (lifetime as f64) * RENEWAL_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_name_pattern_rejects_impersonation() {
        assert!(validate_common_name("bj.edge1").is_ok());
        assert!(validate_common_name("sh.fabedge-client").is_ok());
        assert!(validate_common_name("bj.connector").is_ok());

        assert!(validate_common_name("").is_err());
        assert!(validate_common_name("Bj.Edge1").is_err());
        assert!(validate_common_name("bj..edge1").is_err());
        assert!(validate_common_name("bj.edge1, O=evil").is_err());
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let fp = cert_fingerprint(b"some der bytes");

        assert_eq!(fp.len(), 64);
        assert_eq!(fp, cert_fingerprint(b"some der bytes"));
        assert_ne!(fp, cert_fingerprint(b"other der bytes"));
    }

    #[test]
    fn garbage_pem_needs_renewal() {
        assert!(needs_renewal(b"not a pem"));
    }
}
