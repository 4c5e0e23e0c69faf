use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};

use super::{
    csr_common_name, pem_to_der, validate_common_name, verify_cert_against, CertError,
    CertManager, ExtKeyUsage,
};

pub const DEFAULT_CA_COMMON_NAME: &str = "Fabedge CA";

/// The host-side manager: holds the CA key pair and signs directly.
pub struct LocalCertManager {
    ca_cert_pem: String,
    ca_key_pem: String,
    ca_der: Vec<u8>,
    validity_days: i64,
}

impl LocalCertManager {
    pub fn new(
        ca_cert_pem: String,
        ca_key_pem: String,
        validity_days: i64,
    ) -> Result<Self, CertError> {
        // fail fast on unusable CA material
        KeyPair::from_pem(&ca_key_pem)
            .map_err(|error| CertError::Parse(format!("bad CA key: {error}")))?;
        let ca_der = pem_to_der(ca_cert_pem.as_bytes())?;

        Ok(Self {
            ca_cert_pem,
            ca_key_pem,
            ca_der,
            validity_days,
        })
    }

    /// Creates a fresh self-signed CA, returned as (cert PEM, key PEM).
    pub fn generate_ca(
        organization: &str,
        validity_days: i64,
    ) -> Result<(String, String), CertError> {
        let key_pair = KeyPair::generate()
            .map_err(|error| CertError::Generation(format!("CA key generation failed: {error}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DEFAULT_CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, organization);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        (params.not_before, params.not_after) = validity_window(validity_days);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|error| CertError::Generation(format!("CA self-signing failed: {error}")))?;

        Ok((cert.pem(), key_pair.serialize_pem()))
    }

    /// Issues a TLS server certificate from this CA, returned as
    /// (cert PEM, key PEM). Used for the federation API server.
    pub fn issue_server_cert(
        &self,
        common_name: &str,
        sans: &[String],
    ) -> Result<(String, String), CertError> {
        let server_key = KeyPair::generate()
            .map_err(|error| CertError::Generation(format!("key generation failed: {error}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        (params.not_before, params.not_after) = validity_window(self.validity_days);

        for san in sans {
            let san = match san.parse::<std::net::IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(
                    rcgen::string::Ia5String::try_from(san.clone())
                        .map_err(|error| CertError::Generation(format!("bad SAN '{san}': {error}")))?,
                ),
            };
            params.subject_alt_names.push(san);
        }

        let issuer = self.issuer()?;
        let cert = params
            .signed_by(&server_key, &issuer)
            .map_err(|error| CertError::Generation(format!("server cert signing failed: {error}")))?;

        Ok((cert.pem(), server_key.serialize_pem()))
    }

    /// PKCS#8 DER of the CA private key, for bootstrap-token signing.
    pub fn ca_key_pkcs8(&self) -> Result<Vec<u8>, CertError> {
        let key_pair = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|error| CertError::Parse(format!("bad CA key: {error}")))?;

        Ok(key_pair.serialize_der())
    }

    fn issuer(&self) -> Result<Issuer<'_, KeyPair>, CertError> {
        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|error| CertError::Parse(format!("bad CA key: {error}")))?;

        Issuer::from_ca_cert_pem(&self.ca_cert_pem, ca_key)
            .map_err(|error| CertError::Parse(format!("bad CA certificate: {error}")))
    }
}

#[async_trait]
impl CertManager for LocalCertManager {
    async fn sign_cert(&self, csr_der: &[u8]) -> Result<Vec<u8>, CertError> {
        validate_common_name(&csr_common_name(csr_der)?)?;

        let csr_pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE REQUEST", csr_der));
        let mut csr_params = CertificateSigningRequestParams::from_pem(&csr_pem)
            .map_err(|error| CertError::Parse(format!("bad CSR: {error}")))?;

        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        (csr_params.params.not_before, csr_params.params.not_after) =
            validity_window(self.validity_days);

        let issuer = self.issuer()?;
        let cert = csr_params
            .signed_by(&issuer)
            .map_err(|error| CertError::Generation(format!("CSR signing failed: {error}")))?;

        Ok(cert.der().to_vec())
    }

    fn verify_cert(&self, cert_pem: &[u8], usages: &[ExtKeyUsage]) -> Result<(), CertError> {
        verify_cert_against(&self.ca_der, cert_pem, usages)
    }

    fn ca_cert_der(&self) -> Vec<u8> {
        self.ca_der.clone()
    }

    fn ca_cert_pem(&self) -> Vec<u8> {
        self.ca_cert_pem.clone().into_bytes()
    }
}

fn validity_window(days: i64) -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();

    (now, now + Duration::days(days))
}

#[cfg(test)]
mod tests {
    use x509_parser::prelude::*;

    use super::*;
    use crate::cert::{
        der_to_cert_pem, needs_renewal, new_cert_request, EXT_KEY_USAGES_SERVER_AND_CLIENT,
    };

    fn manager(validity_days: i64) -> LocalCertManager {
        let (cert_pem, key_pem) = LocalCertManager::generate_ca("fabedge.io", 3650).unwrap();

        LocalCertManager::new(cert_pem, key_pem, validity_days).unwrap()
    }

    #[tokio::test]
    async fn issued_certs_chain_to_the_ca_with_requested_validity() {
        let manager = manager(365);
        let request = new_cert_request("bj.edge1", "fabedge.io").unwrap();

        let cert_der = manager.sign_cert(&request.csr_der).await.unwrap();
        let cert_pem = der_to_cert_pem(&cert_der);

        manager
            .verify_cert(&cert_pem, EXT_KEY_USAGES_SERVER_AND_CLIENT)
            .unwrap();

        let (_, cert) = X509Certificate::from_der(&cert_der).unwrap();
        let lifetime = cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp();
        assert!((lifetime - 365 * 24 * 3600).abs() <= 5);

        // fresh cert is nowhere near its renewal horizon
        assert!(!needs_renewal(&cert_pem));
    }

    #[tokio::test]
    async fn forbidden_common_names_are_not_signed() {
        let manager = manager(365);
        let request = new_cert_request_with_uppercase_cn();

        assert!(matches!(
            manager.sign_cert(&request).await,
            Err(CertError::ForbiddenCommonName(_))
        ));
    }

    fn new_cert_request_with_uppercase_cn() -> Vec<u8> {
        crate::cert::csr::new_cert_request_with_dn(&[(
            "CN".to_owned(),
            "EVIL.Impersonator".to_owned(),
        )])
        .unwrap()
        .csr_der
    }

    #[tokio::test]
    async fn certs_from_another_ca_fail_verification() {
        let issuing = manager(365);
        let verifying = manager(365);
        let request = new_cert_request("bj.edge1", "fabedge.io").unwrap();

        let cert_der = issuing.sign_cert(&request.csr_der).await.unwrap();
        let cert_pem = der_to_cert_pem(&cert_der);

        assert!(issuing.verify_cert(&cert_pem, &[]).is_ok());
        assert!(matches!(
            verifying.verify_cert(&cert_pem, &[]),
            Err(CertError::UntrustedIssuer)
        ));
    }

    #[test]
    fn server_cert_carries_sans() {
        let manager = manager(365);

        let (cert_pem, key_pem) = manager
            .issue_server_cert("fabedge-api-server", &["192.0.2.7".to_owned(), "api.fabedge.io".to_owned()])
            .unwrap();

        assert!(key_pem.contains("PRIVATE KEY"));

        let cert_der = super::pem_to_der(cert_pem.as_bytes()).unwrap();
        let (_, cert) = X509Certificate::from_der(&cert_der).unwrap();
        let sans = cert
            .subject_alternative_name()
            .unwrap()
            .expect("server cert should carry SANs");
        assert_eq!(sans.value.general_names.len(), 2);
    }
}
