use std::sync::Arc;

use async_trait::async_trait;

use super::{
    csr_common_name, der_to_cert_pem, validate_common_name, verify_cert_against, CertError,
    CertManager, ExtKeyUsage,
};

/// Signs a CSR somewhere else. On member clusters this is the federation API
/// client calling the host's `/api/signcert`.
#[async_trait]
pub trait CsrSigner: Send + Sync {
    async fn sign(&self, csr_der: &[u8]) -> Result<Vec<u8>, CertError>;
}

/// The member-side manager: holds only the CA certificate and delegates
/// signing. The CA private key never leaves the host operator.
pub struct RemoteCertManager {
    ca_der: Vec<u8>,
    signer: Arc<dyn CsrSigner>,
}

impl RemoteCertManager {
    pub fn new(ca_der: Vec<u8>, signer: Arc<dyn CsrSigner>) -> Self {
        Self { ca_der, signer }
    }
}

#[async_trait]
impl CertManager for RemoteCertManager {
    async fn sign_cert(&self, csr_der: &[u8]) -> Result<Vec<u8>, CertError> {
        validate_common_name(&csr_common_name(csr_der)?)?;

        self.signer.sign(csr_der).await
    }

    fn verify_cert(&self, cert_pem: &[u8], usages: &[ExtKeyUsage]) -> Result<(), CertError> {
        verify_cert_against(&self.ca_der, cert_pem, usages)
    }

    fn ca_cert_der(&self) -> Vec<u8> {
        self.ca_der.clone()
    }

    fn ca_cert_pem(&self) -> Vec<u8> {
        der_to_cert_pem(&self.ca_der)
    }
}
