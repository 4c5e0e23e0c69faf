use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use thiserror::Error;

use fabedge_core::cert::{CertError, CsrSigner};
use fabedge_core::endpoint::TunnelEndpoint;
use fabedge_core::proto::{Certificate, EndpointsAndCommunities, UpdateEndpointsRequest};

#[derive(Debug, Error)]
pub enum ApiClientError {
    #[error("The host rejected our credentials!")]
    Unauthorized,
    #[error("The host answered {}!", .0)]
    UnexpectedStatus(StatusCode),
    #[error("Couldn't reach the host API! Reason: {}", .0)]
    Http(#[from] reqwest::Error),
    #[error("Couldn't set up the API client! Reason: {}", .0)]
    Setup(String),
}

fn check_status(status: StatusCode) -> Result<(), ApiClientError> {
    match status {
        status if status.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiClientError::Unauthorized),
        status => Err(ApiClientError::UnexpectedStatus(status)),
    }
}

fn base_url(api_server_address: &str) -> String {
    format!("https://{api_server_address}")
}

/// Fetches the host CA over TLS without verification. This runs exactly
/// once per member lifetime, before any trust material exists; everything
/// afterwards pins the returned CA.
pub async fn fetch_ca_cert(api_server_address: &str) -> Result<Certificate, ApiClientError> {
    let http = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;

    let response = http
        .get(format!("{}/api/ca", base_url(api_server_address)))
        .send()
        .await?;
    check_status(response.status())?;

    Ok(response.json().await?)
}

/// Enrolls with a bootstrap token: posts the CSR, gets the signed client
/// cert back. The server verifies the token signature and expiry.
pub async fn sign_cert_by_token(
    api_server_address: &str,
    token: &str,
    csr_der: Vec<u8>,
    ca_pem: &[u8],
) -> Result<Certificate, ApiClientError> {
    let ca = reqwest::Certificate::from_pem(ca_pem)
        .map_err(|error| ApiClientError::Setup(error.to_string()))?;
    let http = reqwest::Client::builder()
        .add_root_certificate(ca)
        .build()?;

    let response = http
        .post(format!("{}/api/signcert", base_url(api_server_address)))
        .header(reqwest::header::AUTHORIZATION, format!("bearer {token}"))
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(csr_der)
        .send()
        .await?;
    check_status(response.status())?;

    Ok(response.json().await?)
}

/// The member's mutually-authenticated federation API client.
pub struct ApiClient {
    base: String,
    cluster: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// `identity_pem` is the client cert followed by its private key, both
    /// PEM; `ca_pem` pins the host CA.
    pub fn new(
        api_server_address: &str,
        cluster: &str,
        ca_pem: &[u8],
        identity_pem: &[u8],
    ) -> Result<Self, ApiClientError> {
        let ca = reqwest::Certificate::from_pem(ca_pem)
            .map_err(|error| ApiClientError::Setup(error.to_string()))?;
        let identity = reqwest::Identity::from_pem(identity_pem)
            .map_err(|error| ApiClientError::Setup(error.to_string()))?;

        let http = reqwest::Client::builder()
            .add_root_certificate(ca)
            .identity(identity)
            .build()?;

        Ok(Self {
            base: base_url(api_server_address),
            cluster: cluster.to_owned(),
            http,
        })
    }

    pub async fn get_endpoints_and_communities(
        &self,
    ) -> Result<EndpointsAndCommunities, ApiClientError> {
        let response = self
            .http
            .get(format!("{}/api/endpoints-and-communities", self.base))
            .send()
            .await?;
        check_status(response.status())?;

        Ok(response.json().await?)
    }

    pub async fn update_endpoints(
        &self,
        endpoints: Vec<TunnelEndpoint>,
    ) -> Result<(), ApiClientError> {
        let response = self
            .http
            .put(format!("{}/api/endpoints", self.base))
            .json(&UpdateEndpointsRequest {
                cluster: self.cluster.clone(),
                endpoints,
            })
            .send()
            .await?;

        check_status(response.status())
    }

    /// Client-cert authenticated renewal path of `/api/signcert`.
    pub async fn sign_cert(&self, csr_der: Vec<u8>) -> Result<Certificate, ApiClientError> {
        let response = self
            .http
            .post(format!("{}/api/signcert", self.base))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(csr_der)
            .send()
            .await?;
        check_status(response.status())?;

        Ok(response.json().await?)
    }
}

/// Lets the member's RemoteCertManager sign CSRs through the current API
/// client; the client is swapped out underneath on re-enrollment.
pub struct SharedApiClient(pub std::sync::Arc<tokio::sync::RwLock<ApiClient>>);

#[async_trait]
impl CsrSigner for SharedApiClient {
    async fn sign(&self, csr_der: &[u8]) -> Result<Vec<u8>, CertError> {
        debug!("Delegating CSR signing to the host cluster...");

        let client = self.0.read().await;
        let certificate = client
            .sign_cert(csr_der.to_vec())
            .await
            .map_err(|error| CertError::RemoteSigning(error.to_string()))?;

        Ok(certificate.der)
    }
}
