use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use log::{debug, info, warn};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use x509_parser::prelude::*;

use fabedge_core::api_client_common_name;
use fabedge_core::cert::{
    cert_fingerprint, csr_common_name, der_to_cert_pem, CertManager, ExtKeyUsage,
};
use fabedge_core::endpoint::TunnelEndpoint;
use fabedge_core::proto::{Certificate, EndpointsAndCommunities, UpdateEndpointsRequest};
use fabedge_core::store::EndpointStore;
use fabedge_core::token::TokenManager;

/// A member's endpoint report, forwarded to the host routines for
/// persistence in the Cluster record.
#[derive(Debug)]
pub struct MemberReport {
    pub cluster: String,
    pub endpoints: Vec<TunnelEndpoint>,
    pub client_cert_fingerprint: Option<String>,
}

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<EndpointStore>,
    pub cert_manager: Arc<dyn CertManager>,
    pub tokens: Arc<TokenManager>,
    pub reports: mpsc::UnboundedSender<MemberReport>,
    pub local_cluster: String,
}

/// The peer's client certificate chain, captured during the TLS handshake.
/// Client certs are requested but not required; routes decide.
#[derive(Clone, Default)]
pub struct PeerCerts(pub Option<Vec<Vec<u8>>>);

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/ca", get(get_ca))
        .route("/api/signcert", post(sign_cert))
        .route(
            "/api/endpoints-and-communities",
            get(get_endpoints_and_communities),
        )
        .route("/api/endpoints", put(put_endpoints))
        .with_state(state)
}

enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            ApiError::Forbidden(message) => (StatusCode::FORBIDDEN, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        debug!("Federation API request rejected: {message}");

        (status, message).into_response()
    }
}

async fn get_ca(State(state): State<ApiState>) -> Json<Certificate> {
    Json(Certificate {
        der: state.cert_manager.ca_cert_der(),
        pem: String::from_utf8_lossy(&state.cert_manager.ca_cert_pem()).into_owned(),
    })
}

/// Signs a DER CSR. Authenticated either by a client certificate (renewal
/// path; the CSR must stay within the caller's cluster) or by a bootstrap
/// token (enrollment path; the CSR CN must be the member's API client name).
async fn sign_cert(
    State(state): State<ApiState>,
    Extension(peer): Extension<PeerCerts>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Certificate>, ApiError> {
    let csr_cn = csr_common_name(&body).map_err(|error| ApiError::BadRequest(error.to_string()))?;

    if let Some(common_name) = verified_client_cn(&state, &peer)? {
        let cluster = cluster_of(&common_name)?;
        if !csr_cn.starts_with(&format!("{cluster}.")) {
            return Err(ApiError::Forbidden(format!(
                "a client of cluster '{cluster}' may not request a cert for '{csr_cn}'"
            )));
        }
    } else {
        let token = bearer_token(&headers)
            .ok_or_else(|| ApiError::Unauthorized("a client cert or token is required".into()))?;
        let claims = state
            .tokens
            .verify(token)
            .map_err(|error| ApiError::Unauthorized(error.to_string()))?;

        let expected = api_client_common_name(&claims.cluster);
        if csr_cn != expected {
            return Err(ApiError::Forbidden(format!(
                "the CSR common name must be '{expected}'"
            )));
        }
    }

    let cert_der = state
        .cert_manager
        .sign_cert(&body)
        .await
        .map_err(|error| ApiError::BadRequest(error.to_string()))?;

    info!("Issued a certificate for '{csr_cn}'.");

    Ok(Json(Certificate {
        pem: String::from_utf8_lossy(&der_to_cert_pem(&cert_der)).into_owned(),
        der: cert_der,
    }))
}

async fn get_endpoints_and_communities(
    State(state): State<ApiState>,
    Extension(peer): Extension<PeerCerts>,
) -> Result<Json<EndpointsAndCommunities>, ApiError> {
    require_client(&state, &peer)?;

    let (endpoints, communities) = state.store.snapshot_all();

    Ok(Json(EndpointsAndCommunities {
        endpoints,
        communities,
    }))
}

/// Replaces the calling cluster's endpoint set. The cert's CN must name the
/// cluster the request mutates.
async fn put_endpoints(
    State(state): State<ApiState>,
    Extension(peer): Extension<PeerCerts>,
    Json(request): Json<UpdateEndpointsRequest>,
) -> Result<StatusCode, ApiError> {
    let common_name = require_client(&state, &peer)?;
    let cluster = cluster_of(&common_name)?;

    if request.cluster != cluster {
        return Err(ApiError::Forbidden(format!(
            "a client of cluster '{cluster}' may not update cluster '{}'",
            request.cluster
        )));
    }
    if request.cluster == state.local_cluster {
        return Err(ApiError::Forbidden(
            "the host cluster's endpoints are not updatable through the API".into(),
        ));
    }

    let mut accepted = Vec::new();
    for endpoint in request.endpoints {
        if endpoint.cluster_prefix() != Some(cluster.as_str()) {
            warn!(
                "Skipping endpoint '{}' reported by cluster '{cluster}'!",
                endpoint.name
            );
            continue;
        }
        if !endpoint.is_valid() {
            warn!("Skipping invalid endpoint '{}'!", endpoint.name);
            continue;
        }

        state.store.save_endpoint(endpoint.clone());
        accepted.push(endpoint);
    }

    let fingerprint = peer
        .0
        .as_ref()
        .and_then(|chain| chain.first())
        .map(|der| cert_fingerprint(der));

    state
        .reports
        .send(MemberReport {
            cluster,
            endpoints: accepted,
            client_cert_fingerprint: fingerprint,
        })
        .map_err(|_| ApiError::Internal("the host routines are gone".into()))?;

    Ok(StatusCode::NO_CONTENT)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("bearer ")
}

/// The CN of a presented client certificate, after verifying it against the
/// CA with client-auth usage. `None` when no certificate was presented.
fn verified_client_cn(state: &ApiState, peer: &PeerCerts) -> Result<Option<String>, ApiError> {
    let Some(der) = peer.0.as_ref().and_then(|chain| chain.first()) else {
        return Ok(None);
    };

    state
        .cert_manager
        .verify_cert(&der_to_cert_pem(der), &[ExtKeyUsage::ClientAuth])
        .map_err(|error| ApiError::Unauthorized(error.to_string()))?;

    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|error| ApiError::Unauthorized(format!("bad client certificate: {error}")))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("the client certificate has no CN".into()))?;

    Ok(Some(common_name.to_owned()))
}

fn require_client(state: &ApiState, peer: &PeerCerts) -> Result<String, ApiError> {
    verified_client_cn(state, peer)?
        .ok_or_else(|| ApiError::Unauthorized("a client certificate is required".into()))
}

fn cluster_of(common_name: &str) -> Result<String, ApiError> {
    common_name
        .split_once('.')
        .map(|(cluster, _)| cluster.to_owned())
        .ok_or_else(|| {
            ApiError::Forbidden(format!(
                "the client CN '{common_name}' doesn't name a cluster"
            ))
        })
}

pub struct ApiServerConfig {
    pub listen: SocketAddr,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Serves the federation API over TLS. Client certificates are requested
/// and, when presented, must chain to the CA; requests without one only ever
/// reach `/api/ca` and the token path of `/api/signcert`.
pub async fn serve(
    config: ApiServerConfig,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ca_der = state.cert_manager.ca_cert_der();

    let mut roots = RootCertStore::empty();
    roots.add(rustls::pki_types::CertificateDer::from(ca_der))?;
    let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .allow_unauthenticated()
        .build()?;

    let cert_der = fabedge_core::cert::pem_to_der(config.cert_pem.as_bytes())
        .map_err(|error| anyhow::anyhow!("bad server cert: {error}"))?;
    let key_der = fabedge_core::cert::pem_to_der(config.key_pem.as_bytes())
        .map_err(|error| anyhow::anyhow!("bad server key: {error}"))?;

    let tls_config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(
            vec![rustls::pki_types::CertificateDer::from(cert_der)],
            rustls::pki_types::PrivateKeyDer::Pkcs8(key_der.into()),
        )?;

    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(config.listen).await?;
    let app = router(state);

    info!("Federation API server listening on {}.", config.listen);

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted?,
        };

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(error) => {
                    debug!("TLS handshake with {peer_addr} failed: {error}");
                    return;
                }
            };

            let peer_certs = PeerCerts(
                tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .map(|chain| chain.iter().map(|der| der.to_vec()).collect()),
            );

            let service = TowerToHyperService::new(app.layer(Extension(peer_certs)));
            if let Err(error) = ConnectionBuilder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                debug!("Connection from {peer_addr} ended with an error: {error}");
            }
        });
    }

    info!("Federation API server is shutting down.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use fabedge_core::cert::{new_cert_request, LocalCertManager};
    use fabedge_core::community::Community;
    use fabedge_core::endpoint::EndpointType;

    use super::*;

    struct Harness {
        state: ApiState,
        reports: mpsc::UnboundedReceiver<MemberReport>,
    }

    fn harness() -> Harness {
        let (cert_pem, key_pem) = LocalCertManager::generate_ca("fabedge.io", 3650).unwrap();
        let manager = LocalCertManager::new(cert_pem, key_pem, 365).unwrap();
        let tokens = TokenManager::from_pkcs8(&manager.ca_key_pkcs8().unwrap()).unwrap();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        Harness {
            state: ApiState {
                store: Arc::new(EndpointStore::new()),
                cert_manager: Arc::new(manager),
                tokens: Arc::new(tokens),
                reports: reports_tx,
                local_cluster: "bj".to_owned(),
            },
            reports: reports_rx,
        }
    }

    fn endpoint(name: &str) -> TunnelEndpoint {
        TunnelEndpoint {
            name: name.to_owned(),
            id: format!("C=CN, O=fabedge.io, CN={name}"),
            endpoint_type: EndpointType::Connector,
            public_addresses: vec!["203.0.113.9".into()],
            subnets: vec!["10.234.0.0/16".parse().unwrap()],
            node_subnets: vec!["192.0.2.0/24".parse().unwrap()],
        }
    }

    async fn client_cert_der(state: &ApiState, common_name: &str) -> Vec<u8> {
        let request = new_cert_request(common_name, "fabedge.io").unwrap();

        state.cert_manager.sign_cert(&request.csr_der).await.unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();

        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn anonymous_peers_get_the_ca_but_nothing_else() {
        let harness = harness();
        let app = router(harness.state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/ca")
                    .extension(PeerCerts::default())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ca: Certificate = body_json(response).await;
        assert_eq!(ca.der, harness.state.cert_manager.ca_cert_der());

        let response = app
            .oneshot(
                Request::get("/api/endpoints-and-communities")
                    .extension(PeerCerts::default())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn token_enrollment_signs_the_client_csr() {
        let harness = harness();
        let app = router(harness.state.clone());
        let token = harness
            .state
            .tokens
            .generate("sh", Duration::from_secs(3600))
            .unwrap();

        let csr = new_cert_request("sh.fabedge-client", "fabedge.io").unwrap();
        let response = app
            .oneshot(
                Request::post("/api/signcert")
                    .header(header::AUTHORIZATION, format!("bearer {token}"))
                    .extension(PeerCerts::default())
                    .body(Body::from(csr.csr_der.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cert: Certificate = body_json(response).await;
        harness
            .state
            .cert_manager
            .verify_cert(cert.pem.as_bytes(), &[ExtKeyUsage::ClientAuth])
            .unwrap();
    }

    #[tokio::test]
    async fn tampered_tokens_are_unauthorized() {
        let harness = harness();
        let token = harness
            .state
            .tokens
            .generate("sh", Duration::from_secs(3600))
            .unwrap();

        let mut tampered = token.into_bytes();
        tampered[5] = if tampered[5] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();

        let csr = new_cert_request("sh.fabedge-client", "fabedge.io").unwrap();
        let response = router(harness.state.clone())
            .oneshot(
                Request::post("/api/signcert")
                    .header(header::AUTHORIZATION, format!("bearer {tampered}"))
                    .extension(PeerCerts::default())
                    .body(Body::from(csr.csr_der))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn token_enrollment_rejects_foreign_common_names() {
        let harness = harness();
        let token = harness
            .state
            .tokens
            .generate("sh", Duration::from_secs(3600))
            .unwrap();

        // CSR pretending to be another cluster's client
        let csr = new_cert_request("xx.fabedge-client", "fabedge.io").unwrap();
        let response = router(harness.state.clone())
            .oneshot(
                Request::post("/api/signcert")
                    .header(header::AUTHORIZATION, format!("bearer {token}"))
                    .extension(PeerCerts::default())
                    .body(Body::from(csr.csr_der))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn put_and_get_roundtrip_for_member_endpoints() {
        let mut harness = harness();
        let cert = client_cert_der(&harness.state, "sh.fabedge-client").await;
        let peer = PeerCerts(Some(vec![cert]));

        let request = UpdateEndpointsRequest {
            cluster: "sh".to_owned(),
            endpoints: vec![endpoint("sh.connector"), endpoint("bj.fake")],
        };
        let response = router(harness.state.clone())
            .oneshot(
                Request::put("/api/endpoints")
                    .header(header::CONTENT_TYPE, "application/json")
                    .extension(peer.clone())
                    .body(Body::from(serde_json::to_vec(&request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // the out-of-cluster endpoint was dropped
        let report = harness.reports.recv().await.unwrap();
        assert_eq!(report.cluster, "sh");
        assert_eq!(report.endpoints.len(), 1);
        assert!(report.client_cert_fingerprint.is_some());

        harness.state.store.save_community(Community::new(
            "cross",
            ["sh.connector", "bj.connector"],
        ));

        let response = router(harness.state.clone())
            .oneshot(
                Request::get("/api/endpoints-and-communities")
                    .extension(peer)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let answer: EndpointsAndCommunities = body_json(response).await;
        assert_eq!(answer.endpoints.len(), 1);
        assert_eq!(answer.endpoints[0].name, "sh.connector");
        assert_eq!(answer.communities.len(), 1);
    }

    #[tokio::test]
    async fn a_member_may_not_update_another_cluster() {
        let harness = harness();
        let cert = client_cert_der(&harness.state, "sh.fabedge-client").await;

        let request = UpdateEndpointsRequest {
            cluster: "xx".to_owned(),
            endpoints: vec![endpoint("xx.connector")],
        };
        let response = router(harness.state.clone())
            .oneshot(
                Request::put("/api/endpoints")
                    .header(header::CONTENT_TYPE, "application/json")
                    .extension(PeerCerts(Some(vec![cert])))
                    .body(Body::from(serde_json::to_vec(&request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn certs_from_an_unknown_ca_are_unauthorized() {
        let harness = harness();

        // a cert chained to a different CA
        let (other_cert, other_key) = LocalCertManager::generate_ca("fabedge.io", 3650).unwrap();
        let other = LocalCertManager::new(other_cert, other_key, 365).unwrap();
        let csr = new_cert_request("sh.fabedge-client", "fabedge.io").unwrap();
        let foreign = other.sign_cert(&csr.csr_der).await.unwrap();

        let response = router(harness.state.clone())
            .oneshot(
                Request::get("/api/endpoints-and-communities")
                    .extension(PeerCerts(Some(vec![foreign])))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
