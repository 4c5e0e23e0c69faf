use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, RwLock};

use fabedge_core::api_client_common_name;
use fabedge_core::cert::{needs_renewal, new_cert_request, verify_cert_against, ExtKeyUsage};
use fabedge_core::crds::{Cluster, ClusterSpec};
use fabedge_core::endpoint::EndpointNamer;
use fabedge_core::kubernetes::{apply_resource, try_get_resource};
use fabedge_core::proto::Certificate;
use fabedge_core::resources::labels::get_operator_labels;
use fabedge_core::resources::secret::{
    build_tls_secret, secret_data, API_CLIENT_TLS_SECRET_NAME, TLS_CERT_KEY, TLS_KEY_KEY,
};
use fabedge_core::store::EndpointStore;
use fabedge_core::token::{token_expiry, TokenManager};

use crate::controllers::OPERATOR_FIELD_MANAGER;

use super::client::{fetch_ca_cert, sign_cert_by_token, ApiClient, ApiClientError};
use super::server::MemberReport;

#[derive(Clone)]
pub struct MemberConfig {
    pub cluster: String,
    pub namespace: String,
    pub api_server_address: String,
    pub init_token: Option<String>,
    pub cert_organization: String,
    pub sync_interval: Duration,
}

/// Builds a working API client for the member role. When the client TLS
/// secret is missing or stale, enrolls with the bootstrap token first and
/// persists the resulting credentials.
pub async fn ensure_api_client(
    client: &Client,
    config: &MemberConfig,
) -> anyhow::Result<(ApiClient, Certificate)> {
    let ca = fetch_ca_cert(&config.api_server_address)
        .await
        .context("couldn't fetch the CA cert from the host cluster")?;

    if let Some(secret) =
        try_get_resource::<Secret>(client, API_CLIENT_TLS_SECRET_NAME, &config.namespace).await?
    {
        if let (Ok(cert_pem), Ok(key_pem)) = (
            secret_data(&secret, TLS_CERT_KEY),
            secret_data(&secret, TLS_KEY_KEY),
        ) {
            let usable = verify_cert_against(&ca.der, cert_pem, &[ExtKeyUsage::ClientAuth]).is_ok()
                && !needs_renewal(cert_pem);

            if usable {
                let identity = [cert_pem, key_pem].concat();
                let api_client = ApiClient::new(
                    &config.api_server_address,
                    &config.cluster,
                    ca.pem.as_bytes(),
                    &identity,
                )?;

                return Ok((api_client, ca));
            }
        }

        info!("The stored API client credentials are stale, re-enrolling...");
    }

    enroll(client, config, ca).await
}

/// Token enrollment: generate a key pair locally, have the host sign the
/// CSR, persist everything as the client TLS secret.
async fn enroll(
    client: &Client,
    config: &MemberConfig,
    ca: Certificate,
) -> anyhow::Result<(ApiClient, Certificate)> {
    let token = config
        .init_token
        .as_deref()
        .ok_or_else(|| anyhow!("an init token is required to enroll with the host cluster"))?;

    let request = new_cert_request(
        &api_client_common_name(&config.cluster),
        &config.cert_organization,
    )?;
    let issued = sign_cert_by_token(
        &config.api_server_address,
        token,
        request.csr_der,
        ca.pem.as_bytes(),
    )
    .await
    .context("token enrollment failed")?;

    let secret = build_tls_secret(
        API_CLIENT_TLS_SECRET_NAME,
        &config.namespace,
        get_operator_labels(),
        ca.pem.as_bytes(),
        issued.pem.as_bytes(),
        request.key_pem.as_bytes(),
    );
    apply_resource(client, &secret, &PatchParams::apply(OPERATOR_FIELD_MANAGER)).await?;

    info!("Enrolled with the host cluster as '{}'.", config.cluster);

    let identity = [issued.pem.as_bytes(), request.key_pem.as_bytes()].concat();
    let api_client = ApiClient::new(
        &config.api_server_address,
        &config.cluster,
        ca.pem.as_bytes(),
        &identity,
    )?;

    Ok((api_client, ca))
}

/// The member's periodic federation sync: pull the host's endpoint and
/// community snapshot, push the local connector endpoint. A 401 means the
/// client cert died underneath us; re-enrollment with the init token brings
/// the member back (certs are also renewed through this path).
pub async fn start_member_sync(
    client: Client,
    config: MemberConfig,
    store: Arc<EndpointStore>,
    namer: EndpointNamer,
    api_client: Arc<RwLock<ApiClient>>,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(config.sync_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let result = sync_once(&config, &store, &namer, &api_client).await;
        match result {
            Ok(()) => debug!("Federation sync finished."),
            Err(ApiClientError::Unauthorized) => {
                warn!("The host rejected our credentials, trying to re-enroll...");

                match ensure_api_client(&client, &config).await {
                    Ok((fresh, _)) => *api_client.write().await = fresh,
                    Err(error) => warn!("Re-enrollment failed! {error}"),
                }
            }
            Err(error) => warn!("Federation sync failed! {error}"),
        }
    }
}

async fn sync_once(
    config: &MemberConfig,
    store: &EndpointStore,
    namer: &EndpointNamer,
    api_client: &RwLock<ApiClient>,
) -> Result<(), ApiClientError> {
    let api_client = api_client.read().await;

    let answer = api_client.get_endpoints_and_communities().await?;
    store.replace_foreign(&config.cluster, answer.endpoints, answer.communities);

    if let Some(connector) = store.get_endpoint(&namer.connector_name()) {
        api_client.update_endpoints(vec![connector]).await?;
    } else {
        debug!("No local connector endpoint yet, skipping the push.");
    }

    Ok(())
}

#[derive(Clone)]
pub struct HostConfig {
    pub cluster: String,
    pub token_valid_period: Duration,
    pub expire_after: Duration,
    pub sync_interval: Duration,
}

/// Host-side federation housekeeping, all on one loop:
/// - persists member reports into their Cluster records,
/// - reports the local cluster's connector endpoint,
/// - keeps member enrollment tokens fresh,
/// - prunes endpoints of members whose heartbeat went stale.
pub async fn start_host_routines(
    client: Client,
    config: HostConfig,
    store: Arc<EndpointStore>,
    namer: EndpointNamer,
    tokens: Arc<TokenManager>,
    mut reports: mpsc::UnboundedReceiver<MemberReport>,
) -> anyhow::Result<()> {
    let api: Api<Cluster> = Api::all(client.clone());
    let mut interval = tokio::time::interval(config.sync_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            report = reports.recv() => match report {
                Some(report) => {
                    if let Err(error) = persist_member_report(&api, &report).await {
                        warn!("Couldn't persist the report of cluster '{}'! {error}", report.cluster);
                    }
                }
                None => break,
            },
            _ = interval.tick() => {
                if let Err(error) = report_local_cluster(&api, &config, &store, &namer).await {
                    warn!("Couldn't report the local cluster! {error}");
                }
                if let Err(error) = maintain_member_clusters(&api, &config, &store, &tokens).await {
                    warn!("Member cluster maintenance failed! {error}");
                }
            }
        }
    }

    Ok(())
}

async fn ensure_cluster_record(api: &Api<Cluster>, name: &str) -> Result<Cluster, kube::Error> {
    match api.get_opt(name).await? {
        Some(cluster) => Ok(cluster),
        None => {
            info!("Creating the cluster record for '{name}'...");

            api.create(
                &PostParams::default(),
                &Cluster::new(name, ClusterSpec::default()),
            )
            .await
        }
    }
}

async fn persist_member_report(api: &Api<Cluster>, report: &MemberReport) -> Result<(), kube::Error> {
    ensure_cluster_record(api, &report.cluster).await?;

    let spec_patch = serde_json::json!({
        "spec": { "endpoints": report.endpoints }
    });
    api.patch(
        &report.cluster,
        &PatchParams::default(),
        &Patch::Merge(&spec_patch),
    )
    .await?;

    let status_patch = serde_json::json!({
        "status": {
            "lastHeartbeat": Utc::now().to_rfc3339(),
            "clientCertFingerprint": report.client_cert_fingerprint,
        }
    });
    api.patch_status(
        &report.cluster,
        &PatchParams::default(),
        &Patch::Merge(&status_patch),
    )
    .await?;

    Ok(())
}

async fn report_local_cluster(
    api: &Api<Cluster>,
    config: &HostConfig,
    store: &EndpointStore,
    namer: &EndpointNamer,
) -> Result<(), kube::Error> {
    let Some(connector) = store.get_endpoint(&namer.connector_name()) else {
        return Ok(());
    };

    ensure_cluster_record(api, &config.cluster).await?;

    let patch = serde_json::json!({
        "spec": { "endpoints": [connector] }
    });
    api.patch(&config.cluster, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    let status_patch = serde_json::json!({
        "status": { "lastHeartbeat": Utc::now().to_rfc3339() }
    });
    api.patch_status(
        &config.cluster,
        &PatchParams::default(),
        &Patch::Merge(&status_patch),
    )
    .await?;

    Ok(())
}

async fn maintain_member_clusters(
    api: &Api<Cluster>,
    config: &HostConfig,
    store: &EndpointStore,
    tokens: &TokenManager,
) -> Result<(), kube::Error> {
    let clusters = api.list(&ListParams::default()).await?;

    for cluster in clusters {
        let name = cluster.name_any();
        if name == config.cluster {
            continue;
        }

        refresh_token(api, &name, &cluster, config, tokens).await?;

        if let Some(heartbeat) = stale_heartbeat(&cluster, config.expire_after) {
            debug!(
                "Cluster '{name}' hasn't reported since {heartbeat}, \
                    dropping its endpoints."
            );
            store.remove_cluster(&name);
        }
    }

    Ok(())
}

/// Keeps a valid enrollment token in each member's record so an operator
/// can hand it out without asking the host to mint one.
async fn refresh_token(
    api: &Api<Cluster>,
    name: &str,
    cluster: &Cluster,
    config: &HostConfig,
    tokens: &TokenManager,
) -> Result<(), kube::Error> {
    let half_period = config.token_valid_period.as_secs() as i64 / 2;
    let fresh_enough = cluster
        .spec
        .token
        .as_deref()
        .and_then(token_expiry)
        .map(|exp| exp > Utc::now().timestamp() + half_period)
        .unwrap_or(false);

    if fresh_enough {
        return Ok(());
    }

    let token = match tokens.generate(name, config.token_valid_period) {
        Ok(token) => token,
        Err(error) => {
            warn!("Couldn't generate a token for cluster '{name}'! {error}");
            return Ok(());
        }
    };

    let patch = serde_json::json!({ "spec": { "token": token } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    debug!("Refreshed the enrollment token of cluster '{name}'.");

    Ok(())
}

fn stale_heartbeat(cluster: &Cluster, expire_after: Duration) -> Option<String> {
    let heartbeat = cluster.status.as_ref()?.last_heartbeat.clone()?;
    let parsed = chrono::DateTime::parse_from_rfc3339(&heartbeat).ok()?;

    let expire_after = chrono::TimeDelta::from_std(expire_after).unwrap_or(chrono::TimeDelta::MAX);
    (Utc::now().signed_duration_since(parsed) > expire_after).then_some(heartbeat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_heartbeat(heartbeat: Option<String>) -> Cluster {
        let mut cluster = Cluster::new("sh", ClusterSpec::default());
        cluster.status = heartbeat.map(|last_heartbeat| fabedge_core::crds::ClusterStatus {
            last_heartbeat: Some(last_heartbeat),
            client_cert_fingerprint: None,
        });

        cluster
    }

    #[test]
    fn recent_heartbeats_are_not_stale() {
        let cluster = cluster_with_heartbeat(Some(Utc::now().to_rfc3339()));

        assert!(stale_heartbeat(&cluster, Duration::from_secs(300)).is_none());
    }

    #[test]
    fn old_heartbeats_are_stale() {
        let old = (Utc::now() - chrono::TimeDelta::seconds(600)).to_rfc3339();
        let cluster = cluster_with_heartbeat(Some(old));

        assert!(stale_heartbeat(&cluster, Duration::from_secs(300)).is_some());
    }

    #[test]
    fn missing_heartbeats_are_tolerated() {
        // a cluster that enrolled but never reported is left alone
        assert!(stale_heartbeat(&cluster_with_heartbeat(None), Duration::from_secs(300)).is_none());
    }
}
