use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::Client;
use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const FIELD_MANAGER: &str = "fabedge-operator";

/// Lease-based leader election. `acquire` blocks until this instance holds
/// the lease, then keeps renewing it in the background; when renewal fails
/// past the renew deadline the `lost` channel flips and the process is
/// expected to exit.
pub struct LeaderElection {
    pub client: Client,
    pub namespace: String,
    pub lease_name: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

pub struct LeaderHandle {
    pub lost: watch::Receiver<bool>,
    _renewal: JoinHandle<()>,
}

impl LeaderElection {
    pub async fn acquire(self) -> Result<LeaderHandle, kube::Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        info!(
            "Trying to acquire leader lease '{}' as '{}'...",
            self.lease_name, self.identity
        );

        loop {
            match api.get_opt(&self.lease_name).await? {
                Some(lease)
                    if !holds_or_may_take(&lease, &self.identity, self.lease_duration, Utc::now()) =>
                {
                    tokio::time::sleep(self.retry_period).await;
                }
                _ => match self.try_claim(&api).await {
                    Ok(()) => break,
                    Err(error) => {
                        warn!("Couldn't claim the leader lease! {error}");
                        tokio::time::sleep(self.retry_period).await;
                    }
                },
            }
        }

        info!("Acquired leader lease '{}'!", self.lease_name);

        let (lost_tx, lost_rx) = watch::channel(false);
        let renewal = tokio::spawn(self.renew_loop(api, lost_tx));

        Ok(LeaderHandle {
            lost: lost_rx,
            _renewal: renewal,
        })
    }

    async fn try_claim(&self, api: &Api<Lease>) -> Result<(), kube::Error> {
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                ..Default::default()
            }),
        };

        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&lease),
        )
        .await?;

        Ok(())
    }

    async fn renew_loop(self, api: Api<Lease>, lost: watch::Sender<bool>) {
        let mut last_renewal = Utc::now();

        loop {
            tokio::time::sleep(self.retry_period).await;

            match self.try_claim(&api).await {
                Ok(()) => last_renewal = Utc::now(),
                Err(error) => {
                    warn!("Couldn't renew the leader lease! {error}");

                    let deadline = TimeDelta::from_std(self.renew_deadline)
                        .unwrap_or(TimeDelta::MAX);
                    if Utc::now() - last_renewal > deadline {
                        warn!("Leadership lost!");
                        let _ = lost.send(true);
                        return;
                    }
                }
            }
        }
    }
}

/// Whether `identity` already holds the lease, or the lease has expired and
/// may be taken over.
fn holds_or_may_take(
    lease: &Lease,
    identity: &str,
    lease_duration: Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };

    if spec.holder_identity.as_deref() == Some(identity) {
        return true;
    }

    match &spec.renew_time {
        Some(renewed) => {
            let lease_duration = TimeDelta::from_std(lease_duration).unwrap_or(TimeDelta::MAX);
            now - renewed.0 > lease_duration
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn lease(holder: &str, renewed_secs_ago: i64) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_owned()),
                lease_duration_seconds: Some(15),
                renew_time: Some(MicroTime(Utc::now() - TimeDelta::seconds(renewed_secs_ago))),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn fresh_foreign_lease_cannot_be_taken() {
        let lease = lease("other", 2);

        assert!(!holds_or_may_take(
            &lease,
            "me",
            Duration::from_secs(15),
            Utc::now()
        ));
    }

    #[test]
    fn expired_or_own_lease_can_be_claimed() {
        assert!(holds_or_may_take(
            &lease("other", 60),
            "me",
            Duration::from_secs(15),
            Utc::now()
        ));
        assert!(holds_or_may_take(
            &lease("me", 2),
            "me",
            Duration::from_secs(15),
            Utc::now()
        ));
        assert!(holds_or_may_take(
            &Lease::default(),
            "me",
            Duration::from_secs(15),
            Utc::now()
        ));
    }
}
