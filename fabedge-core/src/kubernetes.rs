//! Cluster API access for the controllers. Every helper here applies the
//! shared error policy: transient failures (throttling, apiserver hiccups,
//! connection drops) are logged at warn and retried with exponential
//! backoff before the error reaches a reconciler, so individual controllers
//! don't grow their own retry loops around plain API calls.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use k8s_openapi::serde::{de::DeserializeOwned, Serialize};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource};
use log::{info, warn};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 250;

fn kind_of<T>() -> String
where
    T: Resource,
    <T as Resource>::DynamicType: Default,
{
    T::kind(&Default::default()).into_owned()
}

/// Only errors the next attempt can plausibly heal are worth retrying;
/// everything else (bad requests, auth failures, conflicts) goes straight
/// back to the caller.
fn is_transient(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(response) => matches!(response.code, 429 | 500 | 502 | 503 | 504),
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_DELAY_MS << attempt)
}

async fn with_retries<T, F, Fut>(operation: &str, mut call: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut attempt = 0;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt + 1 < RETRY_ATTEMPTS && is_transient(&error) => {
                attempt += 1;
                let delay = backoff_delay(attempt);
                warn!("Transient API error while {operation} ({error}), retrying in {delay:?}...");
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

pub async fn try_get_resource<T>(
    client: &Client,
    resource_name: &str,
    namespace: &str,
) -> Result<Option<T>, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Serialize + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let operation = format!("getting {} '{resource_name}'", kind_of::<T>());

    with_retries(&operation, || api.get_opt(resource_name)).await
}

pub async fn list_cluster_resources<T>(
    client: &Client,
    list_params: &ListParams,
) -> Result<Vec<T>, kube::Error>
where
    T: Resource<Scope = ClusterResourceScope> + Serialize + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::all(client.clone());
    let operation = format!("listing {} objects", kind_of::<T>());

    let listed = with_retries(&operation, || api.list(list_params)).await?;

    Ok(listed.items)
}

pub async fn apply_resource<T>(
    client: &Client,
    resource: &T,
    patch_params: &PatchParams,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Serialize + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource_name = resource.meta().name.as_ref().unwrap();
    let namespace = resource.meta().namespace.as_ref().unwrap();

    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let operation = format!("applying {} '{resource_name}'", kind_of::<T>());
    let patch = Patch::Apply(resource);

    with_retries(&operation, || api.patch(resource_name, patch_params, &patch)).await?;

    Ok(())
}

pub async fn try_remove_resource<T>(
    client: &Client,
    resource_name: &str,
    namespace: &str,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Serialize + Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let operation = format!("removing {} '{resource_name}'", kind_of::<T>());
    let delete_params = DeleteParams::background();

    info!("Removing {} '{resource_name}' from the cluster...", kind_of::<T>());

    let result =
        with_retries(&operation, || api.delete(resource_name, &delete_params)).await;

    match result {
        Ok(_) => Ok(()),
        // already gone is the state we were after
        Err(kube::Error::Api(api_error)) if api_error.code == 404 => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_owned(),
            message: String::new(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn only_recoverable_statuses_are_transient() {
        for code in [429, 500, 502, 503, 504] {
            assert!(is_transient(&api_error(code)), "{code} should be retried");
        }
        for code in [400, 401, 403, 404, 409, 422] {
            assert!(!is_transient(&api_error(code)), "{code} must not be retried");
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn retries_stop_at_the_first_terminal_error() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries("testing", || {
            calls += 1;
            async move { Err(api_error(404)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        tokio::time::pause();

        let mut calls = 0;
        let result = with_retries("testing", || {
            calls += 1;
            let succeed = calls >= 2;
            async move {
                if succeed {
                    Ok(42)
                } else {
                    Err(api_error(503))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 2);
    }
}
