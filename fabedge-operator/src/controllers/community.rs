use std::pin::pin;
use std::sync::Arc;

use futures::TryStreamExt;
use kube::api::Api;
use kube::runtime::watcher::{watcher, Config, Event};
use kube::runtime::WatchStreamExt;
use kube::ResourceExt;
use log::{info, warn};

use fabedge_core::crds::Community;

use super::context::OperatorContext;

/// Mirrors Community objects into the store, verbatim. No ordering with
/// endpoint events is assumed; peer sets are resolved lazily against the
/// store whenever they are materialized.
pub async fn start_community_controller(context: Arc<OperatorContext>) -> anyhow::Result<()> {
    info!("Starting the community controller...");

    let api: Api<Community> = Api::all(context.client.clone());
    let mut stream = pin!(watcher(api, Config::default()).default_backoff());

    while let Some(event) = stream.try_next().await.transpose() {
        match event {
            Ok(Event::Apply(community) | Event::InitApply(community)) => {
                match community.to_record() {
                    Some(record) => {
                        info!(
                            "Community '{}' now has {} members.",
                            record.name,
                            record.members.len()
                        );
                        context.store.save_community(record);
                    }
                    // a community without a name can't be mirrored; ignore it
                    None => warn!("Ignoring a malformed community object!"),
                }
            }
            Ok(Event::Delete(community)) => {
                let name = community.name_any();
                info!("Community '{name}' was deleted.");
                context.store.delete_community(&name);
            }
            Ok(_) => {}
            Err(error) => warn!("Community watcher hiccuped! {error}"),
        }
    }

    info!("Exiting the community controller...");

    Ok(())
}
