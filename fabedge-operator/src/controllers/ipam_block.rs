use std::pin::pin;
use std::sync::Arc;

use futures::TryStreamExt;
use kube::api::Api;
use kube::runtime::watcher::{watcher, Config, Event};
use kube::runtime::WatchStreamExt;
use log::{info, warn};

use fabedge_core::crds::IPAMBlock;

use super::context::OperatorContext;

/// Mirrors Calico's IPAMBlock allocations into the PodCIDRStore so the
/// connector endpoint can advertise the pod CIDRs of cloud nodes.
pub async fn start_ipam_block_monitor(context: Arc<OperatorContext>) -> anyhow::Result<()> {
    info!("Starting the IPAMBlock monitor...");

    let api: Api<IPAMBlock> = Api::all(context.client.clone());
    let mut stream = pin!(watcher(api, Config::default()).default_backoff());

    while let Some(event) = stream.try_next().await.transpose() {
        match event {
            Ok(Event::Apply(block) | Event::InitApply(block)) => {
                record_block(&context, &block);
            }
            Ok(Event::Delete(block)) => {
                context.pod_cidrs.remove_block(&block.spec.cidr);
            }
            Ok(_) => {}
            Err(error) => warn!("IPAMBlock watcher hiccuped! {error}"),
        }
    }

    info!("Exiting the IPAMBlock monitor...");

    Ok(())
}

fn record_block(context: &OperatorContext, block: &IPAMBlock) {
    if block.spec.deleted {
        context.pod_cidrs.remove_block(&block.spec.cidr);
        return;
    }

    match block.node_name() {
        Some(node_name) => context.pod_cidrs.append(node_name, &block.spec.cidr),
        // blocks without a host affinity aren't attributable to a node
        None => context.pod_cidrs.remove_block(&block.spec.cidr),
    }
}

/// One-shot variant of the mirror, run before the controllers start.
pub async fn record_existing(context: &OperatorContext) -> Result<(), kube::Error> {
    let blocks: Vec<IPAMBlock> = fabedge_core::kubernetes::list_cluster_resources(
        &context.client,
        &kube::api::ListParams::default(),
    )
    .await?;

    for block in &blocks {
        record_block(context, block);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use fabedge_core::crds::IPAMBlockSpec;

    use super::*;

    #[test]
    fn blocks_map_to_their_affine_node() {
        let block = IPAMBlock::new(
            "b1",
            IPAMBlockSpec {
                cidr: "10.244.0.0/26".into(),
                affinity: Some("host:worker-1".into()),
                deleted: false,
            },
        );

        assert_eq!(block.node_name(), Some("worker-1"));
    }
}
