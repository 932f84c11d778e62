use super::{not_leader, on_error, requeue, ClusterContext};
use crate::{
    core::{autoimport::AUTO_IMPORT_SECRET, state::Reconciliation, Error},
    k8s::{labels, Api, Client, ManagedCluster, ResourceExt, Secret},
};
use chrono::Utc;
use futures::prelude::*;
use kube::runtime::{
    controller::{self, Action, Controller},
    reflector::ObjectRef,
    watcher,
};
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

const CONTROLLER: &str = "cluster";

pub async fn run(client: Client, ctx: Arc<ClusterContext>, concurrency: u16) {
    let clusters = Api::<ManagedCluster>::all(client.clone());
    let secrets = Api::<Secret>::all(client);
    let auto_import = format!("metadata.name={AUTO_IMPORT_SECRET}");

    Controller::new(clusters, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        // Import secrets carry the cluster label; auto-import secrets only
        // share the cluster's namespace.
        .watches(
            secrets.clone(),
            watcher::Config::default().labels(labels::CLUSTER_NAME),
            cluster_of,
        )
        .watches(
            secrets,
            watcher::Config::default().fields(&auto_import),
            cluster_of,
        )
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            match res {
                Ok((obj, _)) => debug!(cluster = %obj.name, "Reconciled"),
                Err(error) => debug!(%error, "Reconcile failed"),
            }
            future::ready(())
        })
        .await
}

async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<ClusterContext>) -> Result<Action, Error> {
    if !ctx.leader.is_current() {
        return Ok(not_leader());
    }
    let name = cluster.name_any();
    let out = ctx
        .inner
        .reconcile(&cluster, Utc::now())
        .instrument(info_span!("cluster", %name))
        .await?;
    record(&ctx, &out);
    debug!(cluster = %name, phase = out.phase.as_str(), "Cluster reconciled");
    Ok(requeue(out.requeue_after))
}

fn record(ctx: &ClusterContext, out: &Reconciliation) {
    ctx.metrics.reconciled(CONTROLLER, out.phase.as_str());
    for work in &out.works {
        ctx.metrics.work(work.as_str());
    }
    if let Some(result) = out.import {
        ctx.metrics.import(result);
    }
}

fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<ClusterContext>) -> Action {
    warn!(cluster = %cluster.name_any(), %error, "Failed to reconcile cluster");
    ctx.metrics.reconciled(CONTROLLER, "error");
    on_error(error)
}

fn cluster_of(secret: Secret) -> Option<ObjectRef<ManagedCluster>> {
    secret.namespace().map(|ns| ObjectRef::new(&ns))
}
