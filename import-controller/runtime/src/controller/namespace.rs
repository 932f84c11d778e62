use super::{not_leader, on_error, requeue, NamespaceContext};
use crate::{
    core::{
        reaper::{Dependent, Verdict},
        Error,
    },
    k8s::{Api, Client, ManagedCluster, ManagedClusterAddOn, Namespace, ResourceExt},
};
use futures::prelude::*;
use kube::runtime::{
    controller::{self, Action, Controller},
    reflector::ObjectRef,
    watcher,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info_span, warn, Instrument};

const CONTROLLER: &str = "namespace";

/// Provisioning records are not watched, so namespaces waiting on them are
/// polled.
const PROVISIONING_RECHECK: Duration = Duration::from_secs(30);

pub async fn run(client: Client, ctx: Arc<NamespaceContext>, concurrency: u16) {
    let namespaces = Api::<Namespace>::all(client.clone());
    let clusters = Api::<ManagedCluster>::all(client.clone());
    let addons = Api::<ManagedClusterAddOn>::all(client);

    Controller::new(namespaces, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .watches(clusters, watcher::Config::default(), |c: ManagedCluster| {
            Some(ObjectRef::<Namespace>::new(&c.name_any()))
        })
        .watches(addons, watcher::Config::default(), |a: ManagedClusterAddOn| {
            a.namespace().map(|ns| ObjectRef::<Namespace>::new(&ns))
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            match res {
                Ok((obj, _)) => debug!(namespace = %obj.name, "Reconciled"),
                Err(error) => debug!(%error, "Reconcile failed"),
            }
            future::ready(())
        })
        .await
}

async fn reconcile(ns: Arc<Namespace>, ctx: Arc<NamespaceContext>) -> Result<Action, Error> {
    if !ctx.leader.is_current() {
        return Ok(not_leader());
    }
    let name = ns.name_any();
    let verdict = ctx
        .inner
        .reconcile(&ns)
        .instrument(info_span!("namespace", %name))
        .await?;
    if verdict == Verdict::Delete {
        ctx.metrics.namespace_deleted();
    }
    if verdict != Verdict::Ignore {
        ctx.metrics.reconciled(CONTROLLER, "ok");
    }
    Ok(requeue(recheck_after(&verdict)))
}

fn recheck_after(verdict: &Verdict) -> Option<Duration> {
    match verdict {
        Verdict::WaitFor(Dependent::ClusterDeployment | Dependent::InfraEnv, _) => {
            Some(PROVISIONING_RECHECK)
        }
        v => v.requeue_after(),
    }
}

fn error_policy(ns: Arc<Namespace>, error: &Error, ctx: Arc<NamespaceContext>) -> Action {
    warn!(namespace = %ns.name_any(), %error, "Failed to reconcile namespace");
    ctx.metrics.reconciled(CONTROLLER, "error");
    on_error(error)
}
