//! Decides when a cluster namespace can be deleted after its cluster is gone.

use crate::{
    k8s::{labels, ManagedCluster, Namespace, Pod, ResourceExt},
    Result,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to wait before rechecking pods that block deletion.
pub const POD_DELETION_GRACE_PERIOD: Duration = Duration::from_secs(10);

const HOOK_POD_PREFIXES: [&str; 3] = ["curator-job", "posthookjob", "prehookjob"];

/// Hub-side reads of the objects that keep a cluster namespace alive.
#[async_trait::async_trait]
pub trait NamespaceDependents: Send + Sync {
    async fn cluster(&self, name: &str) -> Result<Option<ManagedCluster>>;

    async fn count(&self, ns: &str, kind: Dependent) -> Result<usize>;

    async fn pods(&self, ns: &str) -> Result<Vec<Pod>>;

    async fn delete_namespace(&self, ns: &str) -> Result<()>;
}

/// Objects whose presence blocks deletion until they are removed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dependent {
    AddOn,
    ClusterDeployment,
    InfraEnv,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Not a cluster namespace, retained, or already terminating.
    Ignore,
    /// The cluster still exists and is not being deleted.
    ClusterActive,
    /// Other controllers still hold finalizers on the cluster.
    WaitForFinalizers,
    /// The cluster's only finalizer is not ours; left for an operator.
    UnexpectedFinalizer(String),
    WaitFor(Dependent, usize),
    /// Pods are still running; recheck after [`POD_DELETION_GRACE_PERIOD`].
    WaitForPods(usize),
    Delete,
}

#[derive(Clone, Debug)]
pub struct NamespaceReaper<S> {
    dependents: S,
}

// === impl Dependent ===

impl Dependent {
    pub const ALL: [Self; 3] = [Self::AddOn, Self::ClusterDeployment, Self::InfraEnv];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddOn => "ManagedClusterAddOn",
            Self::ClusterDeployment => "ClusterDeployment",
            Self::InfraEnv => "InfraEnv",
        }
    }
}

// === impl Verdict ===

impl Verdict {
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::WaitForPods(_) => Some(POD_DELETION_GRACE_PERIOD),
            _ => None,
        }
    }
}

// === impl NamespaceReaper ===

impl<S: NamespaceDependents> NamespaceReaper<S> {
    pub fn new(dependents: S) -> Self {
        Self { dependents }
    }

    pub fn dependents(&self) -> &S {
        &self.dependents
    }

    /// Evaluates the namespace and deletes it when nothing depends on it.
    pub async fn reconcile(&self, ns: &Namespace) -> Result<Verdict> {
        let verdict = self.evaluate(ns).await?;
        let name = ns.name_any();
        match &verdict {
            Verdict::Delete => {
                info!(namespace = %name, "Deleting cluster namespace");
                self.dependents.delete_namespace(&name).await?;
            }
            Verdict::UnexpectedFinalizer(finalizer) => {
                warn!(namespace = %name, %finalizer, "Import finalizer is missing; the namespace must be deleted manually");
            }
            Verdict::WaitFor(kind, n) => {
                info!(namespace = %name, kind = kind.as_str(), count = n, "Waiting for dependents");
            }
            Verdict::WaitForPods(n) => {
                info!(namespace = %name, count = n, "Waiting for pods");
            }
            _ => debug!(namespace = %name, ?verdict, "Keeping namespace"),
        }
        Ok(verdict)
    }

    pub async fn evaluate(&self, ns: &Namespace) -> Result<Verdict> {
        let Some(cluster_name) = candidate(ns) else {
            return Ok(Verdict::Ignore);
        };
        let name = ns.name_any();

        let cluster = self.dependents.cluster(cluster_name).await?;
        if let Some(verdict) = cluster_verdict(cluster.as_ref()) {
            return Ok(verdict);
        }

        for kind in Dependent::ALL {
            let n = self.dependents.count(&name, kind).await?;
            if n > 0 {
                return Ok(Verdict::WaitFor(kind, n));
            }
        }

        let pods = self.dependents.pods(&name).await?;
        let blocking = pods.iter().filter(|p| blocks_deletion(p, &name)).count();
        if blocking > 0 {
            return Ok(Verdict::WaitForPods(blocking));
        }
        Ok(Verdict::Delete)
    }
}

/// The cluster a namespace belongs to, unless the namespace is retained or
/// already terminating.
pub fn candidate(ns: &Namespace) -> Option<&str> {
    if ns.annotations().contains_key(labels::RETAIN_NAMESPACE) {
        return None;
    }
    if ns.metadata.deletion_timestamp.is_some() {
        return None;
    }
    labels::cluster_namespace_name(ns.labels())
}

/// Rules on the cluster's own state; `None` means its state does not block
/// deletion.
pub fn cluster_verdict(cluster: Option<&ManagedCluster>) -> Option<Verdict> {
    let cluster = cluster?;
    if !cluster.is_deleting() {
        return Some(Verdict::ClusterActive);
    }
    match cluster.finalizers() {
        [] => None,
        [only] if only == labels::IMPORT_FINALIZER => None,
        [only] => Some(Verdict::UnexpectedFinalizer(only.clone())),
        _ => Some(Verdict::WaitForFinalizers),
    }
}

/// Ordinary pods always block. Hook pods block only while running, except
/// for the namespace's own uninstall hook.
pub fn blocks_deletion(pod: &Pod, ns: &str) -> bool {
    let name = pod.name_any();
    if !HOOK_POD_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return true;
    }
    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Running");
    running && !name.contains(&format!("{ns}-uninstall"))
}
