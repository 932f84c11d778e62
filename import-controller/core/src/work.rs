//! Delivers the agent bundles to a managed cluster as ManifestWorks and
//! retires them in dependency order.

use crate::{
    bundle::Bundle,
    k8s::{
        condition, labels,
        work::{DeleteOption, ManifestWorkSpec, ManifestsTemplate, PropagationPolicy, CONDITION_APPLIED},
        ManagedCluster, ManifestWork, ObjectMeta, OwnerReference, Resource, ResourceExt,
    },
    time, Result,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const KLUSTERLET_WORK_SUFFIX: &str = "klusterlet";
pub const KLUSTERLET_CRDS_WORK_SUFFIX: &str = "klusterlet-crds";
const ADDON_WORK_INFIX: &str = "klusterlet-addon";

/// How long works annotated for postponed deletion outlive their cluster's
/// deletion.
pub const POSTPONE_DELETE_PERIOD: Duration = Duration::minutes(10);

/// Hub-side access to stored ManifestWorks.
#[async_trait::async_trait]
pub trait WorkStore: Send + Sync {
    async fn get(&self, ns: &str, name: &str) -> Result<Option<ManifestWork>>;

    async fn list(&self, ns: &str) -> Result<Vec<ManifestWork>>;

    async fn create(&self, work: ManifestWork) -> Result<()>;

    /// Replaces the spec of an existing work, leaving its metadata intact.
    async fn replace_spec(&self, ns: &str, name: &str, spec: ManifestWorkSpec) -> Result<()>;

    /// Deletes a work; an absent work is not an error.
    async fn delete(&self, ns: &str, name: &str) -> Result<()>;

    async fn clear_finalizers(&self, ns: &str, name: &str) -> Result<()>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reconciled {
    Unchanged,
    Created,
    Updated,
    /// The owning cluster is going away; the work was not recreated.
    Skipped,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cleanup {
    Done,
    /// Dependent works are still being removed.
    Waiting,
}

#[derive(Clone, Debug)]
pub struct WorkDistributor<S> {
    store: S,
}

// === impl Reconciled ===

impl Reconciled {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
        }
    }
}

// === impl WorkDistributor ===

impl<S: WorkStore> WorkDistributor<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates the work if absent, replaces its payload if it differs, and
    /// otherwise writes nothing.
    pub async fn reconcile(&self, cluster: &ManagedCluster, desired: ManifestWork) -> Result<Reconciled> {
        let ns = desired.namespace().unwrap_or_default();
        let name = desired.name_any();

        let Some(existing) = self.store.get(&ns, &name).await? else {
            if cluster.is_deleting() {
                debug!(%ns, %name, "Not recreating work for a deleting cluster");
                return Ok(Reconciled::Skipped);
            }
            info!(%ns, %name, "Creating work");
            self.store.create(desired).await?;
            return Ok(Reconciled::Created);
        };

        if existing.spec == desired.spec {
            return Ok(Reconciled::Unchanged);
        }
        info!(%ns, %name, "Updating work payload");
        self.store.replace_spec(&ns, &name, desired.spec).await?;
        Ok(Reconciled::Updated)
    }

    /// Strips delivery finalizers so a work for an unreachable cluster can go
    /// away. Returns whether anything was stripped.
    pub async fn evict(&self, ns: &str, name: &str) -> Result<bool> {
        let Some(work) = self.store.get(ns, name).await? else {
            return Ok(false);
        };
        if work.finalizers().is_empty() {
            return Ok(false);
        }
        info!(%ns, %name, "Evicting work");
        self.store.clear_finalizers(ns, name).await?;
        Ok(true)
    }

    pub async fn delete(&self, ns: &str, name: &str) -> Result<()> {
        self.store.delete(ns, name).await
    }

    /// Deletes a work and evicts it if finalizers hold it.
    pub async fn force_delete(&self, ns: &str, name: &str) -> Result<()> {
        if self.store.get(ns, name).await?.is_none() {
            return Ok(());
        }
        self.store.delete(ns, name).await?;
        self.evict(ns, name).await?;
        Ok(())
    }

    /// Retires a deleting cluster's works.
    ///
    /// An offline cluster's works are all force-deleted. Otherwise other works
    /// go first, then the core work once the agent has applied it, then the
    /// CRD work, whose removal makes the operator uninstall the agent.
    pub async fn cleanup(&self, cluster: &ManagedCluster, now: DateTime<Utc>) -> Result<Cleanup> {
        let ns = cluster.name_any();
        let works = self.store.list(&ns).await?;
        if works.is_empty() {
            return Ok(Cleanup::Done);
        }

        if cluster.is_offline() {
            info!(cluster = %ns, works = works.len(), "Cluster is offline; force deleting works");
            for w in &works {
                self.force_delete(&ns, &w.name_any()).await?;
            }
            return Ok(Cleanup::Done);
        }

        let deleting_since = cluster
            .metadata
            .deletion_timestamp
            .as_ref()
            .and_then(time::to_utc);
        let core = klusterlet_work_name(&ns);
        let crds = crds_work_name(&ns);

        let mut others = 0;
        for w in &works {
            let name = w.name_any();
            if name == core || name == crds {
                continue;
            }
            others += 1;
            if name.starts_with(&format!("{ns}-{ADDON_WORK_INFIX}")) {
                // Removed by the add-on controller.
                continue;
            }
            if w.annotations().contains_key(labels::POSTPONE_DELETE)
                && deleting_since.is_some_and(|t| now - t < POSTPONE_DELETE_PERIOD)
            {
                continue;
            }
            self.store.delete(&ns, &name).await?;
        }
        if others > 0 {
            return Ok(Cleanup::Waiting);
        }

        let Some(core_work) = works.iter().find(|w| w.name_any() == core) else {
            self.force_delete(&ns, &crds).await?;
            return Ok(Cleanup::Done);
        };
        if !condition::is_true(core_work.conditions(), CONDITION_APPLIED) {
            info!(work = %core, "Waiting for the work to be applied before deleting it");
            return Ok(Cleanup::Waiting);
        }
        self.store.delete(&ns, &core).await?;
        Ok(Cleanup::Waiting)
    }

    /// Whether the core work has been applied by the agent.
    pub async fn is_applied(&self, cluster: &str) -> Result<bool> {
        Ok(self
            .store
            .get(cluster, &klusterlet_work_name(cluster))
            .await?
            .map(|w| condition::is_true(w.conditions(), CONDITION_APPLIED))
            .unwrap_or(false))
    }
}

/// Builds the CRD and core works for a cluster's rendered bundles.
pub fn klusterlet_works(cluster: &ManagedCluster, crds: Bundle, core: Bundle) -> [ManifestWork; 2] {
    let name = cluster.name_any();
    // The agent removes its own workloads; deleting the core work must not
    // cascade into them.
    [
        work(cluster, crds_work_name(&name), crds, None),
        work(
            cluster,
            klusterlet_work_name(&name),
            core,
            Some(DeleteOption {
                propagation_policy: PropagationPolicy::Orphan,
            }),
        ),
    ]
}

pub fn klusterlet_work_name(cluster: &str) -> String {
    format!("{cluster}-{KLUSTERLET_WORK_SUFFIX}")
}

pub fn crds_work_name(cluster: &str) -> String {
    format!("{cluster}-{KLUSTERLET_CRDS_WORK_SUFFIX}")
}

/// Whether a stored work is still owned by a live cluster.
pub fn is_owned_by_live_cluster(work: &ManifestWork, cluster: Option<&ManagedCluster>) -> bool {
    let Some(cluster) = cluster else {
        return false;
    };
    if cluster.is_deleting() {
        return false;
    }
    let uid = cluster.uid();
    work.owner_references()
        .iter()
        .any(|o| o.kind == ManagedCluster::kind(&()) && Some(&o.uid) == uid.as_ref())
}

fn work(
    cluster: &ManagedCluster,
    name: String,
    bundle: Bundle,
    delete_option: Option<DeleteOption>,
) -> ManifestWork {
    let cluster_name = cluster.name_any();
    ManifestWork {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(cluster_name.clone()),
            labels: Some(BTreeMap::from([(
                labels::CLUSTER_NAME.to_string(),
                cluster_name,
            )])),
            owner_references: owner_reference(cluster).map(|o| vec![o]),
            ..Default::default()
        },
        spec: ManifestWorkSpec {
            workload: ManifestsTemplate {
                manifests: bundle.into_manifests(),
            },
            delete_option,
        },
        status: None,
    }
}

fn owner_reference(cluster: &ManagedCluster) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: ManagedCluster::api_version(&()).to_string(),
        kind: ManagedCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.uid()?,
        block_owner_deletion: Some(true),
        controller: Some(true),
    })
}
