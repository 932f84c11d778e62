use super::{encode, or_absent, remote, KubeHub};
use crate::{
    apply::apply_all,
    core::{bundle::ImportSecret, state::HubClusters, time, Result},
    k8s::{
        condition, klusterlet_config::KlusterletConfigSpec, Api, ClusterDeployment, Condition,
        KlusterletConfig, ManagedCluster, ManagedClusterAddOn, ResourceExt, Secret,
    },
};
use chrono::Utc;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use serde_json::{json, Value};
use tracing::debug;

#[async_trait::async_trait]
impl HubClusters for KubeHub {
    async fn patch_metadata(&self, name: &str, patch: Value) -> Result<()> {
        let api = Api::<ManagedCluster>::all(self.client());
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(remote)?;
        Ok(())
    }

    async fn set_condition(&self, name: &str, cond: Condition) -> Result<()> {
        let api = Api::<ManagedCluster>::all(self.client());
        let Some(cluster) = api.get_opt(name).await.map_err(remote)? else {
            debug!(cluster = %name, "Cluster is gone; not setting a condition");
            return Ok(());
        };
        let mut conditions = cluster.conditions().to_vec();
        if !condition::set(&mut conditions, cond, &time::rfc3339(Utc::now())) {
            return Ok(());
        }
        let conditions = serde_json::to_value(conditions).map_err(|e| encode("conditions", e))?;
        api.patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": { "conditions": conditions } })),
        )
        .await
        .map_err(remote)?;
        Ok(())
    }

    async fn klusterlet_config(&self, name: &str) -> Result<Option<KlusterletConfigSpec>> {
        let api = Api::<KlusterletConfig>::all(self.client());
        let config = or_absent(api.get_opt(name).await)?;
        Ok(config.map(|c| c.spec))
    }

    async fn import_secret(&self, ns: &str) -> Result<Option<ImportSecret>> {
        let api = Api::<Secret>::namespaced(self.client(), ns);
        let secret = api.get_opt(&ImportSecret::name(ns)).await.map_err(remote)?;
        Ok(secret.as_ref().and_then(ImportSecret::from_secret))
    }

    async fn apply(&self, objects: Vec<Value>) -> Result<()> {
        apply_all(&self.client(), &objects).await
    }

    async fn cluster_deployment(&self, ns: &str) -> Result<Option<ClusterDeployment>> {
        let api = Api::<ClusterDeployment>::namespaced(self.client(), ns);
        or_absent(api.get_opt(ns).await)
    }

    async fn delete_addons(&self, ns: &str, force: bool) -> Result<usize> {
        let api = Api::<ManagedClusterAddOn>::namespaced(self.client(), ns);
        let addons = or_absent(api.list(&ListParams::default()).await.map(|l| l.items))?;
        if addons.is_empty() {
            return Ok(0);
        }

        for addon in &addons {
            let name = addon.name_any();
            if force && !addon.finalizers().is_empty() {
                let patch = json!({ "metadata": { "finalizers": null } });
                api.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
                    .await
                    .map_err(remote)?;
            }
            if addon.metadata.deletion_timestamp.is_none() {
                debug!(%ns, addon = %name, force, "Deleting add-on");
                match api.delete(&name, &DeleteParams::background()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(error) => return Err(remote(error)),
                }
            }
        }

        let remaining = api.list(&ListParams::default()).await.map_err(remote)?;
        Ok(remaining.items.len())
    }
}
