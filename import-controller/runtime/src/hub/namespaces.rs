use super::{or_absent, remote, KubeHub};
use crate::{
    core::{
        reaper::{Dependent, NamespaceDependents},
        Result,
    },
    k8s::{Api, ClusterDeployment, InfraEnv, ManagedCluster, ManagedClusterAddOn, Namespace, Pod},
};
use kube::api::{DeleteParams, ListParams};

#[async_trait::async_trait]
impl NamespaceDependents for KubeHub {
    async fn cluster(&self, name: &str) -> Result<Option<ManagedCluster>> {
        let api = Api::<ManagedCluster>::all(self.client());
        api.get_opt(name).await.map_err(remote)
    }

    async fn count(&self, ns: &str, kind: Dependent) -> Result<usize> {
        let client = self.client();
        let params = ListParams::default();
        // Hive and the assisted installer are optional; their kinds may be
        // missing entirely.
        let n = match kind {
            Dependent::AddOn => {
                let api = Api::<ManagedClusterAddOn>::namespaced(client, ns);
                or_absent(api.list(&params).await.map(|l| l.items.len()))?
            }
            Dependent::ClusterDeployment => {
                let api = Api::<ClusterDeployment>::namespaced(client, ns);
                or_absent(api.list(&params).await.map(|l| l.items.len()))?
            }
            Dependent::InfraEnv => {
                let api = Api::<InfraEnv>::namespaced(client, ns);
                or_absent(api.list(&params).await.map(|l| l.items.len()))?
            }
        };
        Ok(n)
    }

    async fn pods(&self, ns: &str) -> Result<Vec<Pod>> {
        let api = Api::<Pod>::namespaced(self.client(), ns);
        let list = api.list(&ListParams::default()).await.map_err(remote)?;
        Ok(list.items)
    }

    async fn delete_namespace(&self, ns: &str) -> Result<()> {
        let api = Api::<Namespace>::all(self.client());
        match api.delete(ns, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(error) => Err(remote(error)),
        }
    }
}
