use super::{or_absent, KubeHub};
use crate::{
    core::{ca::HubTopology, Result},
    k8s::{Api, APIServer, ConfigMap, Infrastructure, Node, Secret, OPENSHIFT_SINGLETON},
    probe,
};
use kube::api::ListParams;
use std::collections::BTreeMap;

#[async_trait::async_trait]
impl HubTopology for KubeHub {
    async fn infrastructure(&self) -> Result<Option<Infrastructure>> {
        let api = Api::<Infrastructure>::all(self.client());
        or_absent(api.get_opt(OPENSHIFT_SINGLETON).await)
    }

    async fn api_server(&self) -> Result<Option<APIServer>> {
        let api = Api::<APIServer>::all(self.client());
        or_absent(api.get_opt(OPENSHIFT_SINGLETON).await)
    }

    async fn secret(&self, ns: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let api = Api::<Secret>::namespaced(self.client(), ns);
        let secret = or_absent(api.get_opt(name).await)?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn config_map(&self, ns: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let api = Api::<ConfigMap>::namespaced(self.client(), ns);
        let cm = or_absent(api.get_opt(name).await)?;
        Ok(cm.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn node_provider_ids(&self) -> Result<Vec<String>> {
        let api = Api::<Node>::all(self.client());
        let nodes = or_absent(api.list(&ListParams::default()).await.map(|l| l.items))?;
        Ok(nodes
            .into_iter()
            .filter_map(|n| n.spec.and_then(|s| s.provider_id))
            .collect())
    }

    async fn probe_trusted_certificates(&self, server_url: &str) -> Result<Vec<Vec<u8>>> {
        probe::trusted_certificates(server_url).await
    }
}
