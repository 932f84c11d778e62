use super::{remote, KubeHub};
use crate::{
    core::{
        autoimport::{AutoImportSecrets, AUTO_IMPORT_SECRET, RETRY_KEY},
        Result,
    },
    k8s::{labels, Api, ByteString, Secret},
};
use kube::api::{DeleteParams, Patch, PatchParams};
use serde_json::json;

#[async_trait::async_trait]
impl AutoImportSecrets for KubeHub {
    async fn get(&self, ns: &str) -> Result<Option<Secret>> {
        let api = Api::<Secret>::namespaced(self.client(), ns);
        api.get_opt(AUTO_IMPORT_SECRET).await.map_err(remote)
    }

    async fn set_retry(&self, ns: &str, remaining: i64) -> Result<()> {
        let api = Api::<Secret>::namespaced(self.client(), ns);
        let value = ByteString(remaining.to_string().into_bytes());
        let patch = json!({ "data": { (RETRY_KEY): value } });
        api.patch(AUTO_IMPORT_SECRET, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(remote)?;
        Ok(())
    }

    async fn set_synced(&self, ns: &str, digest: &str) -> Result<()> {
        let api = Api::<Secret>::namespaced(self.client(), ns);
        let patch = json!({
            "metadata": { "annotations": { (labels::AUTO_IMPORT_SYNCED): digest } },
        });
        api.patch(AUTO_IMPORT_SECRET, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(remote)?;
        Ok(())
    }

    async fn delete(&self, ns: &str) -> Result<()> {
        let api = Api::<Secret>::namespaced(self.client(), ns);
        match api.delete(AUTO_IMPORT_SECRET, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(error) => Err(remote(error)),
        }
    }
}
