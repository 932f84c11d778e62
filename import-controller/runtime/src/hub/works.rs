use super::{encode, remote, KubeHub};
use crate::{
    core::{work::WorkStore, Result},
    k8s::{work::ManifestWorkSpec, Api, ManifestWork, ResourceExt},
};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::{json, Value};

/// Optional spec fields, nulled in a replacement patch when absent.
const OPTIONAL_SPEC_FIELDS: [&str; 1] = ["deleteOption"];

#[async_trait::async_trait]
impl WorkStore for KubeHub {
    async fn get(&self, ns: &str, name: &str) -> Result<Option<ManifestWork>> {
        let api = Api::<ManifestWork>::namespaced(self.client(), ns);
        api.get_opt(name).await.map_err(remote)
    }

    async fn list(&self, ns: &str) -> Result<Vec<ManifestWork>> {
        let api = Api::<ManifestWork>::namespaced(self.client(), ns);
        let list = api.list(&ListParams::default()).await.map_err(remote)?;
        Ok(list.items)
    }

    async fn create(&self, work: ManifestWork) -> Result<()> {
        let ns = work.namespace().unwrap_or_default();
        let api = Api::<ManifestWork>::namespaced(self.client(), &ns);
        api.create(&PostParams::default(), &work)
            .await
            .map_err(remote)?;
        Ok(())
    }

    async fn replace_spec(&self, ns: &str, name: &str, spec: ManifestWorkSpec) -> Result<()> {
        let api = Api::<ManifestWork>::namespaced(self.client(), ns);
        let patch = replace_spec_patch(&spec)?;
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(remote)?;
        Ok(())
    }

    async fn delete(&self, ns: &str, name: &str) -> Result<()> {
        let api = Api::<ManifestWork>::namespaced(self.client(), ns);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(error) => Err(remote(error)),
        }
    }

    async fn clear_finalizers(&self, ns: &str, name: &str) -> Result<()> {
        let api = Api::<ManifestWork>::namespaced(self.client(), ns);
        let patch = json!({ "metadata": { "finalizers": null } });
        match api.patch(name, &PatchParams::default(), &Patch::Merge(patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(error) => Err(remote(error)),
        }
    }
}

/// A merge patch that leaves the stored spec equal to `spec`, clearing the
/// optional fields it omits.
fn replace_spec_patch(spec: &ManifestWorkSpec) -> Result<Value> {
    let mut value = serde_json::to_value(spec).map_err(|e| encode("work spec", e))?;
    if let Value::Object(fields) = &mut value {
        for field in OPTIONAL_SPEC_FIELDS {
            fields.entry(field).or_insert(Value::Null);
        }
    }
    Ok(json!({ "spec": value }))
}
