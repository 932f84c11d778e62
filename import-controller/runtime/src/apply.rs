//! Server-side apply of untyped manifests, on the hub or on a managed
//! cluster reached with imported credentials.

use crate::{
    core::{
        autoimport::{Credentials, RemoteApplier},
        Error, Result, FIELD_MANAGER,
    },
    hub::remote,
    k8s::{Api, Client, ResourceExt},
};
use kube::{
    api::{ApiResource, DynamicObject, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::GroupVersionKind,
    discovery::{self, ApiCapabilities, Scope},
    Config,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

/// Applies manifests to the cluster a set of import credentials reaches.
#[derive(Clone)]
pub struct KubeApplier {
    hub: Client,
}

// === impl KubeApplier ===

impl KubeApplier {
    /// `hub` is used as-is for the self-managed cluster.
    pub fn new(hub: Client) -> Self {
        Self { hub }
    }

    async fn client_for(&self, credentials: &Credentials) -> Result<Client> {
        let kubeconfig = match credentials {
            Credentials::InCluster => return Ok(self.hub.clone()),
            Credentials::Kubeconfig(data) => parse_kubeconfig(data)?,
            Credentials::Token { server, token } => token_kubeconfig(server, token)?,
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|error| Error::malformed(format!("invalid import kubeconfig: {error}")))?;
        Client::try_from(config).map_err(remote)
    }
}

#[async_trait::async_trait]
impl RemoteApplier for KubeApplier {
    async fn apply(&self, credentials: &Credentials, manifests: &[Value]) -> Result<()> {
        let client = self.client_for(credentials).await?;
        apply_all(&client, manifests).await
    }
}

/// Applies each object in order, discovering each kind once.
pub(crate) async fn apply_all(client: &Client, objects: &[Value]) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let mut kinds = HashMap::<GroupVersionKind, (ApiResource, ApiCapabilities)>::new();

    for value in objects {
        let obj = serde_json::from_value::<DynamicObject>(value.clone())
            .map_err(|error| Error::malformed(format!("invalid manifest: {error}")))?;
        let gvk = group_version_kind(&obj)?;
        if !kinds.contains_key(&gvk) {
            let discovered = discovery::pinned_kind(client, &gvk).await.map_err(remote)?;
            kinds.insert(gvk.clone(), discovered);
        }
        let Some((resource, caps)) = kinds.get(&gvk) else {
            continue;
        };

        let name = obj.name_any();
        let api = match (&caps.scope, obj.namespace()) {
            (Scope::Namespaced, Some(ns)) => {
                Api::<DynamicObject>::namespaced_with(client.clone(), &ns, resource)
            }
            (Scope::Namespaced, None) => Api::default_namespaced_with(client.clone(), resource),
            (Scope::Cluster, _) => Api::all_with(client.clone(), resource),
        };
        debug!(kind = %gvk.kind, %name, "Applying");
        api.patch(&name, &params, &Patch::Apply(&obj))
            .await
            .map_err(remote)?;
    }
    Ok(())
}

fn group_version_kind(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| Error::malformed("manifest has no apiVersion or kind"))?;
    let (group, version) = types
        .api_version
        .split_once('/')
        .unwrap_or(("", types.api_version.as_str()));
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

fn parse_kubeconfig(data: &[u8]) -> Result<Kubeconfig> {
    let text = std::str::from_utf8(data)
        .map_err(|error| Error::malformed(format!("kubeconfig is not UTF-8: {error}")))?;
    Kubeconfig::from_yaml(text)
        .map_err(|error| Error::malformed(format!("invalid kubeconfig: {error}")))
}

/// A kubeconfig for a bare server and token. The server's certificate is not
/// verified, since an auto-import secret carries no CA.
fn token_kubeconfig(server: &str, token: &str) -> Result<Kubeconfig> {
    let doc = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "default-cluster",
            "cluster": { "server": server, "insecure-skip-tls-verify": true },
        }],
        "users": [{ "name": "default-auth", "user": { "token": token } }],
        "contexts": [{
            "name": "default-context",
            "context": { "cluster": "default-cluster", "user": "default-auth" },
        }],
        "current-context": "default-context",
    });
    parse_kubeconfig(doc.to_string().as_bytes())
}
