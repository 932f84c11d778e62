//! Cluster provisioning records written by hive and the assisted installer.

use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "hive.openshift.io",
    version = "v1",
    kind = "ClusterDeployment",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentSpec {
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default)]
    pub installed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_metadata: Option<ClusterMetadata>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub infra_id: String,
    pub admin_kubeconfig_secret_ref: LocalObjectReference,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "agent-install.openshift.io",
    version = "v1beta1",
    kind = "InfraEnv",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct InfraEnvSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ref: Option<serde_json::Value>,
}

// === impl ClusterDeployment ===

impl ClusterDeployment {
    /// The secret holding the admin kubeconfig, set once the install finished.
    pub fn admin_kubeconfig_secret(&self) -> Option<&str> {
        if !self.spec.installed {
            return None;
        }
        self.spec
            .cluster_metadata
            .as_ref()
            .map(|m| m.admin_kubeconfig_secret_ref.name.as_str())
            .filter(|n| !n.is_empty())
    }
}
