//! The agent's top-level custom resource, rendered into the import bundle
//! and reconciled on the managed cluster by the registration operator.

use k8s_openapi::api::core::v1::Toleration;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "operator.open-cluster-management.io",
    version = "v1",
    kind = "Klusterlet",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct KlusterletSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    pub deploy_option: DeployOption,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registration_image_pull_spec: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub work_image_pull_spec: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_spec: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_placement: Option<NodePlacement>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_configuration: Option<RegistrationConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_configuration: Option<WorkAgentConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DeployOption {
    pub mode: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacement {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationConfiguration {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_gates: Vec<FeatureGate>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_kube_configs: Option<BootstrapKubeConfigs>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct FeatureGate {
    pub feature: String,
    pub mode: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapKubeConfigs {
    #[serde(default, rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_secrets_config: Option<LocalSecretsConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSecretsConfig {
    #[serde(default)]
    pub kube_config_secrets: Vec<KubeConfigSecret>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_connection_timeout_seconds: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct KubeConfigSecret {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkAgentConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_manifest_work_eviction_grace_period: Option<String>,
}

pub const BOOTSTRAP_KUBECONFIGS_LOCAL_SECRETS: &str = "LocalSecrets";
pub const FEATURE_MULTIPLE_HUBS: &str = "MultipleHubs";
pub const FEATURE_GATE_ENABLE: &str = "Enable";
