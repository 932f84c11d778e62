//! Per-cluster agent configuration, referenced from a ManagedCluster by the
//! `agent.open-cluster-management.io/klusterlet-config` annotation.

use crate::operator::{BootstrapKubeConfigs, NodePlacement};
use k8s_openapi::ByteString;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "config.open-cluster-management.io",
    version = "v1alpha1",
    kind = "KlusterletConfig",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct KlusterletConfigSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registries: Vec<Registry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_placement: Option<NodePlacement>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_kube_api_server_config: Option<KubeApiServerConfig>,

    /// Deprecated in favor of `hubKubeAPIServerConfig`.
    #[serde(default, rename = "hubKubeAPIServerProxyConfig")]
    pub hub_kube_api_server_proxy_config: KubeApiServerProxyConfig,

    /// Deprecated in favor of `hubKubeAPIServerConfig.url`.
    #[serde(
        default,
        rename = "hubKubeAPIServerURL",
        skip_serializing_if = "String::is_empty"
    )]
    pub hub_kube_api_server_url: String,

    /// Deprecated in favor of `hubKubeAPIServerConfig.trustedCABundles`.
    #[serde(
        default,
        rename = "hubKubeAPIServerCABundle",
        skip_serializing_if = "Option::is_none"
    )]
    pub hub_kube_api_server_ca_bundle: Option<ByteString>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub applied_manifest_work_eviction_grace_period: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_mode: Option<InstallMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_kube_configs: Option<BootstrapKubeConfigs>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Registry {
    #[serde(default)]
    pub mirror: String,
    #[serde(default)]
    pub source: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ObjectReference {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeApiServerConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_verification_strategy: String,

    #[serde(default, rename = "trustedCABundles", skip_serializing_if = "Vec::is_empty")]
    pub trusted_ca_bundles: Vec<CaBundle>,

    #[serde(default, rename = "proxyURL", skip_serializing_if = "String::is_empty")]
    pub proxy_url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaBundle {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "caBundle")]
    pub ca_bundle: ConfigMapReference,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigMapReference {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeApiServerProxyConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_proxy: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub https_proxy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<ByteString>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallMode {
    #[serde(default, rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_operator: Option<NoOperator>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NoOperator {
    #[serde(default)]
    pub postfix: String,
}

pub const INSTALL_MODE_NO_OPERATOR: &str = "noOperator";

pub const STRATEGY_USE_SYSTEM_TRUSTSTORE: &str = "UseSystemTruststore";
pub const STRATEGY_USE_AUTO_DETECTED_CA_BUNDLE: &str = "UseAutoDetectedCABundle";
pub const STRATEGY_USE_CUSTOM_CA_BUNDLES: &str = "UseCustomCABundles";

// === impl KlusterletConfigSpec ===

impl KlusterletConfigSpec {
    /// The operator-less postfix, when the config selects that install mode.
    pub fn no_operator_postfix(&self) -> Option<&str> {
        let mode = self.install_mode.as_ref()?;
        if mode.type_ != INSTALL_MODE_NO_OPERATOR {
            return None;
        }
        Some(
            mode.no_operator
                .as_ref()
                .map(|n| n.postfix.as_str())
                .unwrap_or_default(),
        )
    }
}
