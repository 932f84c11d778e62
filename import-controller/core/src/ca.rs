//! Resolves the hub API endpoint, trust anchors, and proxy that a remote
//! agent needs to reach the hub.

use crate::{
    certs::merge_certificate_data,
    k8s::{
        klusterlet_config::{
            CaBundle, KlusterletConfigSpec, STRATEGY_USE_AUTO_DETECTED_CA_BUNDLE,
            STRATEGY_USE_CUSTOM_CA_BUNDLES, STRATEGY_USE_SYSTEM_TRUSTSTORE,
        },
        APIServer, Infrastructure,
    },
    Error, Result,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const INTERNAL_ENDPOINT: &str = "https://kubernetes.default.svc:443";
pub const INTERNAL_ENDPOINT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

const OPENSHIFT_CONFIG_NAMESPACE: &str = "openshift-config";
const KUBE_ROOT_CA: &str = "kube-root-ca.crt";
const CA_BUNDLE_KEYS: &[&str] = &["ca-bundle.crt", "ca.crt", "tls.crt"];

/// Read access to the hub's own topology.
///
/// Lookups return `Ok(None)` when the object does not exist so that callers
/// can fall through to the next strategy.
#[async_trait::async_trait]
pub trait HubTopology: Send + Sync {
    async fn infrastructure(&self) -> Result<Option<Infrastructure>>;

    async fn api_server(&self) -> Result<Option<APIServer>>;

    async fn secret(&self, ns: &str, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>>;

    async fn config_map(&self, ns: &str, name: &str) -> Result<Option<BTreeMap<String, String>>>;

    async fn node_provider_ids(&self) -> Result<Vec<String>>;

    /// Dials the server and returns the peer certificates that chain to a
    /// publicly trusted root. An untrusted chain yields an empty list; a
    /// failure to connect is an error.
    async fn probe_trusted_certificates(&self, server_url: &str) -> Result<Vec<Vec<u8>>>;
}

/// The resolved connection parameters. At most one of `ca_file` and
/// `ca_data` is set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HubEndpoint {
    pub server_url: String,
    pub proxy_url: String,
    pub ca_file: String,
    pub ca_data: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct CaResolver<T> {
    topology: T,
    ca_namespace: String,
    deploy_on_ocp: bool,
}

// === impl CaResolver ===

impl<T: HubTopology> CaResolver<T> {
    /// `ca_namespace` holds the `kube-root-ca.crt` fallback; `deploy_on_ocp`
    /// enables the OpenShift-specific discovery steps.
    pub fn new(topology: T, ca_namespace: impl Into<String>, deploy_on_ocp: bool) -> Self {
        Self {
            topology,
            ca_namespace: ca_namespace.into(),
            deploy_on_ocp,
        }
    }

    pub fn topology(&self) -> &T {
        &self.topology
    }

    pub async fn resolve(
        &self,
        config: Option<&KlusterletConfigSpec>,
        self_managed: bool,
    ) -> Result<HubEndpoint> {
        // Proxy settings are ignored when a self-managed hub uses the
        // in-cluster endpoint.
        if self_managed && !has_custom_server_url_or_strategy(config) {
            return Ok(HubEndpoint {
                server_url: INTERNAL_ENDPOINT.to_string(),
                proxy_url: String::new(),
                ca_file: INTERNAL_ENDPOINT_CA.to_string(),
                ca_data: None,
            });
        }

        let (proxy_url, proxy_ca) = proxy_settings(config);
        let server_url = self.api_server_url(config).await?;

        let api_ca = self.api_server_ca_data(&server_url, config).await?;
        let ca_data =
            merge_certificate_data([api_ca.as_slice(), proxy_ca.unwrap_or_default().as_slice()])?;

        Ok(HubEndpoint {
            server_url,
            proxy_url,
            ca_file: String::new(),
            ca_data: Some(ca_data).filter(|d| !d.is_empty()),
        })
    }

    async fn api_server_url(&self, config: Option<&KlusterletConfigSpec>) -> Result<String> {
        if let Some(config) = config {
            match config.hub_kube_api_server_config.as_ref() {
                Some(api) if !api.url.is_empty() => return Ok(api.url.clone()),
                None if !config.hub_kube_api_server_url.is_empty() => {
                    return Ok(config.hub_kube_api_server_url.clone())
                }
                _ => {}
            }
        }

        if !self.deploy_on_ocp {
            return Err(Error::ApiServerUnknown {
                reason: "the hub is not OpenShift; set hubKubeAPIServerConfig.url in a KlusterletConfig"
                    .to_string(),
                infrastructure_missing: true,
            });
        }

        match self.topology.infrastructure().await? {
            Some(infra) => {
                let url = infra
                    .status
                    .map(|s| s.api_server_url)
                    .unwrap_or_default();
                if url.is_empty() {
                    return Err(Error::ApiServerUnknown {
                        reason: "the Infrastructure status has no apiServerURL".to_string(),
                        infrastructure_missing: false,
                    });
                }
                Ok(url)
            }
            None => Err(Error::ApiServerUnknown {
                reason: "the Infrastructure is not found; set hubKubeAPIServerConfig.url in a KlusterletConfig"
                    .to_string(),
                infrastructure_missing: true,
            }),
        }
    }

    async fn api_server_ca_data(
        &self,
        server_url: &str,
        config: Option<&KlusterletConfigSpec>,
    ) -> Result<Vec<u8>> {
        let Some(config) = config else {
            return self.auto_detect_ca_data(server_url).await;
        };

        let Some(api) = config.hub_kube_api_server_config.as_ref() else {
            if let Some(bundle) = config
                .hub_kube_api_server_ca_bundle
                .as_ref()
                .filter(|b| !b.0.is_empty())
            {
                return Ok(bundle.0.clone());
            }
            return self.auto_detect_ca_data(server_url).await;
        };

        match api.server_verification_strategy.as_str() {
            STRATEGY_USE_SYSTEM_TRUSTSTORE => Ok(Vec::new()),
            STRATEGY_USE_AUTO_DETECTED_CA_BUNDLE | "" => {
                let detected = self.auto_detect_ca_data(server_url).await?;
                let custom = self.custom_ca_data(&api.trusted_ca_bundles).await?;
                merge_certificate_data([detected.as_slice(), custom.as_slice()])
            }
            STRATEGY_USE_CUSTOM_CA_BUNDLES => self.custom_ca_data(&api.trusted_ca_bundles).await,
            unknown => Err(Error::malformed(format!(
                "unknown server verification strategy: {unknown}"
            ))),
        }
    }

    async fn custom_ca_data(&self, bundles: &[CaBundle]) -> Result<Vec<u8>> {
        let mut all = Vec::new();
        for b in bundles {
            let data = self
                .config_map_ca(&b.ca_bundle.namespace, &b.ca_bundle.name, CA_BUNDLE_KEYS)
                .await?;
            all = merge_certificate_data([all.as_slice(), data.as_slice()])?;
        }
        Ok(all)
    }

    async fn auto_detect_ca_data(&self, server_url: &str) -> Result<Vec<u8>> {
        if !self.deploy_on_ocp {
            return self.kube_root_ca().await;
        }

        if let Some(host) = url_host(server_url) {
            if let Some(data) = self.named_certificate(&host).await? {
                return Ok(data);
            }
        }

        // A managed IBM cloud hub serves a publicly trusted certificate, in
        // which case the agent should rely on its system trust store.
        let is_roks = self
            .topology
            .node_provider_ids()
            .await?
            .iter()
            .any(|id| id.starts_with("ibm"));
        if is_roks {
            let certs = self.topology.probe_trusted_certificates(server_url).await?;
            if !certs.is_empty() {
                info!(%server_url, "Hub API server certificate is signed by a trusted CA");
                return Ok(Vec::new());
            }
            info!(%server_url, "No trusted certificate found for the hub API server");
        }

        debug!(ns = %self.ca_namespace, "Falling back to {KUBE_ROOT_CA}");
        self.kube_root_ca().await
    }

    async fn named_certificate(&self, host: &str) -> Result<Option<Vec<u8>>> {
        let Some(apiserver) = self.topology.api_server().await? else {
            debug!("Ignoring the OpenShift APIServer; it is not found");
            return Ok(None);
        };
        let Some(secret_name) = apiserver.named_certificate_secret(host) else {
            return Ok(None);
        };

        let Some(data) = self
            .topology
            .secret(OPENSHIFT_CONFIG_NAMESPACE, secret_name)
            .await?
        else {
            info!(secret = %secret_name, "Named serving certificate secret not found, skipping");
            return Ok(None);
        };
        let tls = data.get("tls.crt").ok_or_else(|| {
            Error::malformed(format!(
                "secret {OPENSHIFT_CONFIG_NAMESPACE}/{secret_name} has no tls.crt"
            ))
        })?;
        if tls.is_empty() {
            return Ok(None);
        }
        info!(secret = %secret_name, "Using the named serving certificate as the bootstrap CA");
        Ok(Some(tls.clone()))
    }

    async fn kube_root_ca(&self) -> Result<Vec<u8>> {
        self.config_map_ca(&self.ca_namespace, KUBE_ROOT_CA, &["ca.crt"])
            .await
    }

    async fn config_map_ca(&self, ns: &str, name: &str, keys: &[&str]) -> Result<Vec<u8>> {
        let data = self
            .topology
            .config_map(ns, name)
            .await?
            .ok_or_else(|| Error::not_found("ConfigMap", format!("{ns}/{name}")))?;
        keys.iter()
            .find_map(|k| data.get(*k))
            .map(|v| v.clone().into_bytes())
            .ok_or_else(|| Error::malformed(format!("no CA data in configmap {ns}/{name}")))
    }
}

/// Whether the config moves the hub endpoint away from the defaults.
fn has_custom_server_url_or_strategy(config: Option<&KlusterletConfigSpec>) -> bool {
    let Some(config) = config else {
        return false;
    };
    match config.hub_kube_api_server_config.as_ref() {
        Some(api) => {
            !api.url.is_empty()
                || (!api.server_verification_strategy.is_empty()
                    && api.server_verification_strategy != STRATEGY_USE_AUTO_DETECTED_CA_BUNDLE)
        }
        None => {
            !config.hub_kube_api_server_url.is_empty()
                || config
                    .hub_kube_api_server_ca_bundle
                    .as_ref()
                    .map(|b| !b.0.is_empty())
                    .unwrap_or(false)
        }
    }
}

/// Returns the proxy URL and, for the deprecated proxy config, the proxy's
/// own CA bundle.
pub fn proxy_settings(config: Option<&KlusterletConfigSpec>) -> (String, Option<Vec<u8>>) {
    let Some(config) = config else {
        return (String::new(), None);
    };
    match config.hub_kube_api_server_config.as_ref() {
        // Trusted bundles of the current config are part of the API server CA.
        Some(api) => (api.proxy_url.clone(), None),
        None => {
            let proxy = &config.hub_kube_api_server_proxy_config;
            if !proxy.https_proxy.is_empty() {
                (
                    proxy.https_proxy.clone(),
                    proxy.ca_bundle.as_ref().map(|b| b.0.clone()),
                )
            } else {
                (proxy.http_proxy.clone(), None)
            }
        }
    }
}

pub(crate) fn url_host(url: &str) -> Option<String> {
    url.parse::<http::Uri>()
        .ok()
        .and_then(|u| u.host().map(str::to_string))
}
