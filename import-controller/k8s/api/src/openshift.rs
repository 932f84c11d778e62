//! The OpenShift `config.openshift.io` records consulted for the hub's own
//! API endpoint and serving certificates.

use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "Infrastructure",
    status = "InfrastructureStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    #[serde(default, rename = "apiServerURL")]
    pub api_server_url: String,
}

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "APIServer",
    plural = "apiservers",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct APIServerSpec {
    #[serde(default)]
    pub serving_certs: ServingCerts,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServingCerts {
    #[serde(default)]
    pub named_certificates: Vec<NamedCertificate>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedCertificate {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub serving_certificate: SecretNameReference,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SecretNameReference {
    #[serde(default)]
    pub name: String,
}

// === impl APIServer ===

impl APIServer {
    /// Finds the serving-certificate secret configured for a host name.
    pub fn named_certificate_secret(&self, host: &str) -> Option<&str> {
        self.spec
            .serving_certs
            .named_certificates
            .iter()
            .find(|nc| nc.names.iter().any(|n| n.eq_ignore_ascii_case(host)))
            .map(|nc| nc.serving_certificate.name.as_str())
            .filter(|n| !n.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_certificate_lookup_ignores_case() {
        let apiserver: APIServer = serde_json::from_value(serde_json::json!({
            "apiVersion": "config.openshift.io/v1",
            "kind": "APIServer",
            "metadata": { "name": "cluster" },
            "spec": {
                "servingCerts": {
                    "namedCertificates": [
                        { "names": ["other.example.com"], "servingCertificate": { "name": "other" } },
                        { "names": ["API.hub.example.com"], "servingCertificate": { "name": "hub-cert" } }
                    ]
                }
            }
        }))
        .unwrap();
        assert_eq!(
            apiserver.named_certificate_secret("api.hub.example.com"),
            Some("hub-cert")
        );
        assert_eq!(apiserver.named_certificate_secret("missing.example.com"), None);
    }
}
