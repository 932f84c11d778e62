//! The minimal single-cluster kubeconfig handed to a remote agent.
//!
//! Serialization is byte-stable: identical inputs always produce identical
//! documents, since the import secret and the rendered bundles are diffed on
//! raw bytes downstream.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_AUTH: &str = "default-auth";
pub const DEFAULT_CONTEXT: &str = "default-context";
pub const DEFAULT_CONTEXT_NAMESPACE: &str = "default";

/// The credential a remote agent uses for its first connection to the hub.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapCredential {
    pub server_url: String,
    pub proxy_url: String,
    ca_file: String,
    ca_data: Vec<u8>,
    pub token: String,
    pub token_creation: Option<DateTime<Utc>>,
    pub token_expiration: Option<DateTime<Utc>>,
}

/// The subset of a bootstrap kubeconfig that determines whether it is still
/// current.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KubeconfigSummary {
    pub server_url: String,
    pub proxy_url: String,
    pub ca_file: String,
    pub ca_data: Vec<u8>,
    pub token: String,
    pub context_cluster: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Document {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    clusters: Vec<Named<Cluster>>,
    contexts: Vec<Named<Context>>,
    current_context: String,
    users: Vec<Named<User>>,
}

#[derive(Debug, Deserialize, Serialize)]
struct Named<T> {
    name: String,
    #[serde(flatten)]
    inner: T,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct Cluster {
    cluster: ClusterInfo,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterInfo {
    server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    certificate_authority: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    certificate_authority_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    proxy_url: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct Context {
    context: ContextInfo,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ContextInfo {
    cluster: String,
    user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    namespace: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct User {
    user: UserInfo,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct UserInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    token: String,
}

// === impl BootstrapCredential ===

impl BootstrapCredential {
    /// Builds a credential. A CA file path is only kept when no CA bytes are
    /// given.
    pub fn new(
        server_url: impl Into<String>,
        proxy_url: impl Into<String>,
        ca_file: impl Into<String>,
        ca_data: Option<Vec<u8>>,
        token: impl Into<String>,
    ) -> Self {
        let ca_data = ca_data.unwrap_or_default();
        let ca_file = if ca_data.is_empty() {
            ca_file.into()
        } else {
            String::new()
        };
        Self {
            server_url: server_url.into(),
            proxy_url: proxy_url.into(),
            ca_file,
            ca_data,
            token: token.into(),
            token_creation: None,
            token_expiration: None,
        }
    }

    pub fn with_token_lifetime(
        mut self,
        created: Option<DateTime<Utc>>,
        expires: Option<DateTime<Utc>>,
    ) -> Self {
        self.token_creation = created;
        self.token_expiration = expires;
        self
    }

    pub fn ca_file(&self) -> &str {
        &self.ca_file
    }

    pub fn ca_data(&self) -> &[u8] {
        &self.ca_data
    }

    /// Serializes the credential as a kubeconfig whose cluster entry is named
    /// `context_cluster`.
    pub fn to_kubeconfig(&self, context_cluster: &str) -> Result<Vec<u8>> {
        let doc = Document {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![Named {
                name: context_cluster.to_string(),
                inner: Cluster {
                    cluster: ClusterInfo {
                        server: self.server_url.clone(),
                        certificate_authority: self.ca_file.clone(),
                        certificate_authority_data: if self.ca_data.is_empty() {
                            String::new()
                        } else {
                            STANDARD.encode(&self.ca_data)
                        },
                        proxy_url: self.proxy_url.clone(),
                    },
                },
            }],
            contexts: vec![Named {
                name: DEFAULT_CONTEXT.to_string(),
                inner: Context {
                    context: ContextInfo {
                        cluster: context_cluster.to_string(),
                        user: DEFAULT_AUTH.to_string(),
                        namespace: DEFAULT_CONTEXT_NAMESPACE.to_string(),
                    },
                },
            }],
            current_context: DEFAULT_CONTEXT.to_string(),
            users: vec![Named {
                name: DEFAULT_AUTH.to_string(),
                inner: User {
                    user: UserInfo {
                        token: self.token.clone(),
                    },
                },
            }],
        };
        serde_yaml::to_string(&doc)
            .map(String::into_bytes)
            .map_err(|error| Error::malformed(format!("failed to encode kubeconfig: {error}")))
    }
}

// === impl KubeconfigSummary ===

impl KubeconfigSummary {
    /// Reads back the current context of a kubeconfig document.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let doc: Document = serde_yaml::from_slice(data)
            .map_err(|error| Error::malformed(format!("invalid kubeconfig: {error}")))?;

        let ctx = doc
            .contexts
            .iter()
            .find(|c| c.name == doc.current_context)
            .ok_or_else(|| Error::malformed("kubeconfig has no current context"))?;
        let cluster = doc
            .clusters
            .iter()
            .find(|c| c.name == ctx.inner.context.cluster)
            .ok_or_else(|| {
                Error::malformed(format!(
                    "kubeconfig context references unknown cluster {}",
                    ctx.inner.context.cluster
                ))
            })?;
        let token = doc
            .users
            .iter()
            .find(|u| u.name == ctx.inner.context.user)
            .map(|u| u.inner.user.token.clone())
            .unwrap_or_default();

        let info = &cluster.inner.cluster;
        let ca_data = if info.certificate_authority_data.is_empty() {
            Vec::new()
        } else {
            STANDARD
                .decode(&info.certificate_authority_data)
                .map_err(|error| Error::malformed(format!("invalid CA data: {error}")))?
        };

        Ok(Self {
            server_url: info.server.clone(),
            proxy_url: info.proxy_url.clone(),
            ca_file: info.certificate_authority.clone(),
            ca_data,
            token,
            context_cluster: cluster.name.clone(),
        })
    }

    /// Whether this kubeconfig still targets the same hub endpoint, trust
    /// anchors, and context as the required credential.
    pub fn matches(&self, required: &BootstrapCredential, context_cluster: &str) -> bool {
        let checks = [
            ("server", self.server_url == required.server_url),
            ("CA file", self.ca_file == required.ca_file),
            ("CA data", self.ca_data == required.ca_data),
            ("proxy", self.proxy_url == required.proxy_url),
            ("context cluster", self.context_cluster == context_cluster),
        ];
        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => {
                tracing::info!(%field, "Bootstrap kubeconfig is stale");
                false
            }
            None => true,
        }
    }
}
