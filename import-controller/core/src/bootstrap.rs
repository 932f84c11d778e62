//! Obtains a scoped bootstrap token and assembles the kubeconfig the remote
//! agent presents on its first connection.

use crate::{
    ca::{CaResolver, HubEndpoint, HubTopology},
    k8s::{klusterlet_config::KlusterletConfigSpec, Secret},
    kubeconfig::{BootstrapCredential, KubeconfigSummary},
    Result,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

/// Used when the hub has no infrastructure record to derive a name from.
pub const DEFAULT_CONTEXT_CLUSTER: &str = "default-cluster";

const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
const BOOTSTRAP_SA_SUFFIX: &str = "bootstrap-sa";

/// The platform's limit on names generated from a prefix.
const MAX_GENERATED_NAME_LEN: usize = 58;
const MAX_NAME_LEN: usize = 63;

/// Issues tokens for hub service accounts.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn secrets(&self, ns: &str) -> Result<Vec<Secret>>;

    async fn request_token(&self, ns: &str, sa: &str, expiration_seconds: i64)
        -> Result<IssuedToken>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub created: Option<DateTime<Utc>>,
    /// Unset for long-lived tokens read from service account secrets.
    pub expiration: Option<DateTime<Utc>>,
}

/// A previously rendered bootstrap kubeconfig and its token expiry, as stored
/// in the import secret.
#[derive(Clone, Debug, Default)]
pub struct StoredKubeconfig {
    pub kubeconfig: Vec<u8>,
    pub expiration: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapKubeconfig {
    pub kubeconfig: Vec<u8>,
    pub credential: BootstrapCredential,
    pub context_cluster: String,
}

#[derive(Clone, Debug)]
pub struct BootstrapCredentialBuilder<T, S> {
    resolver: CaResolver<T>,
    tokens: S,
    token_expiration: Duration,
}

// === impl BootstrapCredentialBuilder ===

impl<T: HubTopology, S: TokenSource> BootstrapCredentialBuilder<T, S> {
    pub fn new(resolver: CaResolver<T>, tokens: S, token_expiration: Duration) -> Self {
        Self {
            resolver,
            tokens,
            token_expiration,
        }
    }

    pub fn resolver(&self) -> &CaResolver<T> {
        &self.resolver
    }

    pub fn tokens(&self) -> &S {
        &self.tokens
    }

    /// Produces the bootstrap kubeconfig for a cluster's bootstrap service
    /// account, reusing the stored token when the stored kubeconfig still
    /// targets the same endpoint and the token is not due for refresh.
    pub async fn build(
        &self,
        ns: &str,
        service_account: &str,
        config: Option<&KlusterletConfigSpec>,
        self_managed: bool,
        stored: Option<&StoredKubeconfig>,
        now: DateTime<Utc>,
    ) -> Result<BootstrapKubeconfig> {
        let HubEndpoint {
            server_url,
            proxy_url,
            ca_file,
            ca_data,
        } = self.resolver.resolve(config, self_managed).await?;
        let context_cluster = context_cluster_name(self.resolver.topology()).await?;

        let required = BootstrapCredential::new(server_url, proxy_url, ca_file, ca_data, "");

        if let Some(stored) = stored {
            if let Some(reused) = self.reuse(stored, &required, &context_cluster, now) {
                debug!(%ns, "Reusing the stored bootstrap token");
                let kubeconfig = reused.to_kubeconfig(&context_cluster)?;
                return Ok(BootstrapKubeconfig {
                    kubeconfig,
                    credential: reused,
                    context_cluster,
                });
            }
        }

        let issued = bootstrap_token(
            &self.tokens,
            ns,
            service_account,
            self.token_expiration.num_seconds(),
        )
        .await?;
        let mut credential = required;
        credential.token = issued.token;
        let credential = credential.with_token_lifetime(issued.created, issued.expiration);
        let kubeconfig = credential.to_kubeconfig(&context_cluster)?;
        Ok(BootstrapKubeconfig {
            kubeconfig,
            credential,
            context_cluster,
        })
    }

    fn reuse(
        &self,
        stored: &StoredKubeconfig,
        required: &BootstrapCredential,
        context_cluster: &str,
        now: DateTime<Utc>,
    ) -> Option<BootstrapCredential> {
        let summary = KubeconfigSummary::parse(&stored.kubeconfig).ok()?;
        if !summary.matches(required, context_cluster) {
            return None;
        }
        let expiration = match stored.expiration.as_deref().filter(|e| !e.is_empty()) {
            Some(e) => Some(DateTime::parse_from_rfc3339(e).ok()?.with_timezone(&Utc)),
            None => None,
        };
        if !token_is_fresh(&summary.token, expiration, self.token_expiration, now) {
            return None;
        }
        let mut cred = required.clone();
        cred.token = summary.token;
        Some(cred.with_token_lifetime(None, expiration))
    }
}

/// A token is refreshed once less than a fifth of its lifetime remains.
/// Tokens without an expiry come from service account secrets and never
/// expire.
fn token_is_fresh(
    token: &str,
    expiration: Option<DateTime<Utc>>,
    lifetime: Duration,
    now: DateTime<Utc>,
) -> bool {
    if token.is_empty() {
        return false;
    }
    match expiration {
        None => true,
        Some(exp) => exp - now > lifetime / 5,
    }
}

/// Looks for a pre-provisioned service account token secret before minting
/// a time-bounded token.
pub async fn bootstrap_token<S: TokenSource + ?Sized>(
    source: &S,
    ns: &str,
    service_account: &str,
    expiration_seconds: i64,
) -> Result<IssuedToken> {
    let mut prefix = format!("{service_account}-token-");
    prefix.truncate(MAX_GENERATED_NAME_LEN);

    for secret in source.secrets(ns).await? {
        if secret.type_.as_deref() != Some(SERVICE_ACCOUNT_TOKEN_TYPE) {
            continue;
        }
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        if !name.starts_with(&prefix) {
            continue;
        }
        let token = secret
            .data
            .as_ref()
            .and_then(|d| d.get("token"))
            .filter(|t| !t.0.is_empty());
        if let Some(token) = token {
            return Ok(IssuedToken {
                token: String::from_utf8_lossy(&token.0).into_owned(),
                created: None,
                expiration: None,
            });
        }
    }

    info!(%ns, sa = %service_account, "Requesting a new bootstrap token");
    source
        .request_token(ns, service_account, expiration_seconds)
        .await
}

/// The kubeconfig cluster name, derived from the hub's infrastructure UID.
///
/// A rebuilt hub gets a new UID, which changes the context and makes agents
/// treat the delivered bootstrap kubeconfig as new.
pub async fn context_cluster_name<T: HubTopology + ?Sized>(topology: &T) -> Result<String> {
    Ok(topology
        .infrastructure()
        .await?
        .and_then(|i| i.metadata.uid)
        .filter(|uid| !uid.is_empty())
        .unwrap_or_else(|| DEFAULT_CONTEXT_CLUSTER.to_string()))
}

pub fn bootstrap_service_account_name(cluster: &str) -> String {
    let name = format!("{cluster}-{BOOTSTRAP_SA_SUFFIX}");
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let keep = MAX_NAME_LEN - BOOTSTRAP_SA_SUFFIX.len() - 1;
    format!("{}-{BOOTSTRAP_SA_SUFFIX}", &cluster[..keep])
}
