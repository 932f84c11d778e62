//! Imports a cluster directly with user-supplied credentials, bounded by a
//! retry budget carried on the credential secret itself.

use crate::{
    bundle::{parse_yaml, ImportSecret},
    k8s::{
        cluster::CONDITION_IMPORT_SUCCEEDED, condition, labels, Condition, ManagedCluster,
        ResourceExt, Secret,
    },
    Error, Result,
};
use serde_json::Value;
use std::{collections::BTreeMap, fmt};
use tracing::{info, warn};

pub const AUTO_IMPORT_SECRET: &str = "auto-import-secret";

/// The controller's config map, in its own namespace.
pub const CONTROLLER_CONFIG: &str = "import-controller-config";

pub const RETRY_KEY: &str = "autoImportRetry";
/// Selects the [`Strategy`] in the controller config map.
pub const STRATEGY_KEY: &str = "autoImportStrategy";
pub const KUBECONFIG_KEY: &str = "kubeconfig";
pub const TOKEN_KEY: &str = "token";
pub const SERVER_KEY: &str = "server";

pub const DEFAULT_RETRY: i64 = 5;

pub const REASON_IMPORTED: &str = "ManagedClusterImported";
pub const REASON_IMPORT_FAILED: &str = "ManagedClusterImportFailed";
pub const REASON_RETRY_EXHAUSTED: &str = "ManagedClusterImportRetryExhausted";

/// Reads and updates the auto-import secret in a cluster namespace.
#[async_trait::async_trait]
pub trait AutoImportSecrets: Send + Sync {
    async fn get(&self, ns: &str) -> Result<Option<Secret>>;

    /// Records the failures still tolerated.
    async fn set_retry(&self, ns: &str, remaining: i64) -> Result<()>;

    /// Records the digest of the manifests last applied with the secret.
    async fn set_synced(&self, ns: &str, digest: &str) -> Result<()>;

    /// Deletes the secret; an absent secret is not an error.
    async fn delete(&self, ns: &str) -> Result<()>;
}

/// Applies manifests to a remote cluster reached with the given credentials.
#[async_trait::async_trait]
pub trait RemoteApplier: Send + Sync {
    async fn apply(&self, credentials: &Credentials, manifests: &[Value]) -> Result<()>;
}

/// How the importer reaches the remote cluster.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// The hub itself, reached with the controller's own identity.
    InCluster,
    Kubeconfig(Vec<u8>),
    Token { server: String, token: String },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// The secret is deleted once the cluster has been imported.
    #[default]
    ImportOnly,
    /// The secret is kept and the import is re-applied whenever the
    /// manifests change, before and after the cluster joins.
    ImportAndSync,
}

/// The number of failed attempts still tolerated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryBudget(i64);

#[derive(Debug)]
pub enum Attempt {
    NoSecret,
    /// The cluster opted out of auto-import.
    Disabled,
    Imported { secret_kept: bool },
    /// The kept secret already synced these manifests.
    Unchanged,
    Failed { remaining: i64, error: Error },
    /// The last tolerated failure; the secret has been deleted.
    Exhausted { error: Error },
}

#[derive(Clone, Debug)]
pub struct AutoImporter<S, A> {
    secrets: S,
    applier: A,
}

// === impl Credentials ===

impl Credentials {
    /// A `kubeconfig` key wins over a `token` and `server` pair.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let get = |k: &str| {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(k))
                .map(|v| v.0.as_slice())
                .filter(|v| !v.is_empty())
        };
        if let Some(kubeconfig) = get(KUBECONFIG_KEY) {
            return Ok(Self::Kubeconfig(kubeconfig.to_vec()));
        }
        match (get(SERVER_KEY), get(TOKEN_KEY)) {
            (Some(server), Some(token)) => Ok(Self::Token {
                server: String::from_utf8_lossy(server).trim().to_string(),
                token: String::from_utf8_lossy(token).trim().to_string(),
            }),
            _ => Err(Error::malformed(
                "the auto-import secret has neither a kubeconfig nor a token and server",
            )),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InCluster => f.write_str("InCluster"),
            Self::Kubeconfig(_) => f.write_str("Kubeconfig(..)"),
            Self::Token { server, .. } => f.debug_struct("Token").field("server", server).finish_non_exhaustive(),
        }
    }
}

// === impl Strategy ===

impl Strategy {
    /// Reads the controller config map's data. An absent map, key, or
    /// unknown value falls back to the default.
    pub fn from_config(data: Option<&BTreeMap<String, String>>) -> Self {
        let value = data
            .and_then(|d| d.get(STRATEGY_KEY))
            .map(|v| v.trim())
            .unwrap_or_default();
        match value {
            "" | "ImportOnly" => Self::ImportOnly,
            "ImportAndSync" => Self::ImportAndSync,
            other => {
                warn!(strategy = %other, "Unknown auto-import strategy; using ImportOnly");
                Self::ImportOnly
            }
        }
    }
}

// === impl RetryBudget ===

impl RetryBudget {
    pub fn new(remaining: i64) -> Self {
        Self(remaining)
    }

    /// An absent counter is the default budget; an unparsable one is an error.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let Some(raw) = secret.data.as_ref().and_then(|d| d.get(RETRY_KEY)) else {
            return Ok(Self(DEFAULT_RETRY));
        };
        let text = String::from_utf8_lossy(&raw.0);
        text.trim()
            .parse()
            .map(Self)
            .map_err(|_| Error::malformed(format!("invalid {RETRY_KEY} value {text:?}")))
    }

    pub fn remaining(&self) -> i64 {
        self.0
    }

    /// Records a failure. Returns `None` when no further failure can be
    /// tolerated.
    pub fn fail(self) -> Option<Self> {
        let next = self.0 - 1;
        (next > 0).then_some(Self(next))
    }
}

// === impl Attempt ===

impl Attempt {
    /// The import condition to record on the cluster, if the attempt ran.
    pub fn condition(&self, cluster: &str) -> Option<Condition> {
        let cond = match self {
            Self::NoSecret | Self::Disabled | Self::Unchanged => return None,
            Self::Imported { .. } => {
                Condition::new(CONDITION_IMPORT_SUCCEEDED, true, REASON_IMPORTED, "Import succeeded")
            }
            Self::Failed { error, .. } => Condition::new(
                CONDITION_IMPORT_SUCCEEDED,
                false,
                REASON_IMPORT_FAILED,
                format!("Unable to import {cluster}: {error}"),
            ),
            Self::Exhausted { error } => Condition::new(
                CONDITION_IMPORT_SUCCEEDED,
                false,
                REASON_RETRY_EXHAUSTED,
                format!(
                    "Unable to import {cluster}: {error}. Retries are exhausted and the {AUTO_IMPORT_SECRET} was deleted"
                ),
            ),
        };
        Some(cond)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSecret => "no-secret",
            Self::Disabled => "disabled",
            Self::Imported { .. } => "imported",
            Self::Unchanged => "unchanged",
            Self::Failed { .. } => "failed",
            Self::Exhausted { .. } => "exhausted",
        }
    }

    /// Failures surface as errors so the caller requeues; an exhausted
    /// budget is terminal.
    pub fn into_result(self, cluster: &str) -> Result<()> {
        match self {
            Self::Failed { error, .. } => Err(error),
            Self::Exhausted { .. } => Err(Error::BudgetExhausted(cluster.to_string())),
            _ => Ok(()),
        }
    }
}

// === impl AutoImporter ===

impl<S: AutoImportSecrets, A: RemoteApplier> AutoImporter<S, A> {
    pub fn new(secrets: S, applier: A) -> Self {
        Self { secrets, applier }
    }

    pub fn secrets(&self) -> &S {
        &self.secrets
    }

    pub fn applier(&self) -> &A {
        &self.applier
    }

    /// Applies the cluster's import manifests with the credentials in its
    /// auto-import secret.
    ///
    /// A kept secret is not used again while the cluster reports a
    /// successful import of the same manifests.
    pub async fn import(
        &self,
        cluster: &ManagedCluster,
        import: &ImportSecret,
        strategy: Strategy,
    ) -> Result<Attempt> {
        let ns = cluster.name_any();
        if cluster.annotations().contains_key(labels::DISABLE_AUTO_IMPORT) {
            return Ok(Attempt::Disabled);
        }
        let Some(secret) = self.secrets.get(&ns).await? else {
            return Ok(Attempt::NoSecret);
        };
        let digest = import.digest();
        if strategy == Strategy::ImportAndSync
            && synced_digest(&secret) == Some(digest.as_str())
            && condition::is_true(cluster.conditions(), CONDITION_IMPORT_SUCCEEDED)
        {
            return Ok(Attempt::Unchanged);
        }
        let budget = RetryBudget::from_secret(&secret)?;

        let mut manifests = parse_yaml(&import.crds_yaml)?;
        manifests.extend(parse_yaml(&import.import_yaml)?);

        let applied = match Credentials::from_secret(&secret) {
            Ok(credentials) => self.applier.apply(&credentials, &manifests).await,
            Err(error) => Err(error),
        };

        match applied {
            Ok(()) => {
                let secret_kept = strategy == Strategy::ImportAndSync;
                if secret_kept {
                    self.secrets.set_synced(&ns, &digest).await?;
                } else {
                    self.secrets.delete(&ns).await?;
                }
                info!(cluster = %ns, ?strategy, "Imported cluster");
                Ok(Attempt::Imported { secret_kept })
            }
            Err(error) => match budget.fail() {
                Some(next) => {
                    warn!(cluster = %ns, remaining = next.remaining(), %error, "Auto-import failed");
                    self.secrets.set_retry(&ns, next.remaining()).await?;
                    Ok(Attempt::Failed {
                        remaining: next.remaining(),
                        error,
                    })
                }
                None => {
                    warn!(cluster = %ns, %error, "Auto-import retries exhausted; deleting the secret");
                    self.secrets.delete(&ns).await?;
                    Ok(Attempt::Exhausted { error })
                }
            },
        }
    }
}

fn synced_digest(secret: &Secret) -> Option<&str> {
    secret
        .metadata
        .annotations
        .as_ref()?
        .get(labels::AUTO_IMPORT_SYNCED)
        .map(String::as_str)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{k8s::ByteString, test_util::Counter};
    use maplit::btreemap;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[derive(Default)]
    pub struct FakeSecrets {
        pub secrets: Mutex<BTreeMap<String, Secret>>,
        pub writes: Counter,
    }

    #[async_trait::async_trait]
    impl AutoImportSecrets for FakeSecrets {
        async fn get(&self, ns: &str) -> Result<Option<Secret>> {
            Ok(self.secrets.lock().get(ns).cloned())
        }

        async fn set_retry(&self, ns: &str, remaining: i64) -> Result<()> {
            self.writes.incr();
            if let Some(s) = self.secrets.lock().get_mut(ns) {
                s.data
                    .get_or_insert_with(Default::default)
                    .insert(RETRY_KEY.to_string(), ByteString(remaining.to_string().into_bytes()));
            }
            Ok(())
        }

        async fn set_synced(&self, ns: &str, digest: &str) -> Result<()> {
            self.writes.incr();
            if let Some(s) = self.secrets.lock().get_mut(ns) {
                s.metadata
                    .annotations
                    .get_or_insert_with(Default::default)
                    .insert(labels::AUTO_IMPORT_SYNCED.to_string(), digest.to_string());
            }
            Ok(())
        }

        async fn delete(&self, ns: &str) -> Result<()> {
            self.writes.incr();
            self.secrets.lock().remove(ns);
            Ok(())
        }
    }

    /// Fails every apply while `fail` is set.
    #[derive(Default)]
    pub struct FakeApplier {
        pub fail: Mutex<Option<String>>,
        pub applied: Mutex<Vec<(Credentials, usize)>>,
    }

    #[async_trait::async_trait]
    impl RemoteApplier for FakeApplier {
        async fn apply(&self, credentials: &Credentials, manifests: &[Value]) -> Result<()> {
            if let Some(msg) = self.fail.lock().clone() {
                return Err(Error::Remote(anyhow::anyhow!(msg)));
            }
            self.applied.lock().push((credentials.clone(), manifests.len()));
            Ok(())
        }
    }

    pub fn auto_import_secret(data: BTreeMap<&str, &str>) -> Secret {
        Secret {
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn import_secret() -> ImportSecret {
        ImportSecret {
            crds_yaml: b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: crd\n".to_vec(),
            import_yaml: b"apiVersion: v1\nkind: Namespace\nmetadata:\n  name: a\n\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n".to_vec(),
            expiration: String::new(),
        }
    }

    fn importer(secret: Option<Secret>) -> AutoImporter<FakeSecrets, FakeApplier> {
        let secrets = FakeSecrets::default();
        if let Some(s) = secret {
            secrets.secrets.lock().insert("c1".to_string(), s);
        }
        AutoImporter::new(secrets, FakeApplier::default())
    }

    fn retry(i: &AutoImporter<FakeSecrets, FakeApplier>) -> Option<i64> {
        let secrets = i.secrets().secrets.lock();
        let s = secrets.get("c1")?;
        RetryBudget::from_secret(s).ok().map(|b| b.remaining())
    }

    #[test]
    fn budget_parsing() {
        let absent = auto_import_secret(BTreeMap::new());
        assert_eq!(RetryBudget::from_secret(&absent).unwrap().remaining(), DEFAULT_RETRY);

        let set = auto_import_secret(btreemap! { RETRY_KEY => " 3\n" });
        assert_eq!(RetryBudget::from_secret(&set).unwrap().remaining(), 3);

        let bad = auto_import_secret(btreemap! { RETRY_KEY => "three" });
        assert!(matches!(RetryBudget::from_secret(&bad), Err(Error::Malformed(_))));
    }

    #[test]
    fn budget_decrements_to_exhaustion() {
        let b = RetryBudget::new(3);
        let b = b.fail().unwrap();
        assert_eq!(b.remaining(), 2);
        let b = b.fail().unwrap();
        assert_eq!(b.remaining(), 1);
        assert_eq!(b.fail(), None);
        assert_eq!(RetryBudget::new(0).fail(), None);
    }

    #[test]
    fn credentials() {
        let kubeconfig = auto_import_secret(btreemap! {
            KUBECONFIG_KEY => "apiVersion: v1",
            TOKEN_KEY => "t",
            SERVER_KEY => "https://s",
        });
        assert_eq!(
            Credentials::from_secret(&kubeconfig).unwrap(),
            Credentials::Kubeconfig(b"apiVersion: v1".to_vec())
        );

        let token = auto_import_secret(btreemap! { TOKEN_KEY => "t\n", SERVER_KEY => "https://s" });
        assert_eq!(
            Credentials::from_secret(&token).unwrap(),
            Credentials::Token {
                server: "https://s".to_string(),
                token: "t".to_string()
            }
        );

        let server_only = auto_import_secret(btreemap! { SERVER_KEY => "https://s" });
        assert!(Credentials::from_secret(&server_only).is_err());
    }

    #[test]
    fn strategy_comes_from_the_controller_config() {
        let config = |v: &str| btreemap! { STRATEGY_KEY.to_string() => v.to_string() };
        assert_eq!(Strategy::from_config(None), Strategy::ImportOnly);
        assert_eq!(Strategy::from_config(Some(&BTreeMap::new())), Strategy::ImportOnly);
        assert_eq!(
            Strategy::from_config(Some(&config("ImportAndSync"))),
            Strategy::ImportAndSync
        );
        assert_eq!(Strategy::from_config(Some(&config("ImportOnly"))), Strategy::ImportOnly);
        assert_eq!(Strategy::from_config(Some(&config("Sometimes"))), Strategy::ImportOnly);
    }

    #[tokio::test]
    async fn budget_of_two_is_exhausted_by_the_second_failure() {
        let i = importer(Some(auto_import_secret(btreemap! {
            RETRY_KEY => "2",
            TOKEN_KEY => "t",
            SERVER_KEY => "https://s",
        })));
        *i.applier().fail.lock() = Some("connection refused".to_string());
        let c = ManagedCluster::new("c1", Default::default());

        let first = i.import(&c, &import_secret(), Strategy::ImportOnly).await.unwrap();
        assert!(matches!(first, Attempt::Failed { remaining: 1, .. }));
        assert_eq!(retry(&i), Some(1));
        let cond = first.condition("c1").unwrap();
        assert_eq!(cond.reason, REASON_IMPORT_FAILED);
        assert_eq!(cond.message, "Unable to import c1: connection refused");
        assert!(first.into_result("c1").unwrap_err().is_retryable());

        let second = i.import(&c, &import_secret(), Strategy::ImportOnly).await.unwrap();
        assert!(matches!(second, Attempt::Exhausted { .. }));
        assert!(i.secrets().secrets.lock().is_empty(), "secret deleted");
        let cond = second.condition("c1").unwrap();
        assert_eq!(cond.reason, REASON_RETRY_EXHAUSTED);
        assert!(!cond.is_true());
        let err = second.into_result("c1").unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted(_)));
        assert!(!err.is_retryable());

        // Nothing left to retry with.
        assert!(matches!(
            i.import(&c, &import_secret(), Strategy::ImportOnly).await.unwrap(),
            Attempt::NoSecret
        ));
    }

    #[tokio::test]
    async fn success_removes_the_secret_unless_syncing() {
        let c = ManagedCluster::new("c1", Default::default());

        let i = importer(Some(auto_import_secret(btreemap! { KUBECONFIG_KEY => "kc" })));
        let attempt = i.import(&c, &import_secret(), Strategy::ImportOnly).await.unwrap();
        assert!(matches!(attempt, Attempt::Imported { secret_kept: false }));
        assert_eq!(attempt.condition("c1").unwrap().reason, REASON_IMPORTED);
        assert!(i.secrets().secrets.lock().is_empty());
        assert_eq!(
            *i.applier().applied.lock(),
            vec![(Credentials::Kubeconfig(b"kc".to_vec()), 3)]
        );

        let i = importer(Some(auto_import_secret(btreemap! { KUBECONFIG_KEY => "kc" })));
        let attempt = i.import(&c, &import_secret(), Strategy::ImportAndSync).await.unwrap();
        assert!(matches!(attempt, Attempt::Imported { secret_kept: true }));
        let secrets = i.secrets().secrets.lock();
        let kept = secrets.get("c1").expect("secret kept");
        assert_eq!(synced_digest(kept), Some(import_secret().digest().as_str()));
    }

    #[tokio::test]
    async fn sync_applies_only_changed_manifests() {
        let i = importer(Some(auto_import_secret(btreemap! { KUBECONFIG_KEY => "kc" })));
        let c = ManagedCluster::new("c1", Default::default());
        let first = i.import(&c, &import_secret(), Strategy::ImportAndSync).await.unwrap();
        assert!(matches!(first, Attempt::Imported { .. }));

        // Until the cluster reports the import, the same manifests are retried.
        let again = i.import(&c, &import_secret(), Strategy::ImportAndSync).await.unwrap();
        assert!(matches!(again, Attempt::Imported { .. }));
        assert_eq!(i.applier().applied.lock().len(), 2);

        let mut imported = c.clone();
        imported.status = Some(crate::k8s::ManagedClusterStatus {
            conditions: vec![Condition::new(CONDITION_IMPORT_SUCCEEDED, true, REASON_IMPORTED, "")],
            ..Default::default()
        });
        let unchanged = i.import(&imported, &import_secret(), Strategy::ImportAndSync).await.unwrap();
        assert!(matches!(unchanged, Attempt::Unchanged));
        assert!(unchanged.condition("c1").is_none());
        assert_eq!(i.applier().applied.lock().len(), 2);

        let mut changed = import_secret();
        changed.import_yaml.extend_from_slice(b"\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n");
        let resynced = i.import(&imported, &changed, Strategy::ImportAndSync).await.unwrap();
        assert!(matches!(resynced, Attempt::Imported { secret_kept: true }));
        assert_eq!(i.applier().applied.lock().len(), 3);
    }

    #[tokio::test]
    async fn missing_credentials_consume_the_budget() {
        let i = importer(Some(auto_import_secret(btreemap! { RETRY_KEY => "5" })));
        let c = ManagedCluster::new("c1", Default::default());
        let attempt = i.import(&c, &import_secret(), Strategy::ImportOnly).await.unwrap();
        assert!(matches!(attempt, Attempt::Failed { remaining: 4, error: Error::Malformed(_) }));
        assert!(i.applier().applied.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_budget_is_not_an_attempt() {
        let i = importer(Some(auto_import_secret(btreemap! { RETRY_KEY => "x", KUBECONFIG_KEY => "kc" })));
        let c = ManagedCluster::new("c1", Default::default());
        assert!(i.import(&c, &import_secret(), Strategy::ImportOnly).await.is_err());
        assert!(i.applier().applied.lock().is_empty());
        assert_eq!(i.secrets().writes.get(), 0);
    }

    #[tokio::test]
    async fn disabled_and_absent() {
        let c = ManagedCluster::new("c1", Default::default());
        assert!(matches!(
            importer(None).import(&c, &import_secret(), Strategy::ImportOnly).await.unwrap(),
            Attempt::NoSecret
        ));

        let mut c = c;
        c.metadata.annotations =
            Some(btreemap! { labels::DISABLE_AUTO_IMPORT.to_string() => String::new() });
        let i = importer(Some(auto_import_secret(btreemap! { KUBECONFIG_KEY => "kc" })));
        let attempt = i.import(&c, &import_secret(), Strategy::ImportOnly).await.unwrap();
        assert!(matches!(attempt, Attempt::Disabled));
        assert!(attempt.condition("c1").is_none());
    }
}
