//! Drives a managed cluster from first sight through import, and back out
//! again when it is deleted.
//!
//! Each reconciliation runs the pipeline in a fixed order: the hub endpoint
//! and bootstrap credential, the rendered manifests and import secret, the
//! delivered works, and finally a direct import when a credential source is
//! available. Decisions that do not need I/O are free functions so they can be
//! checked in isolation.

use crate::{
    autoimport::{
        Attempt, AutoImportSecrets, AutoImporter, Credentials, RemoteApplier, Strategy,
        CONTROLLER_CONFIG, REASON_IMPORTED,
    },
    bootstrap::{bootstrap_service_account_name, BootstrapCredentialBuilder, TokenSource},
    bundle::{parse_yaml, Bundle, ImportSecret},
    ca::HubTopology,
    k8s::{
        cluster::CONDITION_IMPORT_SUCCEEDED, condition, klusterlet_config::KlusterletConfigSpec,
        labels, ClusterDeployment, Condition, ManagedCluster, ResourceExt,
    },
    render::{
        hub_bootstrap_rbac, supports_priority_class, InstallMode, KlusterletManifestsConfig,
        RenderSettings, PRIORITY_CLASS,
    },
    time,
    work::{klusterlet_works, Cleanup, Reconciled, WorkDistributor, WorkStore},
    Error, Result, YAML_SEPARATOR,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// How long to wait for a provisioner to finish installing a cluster.
pub const PROVISIONER_REQUEUE: Duration = Duration::from_secs(60);

/// How often a detaching cluster is rechecked while its works drain.
pub const DETACH_REQUEUE: Duration = Duration::from_secs(5);

/// How long to wait before retrying a failed auto-import.
pub const IMPORT_RETRY: Duration = Duration::from_secs(30);

pub const REASON_DETACHING: &str = "ManagedClusterDetaching";
pub const REASON_FORCE_DETACHING: &str = "ManagedClusterForceDetaching";

const PROVENANCE: [&str; 4] = [
    labels::CREATED_VIA_HIVE,
    labels::CREATED_VIA_ASSISTED_INSTALLER,
    labels::CREATED_VIA_DISCOVERY,
    labels::CREATED_VIA_OTHER,
];

/// Hub-side reads and writes the state machine needs beyond its components.
#[async_trait::async_trait]
pub trait HubClusters: Send + Sync {
    /// Applies a JSON merge patch to a ManagedCluster.
    async fn patch_metadata(&self, name: &str, patch: Value) -> Result<()>;

    async fn set_condition(&self, name: &str, condition: Condition) -> Result<()>;

    async fn klusterlet_config(&self, name: &str) -> Result<Option<KlusterletConfigSpec>>;

    async fn import_secret(&self, ns: &str) -> Result<Option<ImportSecret>>;

    /// Server-side applies hub objects.
    async fn apply(&self, objects: Vec<Value>) -> Result<()>;

    async fn cluster_deployment(&self, ns: &str) -> Result<Option<ClusterDeployment>>;

    /// Deletes the add-ons in a cluster namespace, stripping their finalizers
    /// when `force` is set. Returns how many remain.
    async fn delete_addons(&self, ns: &str, force: bool) -> Result<usize>;
}

/// Process-wide toggles, fixed at startup.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Features {
    pub hosted_mode: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    New,
    MetadataEnsured,
    Importing,
    Imported,
    Detaching,
    /// Our finalizer is gone; the namespace reaper takes over.
    NamespaceEligible,
}

/// Where the credentials for a direct import come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportSource {
    /// A provisioner's admin kubeconfig secret in the cluster namespace.
    Provisioner { kubeconfig_secret: String },
    AutoImport,
    SelfManaged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDecision {
    Import(ImportSource),
    /// The agent is installed by hand or by the delivered works.
    Manual,
    /// A provisioner has not finished installing the cluster.
    Requeue(Duration),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetachDecision {
    NotDeleting,
    /// Our finalizer is already gone.
    Released,
    WaitForFinalizers,
    Cleanup { force: bool },
}

/// What a reconciliation did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub phase: Phase,
    pub requeue_after: Option<Duration>,
    pub works: Vec<Reconciled>,
    /// The direct import result, when one was attempted.
    pub import: Option<&'static str>,
}

pub struct ImportStateMachine<T, S, W, H, I, A> {
    credentials: BootstrapCredentialBuilder<T, S>,
    works: WorkDistributor<W>,
    importer: AutoImporter<I, A>,
    hub: H,
    settings: RenderSettings,
    features: Features,
}

// === impl Phase ===

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::MetadataEnsured => "metadata-ensured",
            Self::Importing => "importing",
            Self::Imported => "imported",
            Self::Detaching => "detaching",
            Self::NamespaceEligible => "namespace-eligible",
        }
    }

    /// The phase a cluster is observed in.
    pub fn of(cluster: &ManagedCluster, has_source: bool) -> Self {
        if cluster.is_deleting() {
            if has_import_finalizer(cluster) {
                return Self::Detaching;
            }
            return Self::NamespaceEligible;
        }
        if metadata_patch(cluster).is_some() {
            return Self::New;
        }
        if condition::is_true(cluster.conditions(), CONDITION_IMPORT_SUCCEEDED) || cluster.is_joined() {
            return Self::Imported;
        }
        if has_source {
            return Self::Importing;
        }
        Self::MetadataEnsured
    }
}

// === impl ImportStateMachine ===

impl<T, S, W, H, I, A> ImportStateMachine<T, S, W, H, I, A>
where
    T: HubTopology,
    S: TokenSource,
    W: WorkStore,
    H: HubClusters,
    I: AutoImportSecrets,
    A: RemoteApplier,
{
    pub fn new(
        credentials: BootstrapCredentialBuilder<T, S>,
        works: WorkDistributor<W>,
        importer: AutoImporter<I, A>,
        hub: H,
        settings: RenderSettings,
        features: Features,
    ) -> Self {
        Self {
            credentials,
            works,
            importer,
            hub,
            settings,
            features,
        }
    }

    pub fn hub(&self) -> &H {
        &self.hub
    }

    pub fn works(&self) -> &WorkDistributor<W> {
        &self.works
    }

    pub fn importer(&self) -> &AutoImporter<I, A> {
        &self.importer
    }

    pub async fn reconcile(&self, cluster: &ManagedCluster, now: DateTime<Utc>) -> Result<Reconciliation> {
        if cluster.is_deleting() {
            return self.detach(cluster, now).await;
        }
        let name = cluster.name_any();

        if let Some(patch) = metadata_patch(cluster) {
            debug!(cluster = %name, "Ensuring cluster metadata");
            self.hub.patch_metadata(&name, patch).await?;
        }
        let mut out = Reconciliation {
            phase: Phase::MetadataEnsured,
            ..Default::default()
        };

        let mode = InstallMode::from_annotations(cluster.annotations())?;
        if mode.is_hosted() && !self.features.hosted_mode {
            info!(cluster = %name, %mode, "Hosted mode is disabled; not importing");
            return Ok(out);
        }

        let import = self.ensure_import_secret(cluster, mode, now).await?;

        // Once the agent has joined, it keeps itself current through works.
        if !mode.is_hosted() && cluster.is_joined() {
            let crds = Bundle::new(parse_yaml(&import.crds_yaml)?)?;
            let core = Bundle::new(parse_yaml(&import.import_yaml)?)?;
            for work in klusterlet_works(cluster, crds, core) {
                out.works.push(self.works.reconcile(cluster, work).await?);
            }
            out.phase = Phase::Imported;
            // A kept auto-import secret also carries later changes across.
            if self.importer.secrets().get(&name).await?.is_some()
                && self.auto_import_strategy().await? == Strategy::ImportAndSync
            {
                self.auto_import(cluster, &import, Strategy::ImportAndSync, &mut out)
                    .await?;
            }
            return Ok(out);
        }
        if mode.is_hosted() {
            return Ok(out);
        }

        let deployment = self.hub.cluster_deployment(&name).await?;
        let auto_import = self.importer.secrets().get(&name).await?.is_some();
        let source = match select_source(cluster, deployment.as_ref(), auto_import) {
            SourceDecision::Manual => return Ok(out),
            SourceDecision::Requeue(after) => {
                info!(cluster = %name, "Waiting for the cluster to be provisioned");
                out.requeue_after = Some(after);
                return Ok(out);
            }
            SourceDecision::Import(source) => source,
        };
        out.phase = Phase::Importing;

        if source == ImportSource::AutoImport {
            let strategy = self.auto_import_strategy().await?;
            self.auto_import(cluster, &import, strategy, &mut out).await?;
            return Ok(out);
        }

        if condition::is_true(cluster.conditions(), CONDITION_IMPORT_SUCCEEDED) {
            out.phase = Phase::Imported;
            return Ok(out);
        }
        let credentials = self.source_credentials(&name, &source).await?;
        let mut manifests = parse_yaml(&import.crds_yaml)?;
        manifests.extend(parse_yaml(&import.import_yaml)?);
        self.importer.applier().apply(&credentials, &manifests).await?;
        info!(cluster = %name, ?source, "Imported cluster");
        self.hub
            .set_condition(
                &name,
                Condition::new(CONDITION_IMPORT_SUCCEEDED, true, REASON_IMPORTED, "Import succeeded"),
            )
            .await?;
        out.import = Some("imported");
        out.phase = Phase::Imported;
        Ok(out)
    }

    async fn auto_import_strategy(&self) -> Result<Strategy> {
        let config = self
            .credentials
            .resolver()
            .topology()
            .config_map(&self.settings.pod_namespace, CONTROLLER_CONFIG)
            .await?;
        Ok(Strategy::from_config(config.as_ref()))
    }

    async fn auto_import(
        &self,
        cluster: &ManagedCluster,
        import: &ImportSecret,
        strategy: Strategy,
        out: &mut Reconciliation,
    ) -> Result<()> {
        let name = cluster.name_any();
        let attempt = self.importer.import(cluster, import, strategy).await?;
        if let Some(cond) = attempt.condition(&name) {
            self.hub.set_condition(&name, cond).await?;
        }
        let done = matches!(attempt, Attempt::Imported { .. } | Attempt::Unchanged);
        if !matches!(attempt, Attempt::Unchanged) {
            out.import = Some(attempt.as_str());
        }
        match attempt.into_result(&name) {
            Ok(()) if done => out.phase = Phase::Imported,
            Ok(()) => {}
            Err(error) if error.is_retryable() => out.requeue_after = Some(IMPORT_RETRY),
            Err(error) => debug!(cluster = %name, %error, "Not retrying auto-import"),
        }
        Ok(())
    }

    /// Renders the cluster's manifests and stores them in its import secret
    /// when they changed.
    pub async fn ensure_import_secret(
        &self,
        cluster: &ManagedCluster,
        mode: InstallMode,
        now: DateTime<Utc>,
    ) -> Result<ImportSecret> {
        let name = cluster.name_any();
        let service_account = bootstrap_service_account_name(&name);
        self.hub.apply(hub_bootstrap_rbac(&name)?).await?;

        let config = match cluster.annotations().get(labels::KLUSTERLET_CONFIG) {
            Some(config_name) if !config_name.is_empty() => {
                self.hub.klusterlet_config(config_name).await?
            }
            _ => None,
        };
        let existing = self.hub.import_secret(&name).await?;
        let stored = existing.as_ref().and_then(ImportSecret::stored_kubeconfig);
        let self_managed = labels::is_self_managed(cluster.labels());

        let bootstrap = self
            .credentials
            .build(
                &name,
                &service_account,
                config.as_ref(),
                self_managed,
                stored.as_ref(),
                now,
            )
            .await?;

        let priority_class = supports_priority_class(cluster.kubernetes_version())
            .then(|| PRIORITY_CLASS.to_string());
        let rendered = KlusterletManifestsConfig::new(mode, name.clone(), bootstrap.kubeconfig)
            .with_managed_cluster(cluster.annotations().clone(), self_managed)
            .with_agent_cluster_annotations(cluster.annotations())
            .with_klusterlet_config(config)
            .with_priority_class(priority_class)
            .render(self.credentials.resolver().topology(), &self.settings)
            .await?;

        let expiration = bootstrap
            .credential
            .token_expiration
            .map(time::rfc3339)
            .unwrap_or_default();
        let secret = ImportSecret::from_manifests(rendered, expiration)?;
        if existing.as_ref() != Some(&secret) {
            info!(cluster = %name, "Updating import secret");
            let value = serde_json::to_value(secret.to_secret(&name))
                .map_err(|error| Error::malformed(format!("failed to encode import secret: {error}")))?;
            self.hub.apply(vec![value]).await?;
        }
        Ok(secret)
    }

    /// The stored import manifests for a cluster, CRDs first, as one YAML
    /// stream for a human to apply by hand.
    pub async fn generate_manifests(&self, cluster: &str) -> Result<Vec<u8>> {
        let secret = self
            .hub
            .import_secret(cluster)
            .await?
            .ok_or_else(|| Error::not_found("Secret", format!("{cluster}/{}", ImportSecret::name(cluster))))?;
        let mut out = secret.crds_yaml;
        if !out.is_empty() && !secret.import_yaml.is_empty() {
            out.extend_from_slice(YAML_SEPARATOR.as_bytes());
        }
        out.extend(secret.import_yaml);
        Ok(out)
    }

    /// Retires a deleting cluster's add-ons and works, then releases its
    /// finalizer.
    pub async fn detach(&self, cluster: &ManagedCluster, now: DateTime<Utc>) -> Result<Reconciliation> {
        let name = cluster.name_any();
        let force = match detach_decision(cluster) {
            DetachDecision::NotDeleting => {
                return Ok(Reconciliation {
                    phase: Phase::of(cluster, false),
                    ..Default::default()
                })
            }
            DetachDecision::Released => {
                return Ok(Reconciliation {
                    phase: Phase::NamespaceEligible,
                    ..Default::default()
                })
            }
            DetachDecision::WaitForFinalizers => {
                debug!(cluster = %name, "Waiting for other finalizers to be removed");
                return Ok(Reconciliation {
                    phase: Phase::Detaching,
                    ..Default::default()
                });
            }
            DetachDecision::Cleanup { force } => force,
        };

        let (reason, message) = if force {
            (REASON_FORCE_DETACHING, "The managed cluster is being detached by force")
        } else {
            (REASON_DETACHING, "The managed cluster is being detached now")
        };
        let current = condition::find(cluster.conditions(), CONDITION_IMPORT_SUCCEEDED);
        if current.map(|c| c.reason.as_str()) != Some(reason) {
            self.hub
                .set_condition(&name, Condition::new(CONDITION_IMPORT_SUCCEEDED, false, reason, message))
                .await?;
        }

        let waiting = Reconciliation {
            phase: Phase::Detaching,
            requeue_after: Some(DETACH_REQUEUE),
            ..Default::default()
        };
        let addons = self.hub.delete_addons(&name, force).await?;
        if addons > 0 {
            info!(cluster = %name, addons, "Waiting for add-ons to be removed");
            return Ok(waiting);
        }
        if self.works.cleanup(cluster, now).await? == Cleanup::Waiting {
            return Ok(waiting);
        }

        info!(cluster = %name, "Removing the import finalizer");
        self.hub
            .patch_metadata(&name, finalizers_patch(cluster, labels::IMPORT_FINALIZER))
            .await?;
        Ok(Reconciliation {
            phase: Phase::NamespaceEligible,
            ..Default::default()
        })
    }

    async fn source_credentials(&self, ns: &str, source: &ImportSource) -> Result<Credentials> {
        match source {
            ImportSource::SelfManaged => Ok(Credentials::InCluster),
            ImportSource::AutoImport => Err(Error::malformed("auto-import credentials are read by the importer")),
            ImportSource::Provisioner { kubeconfig_secret } => {
                let data = self
                    .credentials
                    .resolver()
                    .topology()
                    .secret(ns, kubeconfig_secret)
                    .await?
                    .ok_or_else(|| Error::not_found("Secret", format!("{ns}/{kubeconfig_secret}")))?;
                let kubeconfig = data
                    .get("kubeconfig")
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| {
                        Error::malformed(format!("kubeconfig key not found in secret {kubeconfig_secret}"))
                    })?;
                Ok(Credentials::Kubeconfig(kubeconfig.clone()))
            }
        }
    }
}

/// The merge patch that labels the cluster, records its provenance, and adds
/// the import finalizer. `None` when nothing would change.
pub fn metadata_patch(cluster: &ManagedCluster) -> Option<Value> {
    let name = cluster.name_any();
    let mut metadata = serde_json::Map::new();

    if cluster.labels().get(labels::CLUSTER_NAME) != Some(&name) {
        metadata.insert("labels".into(), json!({ (labels::CLUSTER_NAME): name }));
    }

    let created_via = cluster.annotations().get(labels::CREATED_VIA).map(String::as_str);
    if !created_via.is_some_and(|v| PROVENANCE.contains(&v)) {
        metadata.insert(
            "annotations".into(),
            json!({ (labels::CREATED_VIA): labels::CREATED_VIA_OTHER }),
        );
    }

    if !has_import_finalizer(cluster) {
        // Merge patches replace lists, so the full set is sent.
        let mut finalizers = cluster.finalizers().to_vec();
        finalizers.push(labels::IMPORT_FINALIZER.to_string());
        metadata.insert("finalizers".into(), json!(finalizers));
    }

    if metadata.is_empty() {
        return None;
    }
    Some(json!({ "metadata": metadata }))
}

/// Selects the credential source for a direct import. A provisioner's
/// kubeconfig wins over an auto-import secret.
pub fn select_source(
    cluster: &ManagedCluster,
    deployment: Option<&ClusterDeployment>,
    auto_import: bool,
) -> SourceDecision {
    if let Some(cd) = deployment {
        return match cd.admin_kubeconfig_secret() {
            Some(secret) => SourceDecision::Import(ImportSource::Provisioner {
                kubeconfig_secret: secret.to_string(),
            }),
            None => SourceDecision::Requeue(PROVISIONER_REQUEUE),
        };
    }
    if auto_import {
        return SourceDecision::Import(ImportSource::AutoImport);
    }
    if labels::is_self_managed(cluster.labels()) {
        return SourceDecision::Import(ImportSource::SelfManaged);
    }
    SourceDecision::Manual
}

pub fn detach_decision(cluster: &ManagedCluster) -> DetachDecision {
    if !cluster.is_deleting() {
        return DetachDecision::NotDeleting;
    }
    if !has_import_finalizer(cluster) {
        return DetachDecision::Released;
    }
    if cluster.finalizers().len() > 1 {
        return DetachDecision::WaitForFinalizers;
    }
    DetachDecision::Cleanup {
        force: !cluster.spec.hub_accepts_client || cluster.is_offline(),
    }
}

fn has_import_finalizer(cluster: &ManagedCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == labels::IMPORT_FINALIZER)
}

fn finalizers_patch(cluster: &ManagedCluster, remove: &str) -> Value {
    let finalizers = cluster
        .finalizers()
        .iter()
        .filter(|f| *f != remove)
        .cloned()
        .collect::<Vec<_>>();
    json!({ "metadata": { "finalizers": finalizers } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        autoimport::{
            tests::{auto_import_secret, FakeApplier, FakeSecrets},
            KUBECONFIG_KEY, REASON_RETRY_EXHAUSTED, RETRY_KEY, STRATEGY_KEY,
        },
        bootstrap::tests::FakeTokens,
        ca::{
            tests::{ocp_topology, FakeTopology, CA_NS},
            CaResolver,
        },
        k8s::{
            cluster::{ManagedClusterStatus, CONDITION_AVAILABLE, CONDITION_JOINED},
            hive::{ClusterDeploymentSpec, ClusterMetadata, LocalObjectReference},
        },
        render::DefaultImages,
        test_util::{cert_pem, Counter},
        work::tests::{cluster as work_cluster, FakeWorks},
    };
    use maplit::btreemap;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct FakeHub {
        patches: Mutex<Vec<Value>>,
        conditions: Mutex<Vec<Condition>>,
        import_secrets: Mutex<BTreeMap<String, ImportSecret>>,
        applied: Mutex<Vec<Value>>,
        applies: Counter,
        deployment: Option<ClusterDeployment>,
        addons: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl HubClusters for FakeHub {
        async fn patch_metadata(&self, _: &str, patch: Value) -> Result<()> {
            self.patches.lock().push(patch);
            Ok(())
        }

        async fn set_condition(&self, _: &str, condition: Condition) -> Result<()> {
            self.conditions.lock().push(condition);
            Ok(())
        }

        async fn klusterlet_config(&self, _: &str) -> Result<Option<KlusterletConfigSpec>> {
            Ok(None)
        }

        async fn import_secret(&self, ns: &str) -> Result<Option<ImportSecret>> {
            Ok(self.import_secrets.lock().get(ns).cloned())
        }

        async fn apply(&self, objects: Vec<Value>) -> Result<()> {
            self.applies.incr();
            for o in objects {
                if o["kind"] == "Secret" {
                    let secret = serde_json::from_value(o.clone()).unwrap();
                    if let Some(s) = ImportSecret::from_secret(&secret) {
                        let ns = o["metadata"]["namespace"].as_str().unwrap().to_string();
                        self.import_secrets.lock().insert(ns, s);
                    }
                }
                self.applied.lock().push(o);
            }
            Ok(())
        }

        async fn cluster_deployment(&self, _: &str) -> Result<Option<ClusterDeployment>> {
            Ok(self.deployment.clone())
        }

        async fn delete_addons(&self, _: &str, _force: bool) -> Result<usize> {
            let mut addons = self.addons.lock();
            let remaining = *addons;
            *addons = 0;
            Ok(remaining)
        }
    }

    const POD_NS: &str = "open-cluster-management";

    type Machine = ImportStateMachine<FakeTopology, FakeTokens, FakeWorks, FakeHub, FakeSecrets, FakeApplier>;

    fn machine(topology: FakeTopology, hub: FakeHub) -> Machine {
        let resolver = CaResolver::new(topology, CA_NS, true);
        let credentials = BootstrapCredentialBuilder::new(resolver, FakeTokens::default(), chrono::Duration::days(365));
        ImportStateMachine::new(
            credentials,
            WorkDistributor::new(FakeWorks::default()),
            AutoImporter::new(FakeSecrets::default(), FakeApplier::default()),
            hub,
            RenderSettings {
                images: DefaultImages {
                    registration_operator: "quay.io/ocm/registration-operator:v1".to_string(),
                    registration: "quay.io/ocm/registration:v1".to_string(),
                    work: "quay.io/ocm/work:v1".to_string(),
                },
                pod_namespace: POD_NS.to_string(),
                ..Default::default()
            },
            Features::default(),
        )
    }

    fn ensured(name: &str) -> ManagedCluster {
        let mut c = ManagedCluster::new(name, Default::default());
        c.metadata.uid = Some(format!("{name}-uid"));
        c.metadata.labels = Some(btreemap! { labels::CLUSTER_NAME.to_string() => name.to_string() });
        c.metadata.annotations =
            Some(btreemap! { labels::CREATED_VIA.to_string() => labels::CREATED_VIA_OTHER.to_string() });
        c.metadata.finalizers = Some(vec![labels::IMPORT_FINALIZER.to_string()]);
        c
    }

    fn with_condition(mut c: ManagedCluster, type_: &str, status: bool) -> ManagedCluster {
        let status_ = c.status.get_or_insert_with(ManagedClusterStatus::default);
        status_.conditions.push(Condition::new(type_, status, "", ""));
        c
    }

    fn deleting(mut c: ManagedCluster) -> ManagedCluster {
        c.metadata.deletion_timestamp = time::from_utc(Utc::now());
        c
    }

    fn deployment(installed: bool) -> ClusterDeployment {
        ClusterDeployment::new(
            "c1",
            ClusterDeploymentSpec {
                cluster_name: "c1".to_string(),
                installed,
                cluster_metadata: Some(ClusterMetadata {
                    admin_kubeconfig_secret_ref: LocalObjectReference {
                        name: "c1-admin-kubeconfig".to_string(),
                    },
                    ..Default::default()
                }),
            },
        )
    }

    #[test]
    fn metadata_patch_only_when_needed() {
        let fresh = ManagedCluster::new("c1", Default::default());
        assert_eq!(
            metadata_patch(&fresh),
            Some(json!({
                "metadata": {
                    "labels": { (labels::CLUSTER_NAME): "c1" },
                    "annotations": { (labels::CREATED_VIA): "other" },
                    "finalizers": [labels::IMPORT_FINALIZER],
                }
            }))
        );
        assert_eq!(metadata_patch(&ensured("c1")), None);

        let mut hive = ensured("c1");
        hive.metadata.annotations =
            Some(btreemap! { labels::CREATED_VIA.to_string() => labels::CREATED_VIA_HIVE.to_string() });
        assert_eq!(metadata_patch(&hive), None, "recognized provenance is kept");

        let mut other = ensured("c1");
        other.metadata.finalizers = Some(vec!["someone-else".to_string()]);
        assert_eq!(
            metadata_patch(&other),
            Some(json!({
                "metadata": { "finalizers": ["someone-else", labels::IMPORT_FINALIZER] }
            }))
        );
    }

    #[test]
    fn source_priority() {
        let c = ensured("c1");
        assert_eq!(
            select_source(&c, Some(&deployment(true)), true),
            SourceDecision::Import(ImportSource::Provisioner {
                kubeconfig_secret: "c1-admin-kubeconfig".to_string()
            })
        );
        assert_eq!(
            select_source(&c, Some(&deployment(false)), true),
            SourceDecision::Requeue(PROVISIONER_REQUEUE)
        );
        assert_eq!(
            select_source(&c, None, true),
            SourceDecision::Import(ImportSource::AutoImport)
        );
        assert_eq!(select_source(&c, None, false), SourceDecision::Manual);

        let mut local = ensured("local-cluster");
        local
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(labels::SELF_MANAGED.to_string(), "true".to_string());
        assert_eq!(
            select_source(&local, None, false),
            SourceDecision::Import(ImportSource::SelfManaged)
        );
    }

    #[test]
    fn detach_decisions() {
        assert_eq!(detach_decision(&ensured("c1")), DetachDecision::NotDeleting);

        let mut released = deleting(ensured("c1"));
        released.metadata.finalizers = Some(vec![]);
        assert_eq!(detach_decision(&released), DetachDecision::Released);

        let mut shared = deleting(ensured("c1"));
        shared.metadata.finalizers = Some(vec![labels::IMPORT_FINALIZER.to_string(), "other".to_string()]);
        assert_eq!(detach_decision(&shared), DetachDecision::WaitForFinalizers);

        let mut accepted = deleting(ensured("c1"));
        accepted.spec.hub_accepts_client = true;
        assert_eq!(detach_decision(&accepted), DetachDecision::Cleanup { force: false });
        assert_eq!(
            detach_decision(&with_condition(accepted, CONDITION_AVAILABLE, false)),
            DetachDecision::Cleanup { force: true }
        );
        assert_eq!(
            detach_decision(&deleting(ensured("c1"))),
            DetachDecision::Cleanup { force: true },
            "not accepted"
        );
    }

    #[test]
    fn phases() {
        let fresh = ManagedCluster::new("c1", Default::default());
        assert_eq!(Phase::of(&fresh, false), Phase::New);
        assert_eq!(Phase::of(&ensured("c1"), false), Phase::MetadataEnsured);
        assert_eq!(Phase::of(&ensured("c1"), true), Phase::Importing);
        assert_eq!(
            Phase::of(&with_condition(ensured("c1"), CONDITION_JOINED, true), true),
            Phase::Imported
        );
        assert_eq!(Phase::of(&deleting(ensured("c1")), false), Phase::Detaching);
        let mut released = deleting(ensured("c1"));
        released.metadata.finalizers = None;
        assert_eq!(Phase::of(&released, false), Phase::NamespaceEligible);
    }

    #[tokio::test]
    async fn new_cluster_gets_metadata_and_an_import_secret() {
        let m = machine(ocp_topology(&cert_pem("root")), FakeHub::default());
        let fresh = ManagedCluster::new("c1", Default::default());
        let out = m.reconcile(&fresh, Utc::now()).await.unwrap();
        assert_eq!(out.phase, Phase::MetadataEnsured);
        assert_eq!(m.hub().patches.lock().len(), 1);

        let secret = m.hub().import_secrets.lock().get("c1").cloned().unwrap();
        let stored = secret.stored_kubeconfig().unwrap();
        assert!(!stored.kubeconfig.is_empty());
        assert!(stored.expiration.is_some(), "minted tokens expire");
        assert!(m.works().store().names().is_empty(), "no works before the agent joins");
    }

    #[tokio::test]
    async fn unchanged_inputs_do_not_rewrite_the_import_secret() {
        let m = machine(ocp_topology(&cert_pem("root")), FakeHub::default());
        let c = ensured("c1");
        let now = Utc::now();
        m.reconcile(&c, now).await.unwrap();
        let applies = m.hub().applies.get();
        let first = m.hub().import_secrets.lock().get("c1").cloned();

        m.reconcile(&c, now).await.unwrap();
        // Only the bootstrap RBAC is re-applied.
        assert_eq!(m.hub().applies.get(), applies + 1);
        assert_eq!(m.hub().import_secrets.lock().get("c1").cloned(), first);
    }

    #[tokio::test]
    async fn joined_cluster_receives_works_idempotently() {
        let m = machine(ocp_topology(&cert_pem("root")), FakeHub::default());
        let c = with_condition(ensured("c1"), CONDITION_JOINED, true);
        let now = Utc::now();

        let out = m.reconcile(&c, now).await.unwrap();
        assert_eq!(out.phase, Phase::Imported);
        assert_eq!(out.works, vec![Reconciled::Created, Reconciled::Created]);

        let out = m.reconcile(&c, now).await.unwrap();
        assert_eq!(out.works, vec![Reconciled::Unchanged, Reconciled::Unchanged]);
        assert_eq!(m.works().store().writes.get(), 2);
    }

    #[tokio::test]
    async fn unfinished_provisioner_requeues() {
        let hub = FakeHub {
            deployment: Some(deployment(false)),
            ..Default::default()
        };
        let m = machine(ocp_topology(&cert_pem("root")), hub);
        let out = m.reconcile(&ensured("c1"), Utc::now()).await.unwrap();
        assert_eq!(out.requeue_after, Some(PROVISIONER_REQUEUE));
        assert!(m.importer().applier().applied.lock().is_empty());
    }

    #[tokio::test]
    async fn provisioner_kubeconfig_imports_directly() {
        let mut topology = ocp_topology(&cert_pem("root"));
        topology.secrets.insert(
            ("c1".to_string(), "c1-admin-kubeconfig".to_string()),
            btreemap! { "kubeconfig".to_string() => b"admin".to_vec() },
        );
        let hub = FakeHub {
            deployment: Some(deployment(true)),
            ..Default::default()
        };
        let m = machine(topology, hub);
        let out = m.reconcile(&ensured("c1"), Utc::now()).await.unwrap();
        assert_eq!(out.phase, Phase::Imported);
        assert_eq!(out.import, Some("imported"));
        let applied = m.importer().applier().applied.lock().clone();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, Credentials::Kubeconfig(b"admin".to_vec()));
        assert!(m.hub().conditions.lock()[0].is_true());
    }

    #[tokio::test]
    async fn exhausted_auto_import_is_terminal() {
        let m = machine(ocp_topology(&cert_pem("root")), FakeHub::default());
        m.importer().secrets().secrets.lock().insert(
            "c1".to_string(),
            auto_import_secret(btreemap! { RETRY_KEY => "1", KUBECONFIG_KEY => "kc" }),
        );
        *m.importer().applier().fail.lock() = Some("connection refused".to_string());

        let out = m.reconcile(&ensured("c1"), Utc::now()).await.unwrap();
        assert_eq!(out.import, Some("exhausted"));
        assert_eq!(out.requeue_after, None);
        let conditions = m.hub().conditions.lock();
        assert_eq!(conditions.last().map(|c| c.reason.as_str()), Some(REASON_RETRY_EXHAUSTED));
    }

    fn import_and_sync(mut topology: FakeTopology) -> FakeTopology {
        topology.config_maps.insert(
            (POD_NS.to_string(), CONTROLLER_CONFIG.to_string()),
            btreemap! { STRATEGY_KEY.to_string() => "ImportAndSync".to_string() },
        );
        topology
    }

    fn with_auto_import_secret(m: &Machine) {
        m.importer().secrets().secrets.lock().insert(
            "c1".to_string(),
            auto_import_secret(btreemap! { KUBECONFIG_KEY => "kc" }),
        );
    }

    #[tokio::test]
    async fn synced_auto_import_skips_unchanged_manifests() {
        let m = machine(import_and_sync(ocp_topology(&cert_pem("root"))), FakeHub::default());
        with_auto_import_secret(&m);
        let now = Utc::now();

        let out = m.reconcile(&ensured("c1"), now).await.unwrap();
        assert_eq!(out.import, Some("imported"));
        assert_eq!(out.phase, Phase::Imported);

        let imported = with_condition(ensured("c1"), CONDITION_IMPORT_SUCCEEDED, true);
        for _ in 0..2 {
            let out = m.reconcile(&imported, now).await.unwrap();
            assert_eq!(out.import, None);
            assert_eq!(out.phase, Phase::Imported);
            assert_eq!(out.requeue_after, None);
        }
        assert_eq!(m.importer().applier().applied.lock().len(), 1);
        assert_eq!(m.hub().conditions.lock().len(), 1);
        assert!(m.importer().secrets().secrets.lock().contains_key("c1"), "secret kept");
    }

    #[tokio::test]
    async fn joined_cluster_keeps_syncing() {
        let m = machine(import_and_sync(ocp_topology(&cert_pem("root"))), FakeHub::default());
        with_auto_import_secret(&m);
        let c = with_condition(
            with_condition(ensured("c1"), CONDITION_JOINED, true),
            CONDITION_IMPORT_SUCCEEDED,
            true,
        );
        let now = Utc::now();

        let out = m.reconcile(&c, now).await.unwrap();
        assert_eq!(out.works, vec![Reconciled::Created, Reconciled::Created]);
        assert_eq!(out.import, Some("imported"), "never synced before");

        let out = m.reconcile(&c, now).await.unwrap();
        assert_eq!(out.import, None);
        assert_eq!(out.phase, Phase::Imported);
        assert_eq!(m.importer().applier().applied.lock().len(), 1);
    }

    #[tokio::test]
    async fn joined_cluster_ignores_import_only_secrets() {
        let m = machine(ocp_topology(&cert_pem("root")), FakeHub::default());
        with_auto_import_secret(&m);
        let c = with_condition(ensured("c1"), CONDITION_JOINED, true);
        let out = m.reconcile(&c, Utc::now()).await.unwrap();
        assert_eq!(out.import, None);
        assert!(m.importer().applier().applied.lock().is_empty());
    }

    #[tokio::test]
    async fn generated_manifests_follow_the_import_secret() {
        let m = machine(ocp_topology(&cert_pem("root")), FakeHub::default());
        assert!(m.generate_manifests("c1").await.unwrap_err().is_not_found());

        m.reconcile(&ensured("c1"), Utc::now()).await.unwrap();
        let yaml = String::from_utf8(m.generate_manifests("c1").await.unwrap()).unwrap();
        let docs = parse_yaml(yaml.as_bytes()).unwrap();
        assert_eq!(docs[0]["kind"], "CustomResourceDefinition");
        assert!(docs.iter().any(|d| d["metadata"]["name"] == "bootstrap-hub-kubeconfig"));
    }

    #[tokio::test]
    async fn hosted_mode_needs_the_feature() {
        let m = machine(ocp_topology(&cert_pem("root")), FakeHub::default());
        let mut c = ensured("c1");
        c.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(labels::KLUSTERLET_DEPLOY_MODE.to_string(), "Hosted".to_string());
        m.reconcile(&c, Utc::now()).await.unwrap();
        assert!(m.hub().import_secrets.lock().is_empty());
    }

    #[tokio::test]
    async fn detach_waits_for_addons_then_releases() {
        let hub = FakeHub {
            addons: Mutex::new(1),
            ..Default::default()
        };
        let m = machine(FakeTopology::default(), hub);
        let mut c = deleting(work_cluster("c1", Some(condition::TRUE)));
        c.spec.hub_accepts_client = true;
        c.metadata.finalizers = Some(vec![labels::IMPORT_FINALIZER.to_string()]);

        let out = m.reconcile(&c, Utc::now()).await.unwrap();
        assert_eq!(out.phase, Phase::Detaching);
        assert_eq!(out.requeue_after, Some(DETACH_REQUEUE));
        assert_eq!(m.hub().conditions.lock()[0].reason, REASON_DETACHING);
        assert!(m.hub().patches.lock().is_empty());

        let out = m.reconcile(&c, Utc::now()).await.unwrap();
        assert_eq!(out.phase, Phase::NamespaceEligible);
        assert_eq!(
            m.hub().patches.lock().last().cloned(),
            Some(json!({ "metadata": { "finalizers": [] } }))
        );
    }

    #[tokio::test]
    async fn detach_waits_for_other_finalizers() {
        let m = machine(FakeTopology::default(), FakeHub::default());
        let mut c = deleting(ensured("c1"));
        c.metadata.finalizers = Some(vec![labels::IMPORT_FINALIZER.to_string(), "other".to_string()]);
        let out = m.reconcile(&c, Utc::now()).await.unwrap();
        assert_eq!(out.phase, Phase::Detaching);
        assert_eq!(out.requeue_after, None);
        assert!(m.hub().conditions.lock().is_empty());
    }
}
