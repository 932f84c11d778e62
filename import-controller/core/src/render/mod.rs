//! Renders the agent manifests for a managed cluster.
//!
//! A [`KlusterletManifestsConfig`] is built once per reconciliation through
//! `with_*` transformations and rendered against the hub's topology into a
//! CRD set and a core object set. Ordering is left to [`crate::bundle`].

mod images;
mod objects;
mod placement;
mod pull_secret;

pub use self::{
    images::{override_image, DefaultImages, ImageRegistries, Images},
    objects::{hub_bootstrap_rbac, klusterlet_crd, KLUSTERLET_OPERATOR, PRIORITY_CLASS},
    placement::{validate_node_selector, validate_tolerations},
    pull_secret::{DefaultPullSecret, PullSecret, IMAGE_PULL_SECRET_NAME},
};

use crate::{
    ca::HubTopology,
    k8s::{
        klusterlet_config::KlusterletConfigSpec,
        labels,
        operator::{
            BootstrapKubeConfigs, FeatureGate, KubeConfigSecret, NodePlacement,
            RegistrationConfiguration, WorkAgentConfiguration, BOOTSTRAP_KUBECONFIGS_LOCAL_SECRETS,
            FEATURE_GATE_ENABLE, FEATURE_MULTIPLE_HUBS,
        },
    },
    Error, Result,
};
use serde_json::Value;
use std::{collections::BTreeSet, fmt, str::FromStr, time::Duration};
use tracing::debug;

/// The bootstrap secret read by the agent on the managed cluster.
pub const BOOTSTRAP_HUB_KUBECONFIG: &str = "bootstrap-hub-kubeconfig";
/// In multi-hub mode, the secret that carries this hub's kubeconfig.
pub const CURRENT_HUB_KUBECONFIG: &str = "bootstrap-hub-kubeconfig-current-hub";

pub const DEFAULT_AGENT_NAMESPACE: &str = "open-cluster-management-agent";
const HOSTED_AGENT_NAMESPACE_PREFIX: &str = "open-cluster-management-";
const MAX_HOSTED_NAMESPACE_LEN: usize = 57;

const AGENT_ANNOTATION_PREFIX: &str = "agent.open-cluster-management.io/";

/// The eviction grace period that never evicts.
pub const EVICTION_GRACE_PERIOD_INFINITE: &str = "Infinite";
const HUNDRED_YEARS: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// How the agent is installed on the managed cluster.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum InstallMode {
    Default,
    #[default]
    Singleton,
    /// The agent runs on a hosting cluster; its namespace is managed there.
    Hosted,
    SingletonHosted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidInstallMode(String);

/// The immutable rendering input for one cluster.
#[derive(Clone, Debug, Default)]
pub struct KlusterletManifestsConfig {
    mode: InstallMode,
    cluster_name: String,
    bootstrap_kubeconfig: Vec<u8>,
    cluster_annotations: labels::Map,
    agent_cluster_annotations: labels::Map,
    self_managed: bool,
    priority_class_name: Option<String>,
    klusterlet_config: Option<KlusterletConfigSpec>,
    generate_image_pull_secret: bool,
}

/// Hub-wide rendering settings.
#[derive(Clone, Debug, Default)]
pub struct RenderSettings {
    pub images: DefaultImages,
    pub pull_secret: DefaultPullSecret,
    /// The controller's namespace. Holds its config map and, in multi-hub
    /// mode, the additional bootstrap kubeconfig secrets.
    pub pod_namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderedManifests {
    pub crds: Vec<Value>,
    pub objects: Vec<Value>,
}

#[derive(Clone, Debug)]
pub(crate) struct Values<'a> {
    mode: InstallMode,
    cluster_name: &'a str,
    klusterlet_name: String,
    agent_namespace: String,
    images: Images,
    placement: NodePlacement,
    priority_class_name: Option<&'a str>,
    pull_secret: Option<&'a PullSecret>,
    registration: RegistrationConfiguration,
    work: WorkAgentConfiguration,
}

// === impl InstallMode ===

impl InstallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::Singleton => "Singleton",
            Self::Hosted => "Hosted",
            Self::SingletonHosted => "SingletonHosted",
        }
    }

    pub fn is_hosted(&self) -> bool {
        matches!(self, Self::Hosted | Self::SingletonHosted)
    }

    /// Reads the deploy mode annotation; absent means `Singleton`.
    pub fn from_annotations(annotations: &labels::Map) -> Result<Self, InvalidInstallMode> {
        annotations
            .get(labels::KLUSTERLET_DEPLOY_MODE)
            .map(|m| m.parse())
            .unwrap_or(Ok(Self::Singleton))
    }
}

impl FromStr for InstallMode {
    type Err = InvalidInstallMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Default,
            Self::Singleton,
            Self::Hosted,
            Self::SingletonHosted,
        ]
        .into_iter()
        .find(|m| m.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| InvalidInstallMode(s.to_string()))
    }
}

impl fmt::Display for InstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for InvalidInstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid klusterlet install mode: {}", self.0)
    }
}

impl std::error::Error for InvalidInstallMode {}

impl From<InvalidInstallMode> for Error {
    fn from(e: InvalidInstallMode) -> Self {
        Error::malformed(e)
    }
}

// === impl KlusterletManifestsConfig ===

impl KlusterletManifestsConfig {
    pub fn new(mode: InstallMode, cluster_name: impl Into<String>, bootstrap_kubeconfig: Vec<u8>) -> Self {
        Self {
            mode,
            cluster_name: cluster_name.into(),
            bootstrap_kubeconfig,
            generate_image_pull_secret: true,
            ..Default::default()
        }
    }

    /// Takes the cluster's annotations (registry, placement, and namespace
    /// overrides) and its self-managed label.
    pub fn with_managed_cluster(self, annotations: labels::Map, self_managed: bool) -> Self {
        Self {
            cluster_annotations: annotations,
            self_managed,
            ..self
        }
    }

    /// Annotations the agent copies onto its cluster claim; only the agent
    /// prefix is kept.
    pub fn with_agent_cluster_annotations(self, annotations: &labels::Map) -> Self {
        let agent_cluster_annotations = annotations
            .iter()
            .filter(|(k, _)| k.starts_with(AGENT_ANNOTATION_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            agent_cluster_annotations,
            ..self
        }
    }

    pub fn with_klusterlet_config(self, config: Option<KlusterletConfigSpec>) -> Self {
        Self {
            klusterlet_config: config,
            ..self
        }
    }

    pub fn with_image_pull_secret(self, generate: bool) -> Self {
        Self {
            generate_image_pull_secret: generate,
            ..self
        }
    }

    pub fn with_priority_class(self, name: Option<String>) -> Self {
        Self {
            priority_class_name: name.filter(|n| !n.is_empty()),
            ..self
        }
    }

    pub fn mode(&self) -> InstallMode {
        self.mode
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Hosted agents and operator-less configs carry no operator.
    pub fn no_operator(&self) -> bool {
        self.mode.is_hosted() || self.no_operator_postfix().is_some()
    }

    fn no_operator_postfix(&self) -> Option<&str> {
        self.klusterlet_config
            .as_ref()
            .and_then(|c| c.no_operator_postfix())
    }

    /// The Klusterlet name and the namespace its agents run in.
    pub fn klusterlet_name_and_namespace(&self) -> (String, String) {
        let mut name = KLUSTERLET_OPERATOR.to_string();
        let mut ns = DEFAULT_AGENT_NAMESPACE.to_string();
        if self.mode.is_hosted() {
            name = format!("{KLUSTERLET_OPERATOR}-{}", self.cluster_name);
            ns = format!("{HOSTED_AGENT_NAMESPACE_PREFIX}{}", self.cluster_name);
            ns.truncate(MAX_HOSTED_NAMESPACE_LEN);
        }
        if let Some(v) = self.cluster_annotations.get(labels::KLUSTERLET_NAMESPACE) {
            ns = v.clone();
        }
        if let Some(postfix) = self.no_operator_postfix().filter(|p| !p.is_empty()) {
            name = format!("{KLUSTERLET_OPERATOR}-{postfix}");
            ns = format!("{HOSTED_AGENT_NAMESPACE_PREFIX}{postfix}");
        }
        (name, ns)
    }

    /// Renders the CRDs. Operator-less installs ship none.
    pub fn render_crds(&self) -> Result<Vec<Value>> {
        if self.no_operator() {
            return Ok(Vec::new());
        }
        Ok(vec![objects::to_value(&klusterlet_crd())?])
    }

    pub async fn render<T: HubTopology + ?Sized>(
        &self,
        topology: &T,
        settings: &RenderSettings,
    ) -> Result<RenderedManifests> {
        let hosted = self.mode.is_hosted();
        let config = self.klusterlet_config.as_ref();
        // Registry, placement, and pull secret overrides apply only when the
        // agent pulls its own images.
        let local = config.filter(|_| !hosted);

        let images = settings.images.resolve(
            local.map(|c| c.registries.as_slice()).unwrap_or_default(),
            &self.cluster_annotations,
        )?;
        let placement = placement::resolve(
            local.and_then(|c| c.node_placement.as_ref()),
            &self.cluster_annotations,
        )?;
        let work = work_configuration(config)?;
        let (klusterlet_name, agent_namespace) = self.klusterlet_name_and_namespace();

        let pull_secret = if self.generate_image_pull_secret {
            Some(
                pull_secret::resolve(
                    topology,
                    local.and_then(|c| c.pull_secret.as_ref()),
                    &self.cluster_annotations,
                    &settings.pull_secret,
                )
                .await?,
            )
        } else {
            None
        };

        let mut registration = RegistrationConfiguration {
            cluster_annotations: self.agent_cluster_annotations.clone(),
            ..Default::default()
        };
        let mut bootstrap_secrets = vec![(
            BOOTSTRAP_HUB_KUBECONFIG.to_string(),
            self.bootstrap_kubeconfig.clone(),
        )];
        if let Some(multi) = self.multiple_hubs() {
            debug!(cluster = %self.cluster_name, "Rendering multiple hub bootstrap kubeconfigs");
            let mut secrets = multi.local_secrets_config.clone().unwrap_or_default();
            secrets.kube_config_secrets.push(KubeConfigSecret {
                name: CURRENT_HUB_KUBECONFIG.to_string(),
            });
            secrets.kube_config_secrets = dedup_secrets(secrets.kube_config_secrets);

            for s in &secrets.kube_config_secrets {
                let kubeconfig = if s.name == CURRENT_HUB_KUBECONFIG {
                    self.bootstrap_kubeconfig.clone()
                } else {
                    hub_kubeconfig(topology, &settings.pod_namespace, &s.name).await?
                };
                bootstrap_secrets.push((s.name.clone(), kubeconfig));
            }

            registration.feature_gates.push(FeatureGate {
                feature: FEATURE_MULTIPLE_HUBS.to_string(),
                mode: FEATURE_GATE_ENABLE.to_string(),
            });
            registration.bootstrap_kube_configs = Some(BootstrapKubeConfigs {
                type_: multi.type_.clone(),
                local_secrets_config: Some(secrets),
            });
        }

        let values = Values {
            mode: self.mode,
            cluster_name: &self.cluster_name,
            klusterlet_name,
            agent_namespace,
            images,
            placement,
            priority_class_name: self.priority_class_name.as_deref(),
            pull_secret: pull_secret.as_ref(),
            registration,
            work,
        };

        let mut out = Vec::new();
        if !hosted {
            if values.priority_class_name == Some(PRIORITY_CLASS) {
                out.push(objects::to_value(&objects::priority_class())?);
            }
            out.push(objects::to_value(&objects::namespace(&values.agent_namespace))?);
            if !self.no_operator() {
                out.extend(objects::operator(&values)?);
            }
        }
        for (name, kubeconfig) in &bootstrap_secrets {
            let secret = objects::kubeconfig_secret(name, &values.agent_namespace, kubeconfig);
            out.push(objects::to_value(&secret)?);
        }
        if let Some(pull_secret) = values.pull_secret {
            let secret = objects::image_pull_secret(&values.agent_namespace, pull_secret);
            out.push(objects::to_value(&secret)?);
        }
        out.push(objects::to_value(&objects::klusterlet(&values))?);

        Ok(RenderedManifests {
            crds: self.render_crds()?,
            objects: out,
        })
    }

    /// Multi-hub bootstrap applies to every cluster but the hub itself.
    fn multiple_hubs(&self) -> Option<&BootstrapKubeConfigs> {
        if self.self_managed {
            return None;
        }
        self.klusterlet_config
            .as_ref()?
            .bootstrap_kube_configs
            .as_ref()
            .filter(|b| b.type_ == BOOTSTRAP_KUBECONFIGS_LOCAL_SECRETS)
    }
}

/// Keeps the first occurrence of each secret name.
fn dedup_secrets(secrets: Vec<KubeConfigSecret>) -> Vec<KubeConfigSecret> {
    let mut seen = BTreeSet::new();
    secrets
        .into_iter()
        .filter(|s| seen.insert(s.name.clone()))
        .collect()
}

async fn hub_kubeconfig<T: HubTopology + ?Sized>(
    topology: &T,
    ns: &str,
    name: &str,
) -> Result<Vec<u8>> {
    let data = topology
        .secret(ns, name)
        .await?
        .ok_or_else(|| Error::not_found("Secret", format!("{ns}/{name}")))?;
    data.get("kubeconfig")
        .cloned()
        .ok_or_else(|| Error::malformed(format!("kubeconfig key not found in secret {name}")))
}

fn work_configuration(config: Option<&KlusterletConfigSpec>) -> Result<WorkAgentConfiguration> {
    let period = config
        .map(|c| c.applied_manifest_work_eviction_grace_period.as_str())
        .unwrap_or_default();
    if period.is_empty() {
        return Ok(WorkAgentConfiguration::default());
    }
    let duration = if period == EVICTION_GRACE_PERIOD_INFINITE {
        HUNDRED_YEARS
    } else {
        parse_duration(period).map_err(|error| {
            Error::malformed(format!(
                "parse appliedManifestWorkEvictionGracePeriod {period} failed: {error}"
            ))
        })?
    };
    Ok(WorkAgentConfiguration {
        applied_manifest_work_eviction_grace_period: Some(format_duration(duration)),
    })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("invalid number")]
    NotANumber,

    #[error("negative durations are not allowed")]
    Negative,

    #[error("duration exceeds the agent's maximum")]
    Overflow,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

/// Go durations are signed 64-bit nanosecond counts.
const MAX_DURATION_NANOS: u64 = i64::MAX as u64;

/// Parses durations such as `90m`, `1h30m`, or `1.5h`, accumulating whole
/// nanoseconds. A leading sign is accepted but only zero may be negative.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let (negative, mut rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if rest.is_empty() {
        return Err(DurationError::Empty);
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }

    let mut nanos = 0u64;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (num, tail) = rest.split_at(num_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        if unit.is_empty() {
            return Err(DurationError::NoUnit);
        }
        let term = term_nanos(num, unit_nanos(unit)?)?;
        nanos = nanos
            .checked_add(term)
            .filter(|n| *n <= MAX_DURATION_NANOS)
            .ok_or(DurationError::Overflow)?;
        rest = tail;
    }

    if negative && nanos > 0 {
        return Err(DurationError::Negative);
    }
    Ok(Duration::from_nanos(nanos))
}

fn unit_nanos(unit: &str) -> Result<u64, DurationError> {
    const MICROS: u64 = 1_000;
    const MILLIS: u64 = 1_000 * MICROS;
    const SECS: u64 = 1_000 * MILLIS;
    match unit {
        "ns" => Ok(1),
        // U+00B5 is the micro sign, U+03BC the Greek letter mu.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(MICROS),
        "ms" => Ok(MILLIS),
        "s" => Ok(SECS),
        "m" => Ok(60 * SECS),
        "h" => Ok(3600 * SECS),
        _ => Err(DurationError::InvalidUnit),
    }
}

/// `num` units of `scale` nanoseconds. Fractional digits finer than a
/// nanosecond are dropped.
fn term_nanos(num: &str, scale: u64) -> Result<u64, DurationError> {
    let (whole, frac) = num.split_once('.').unwrap_or((num, ""));
    if (whole.is_empty() && frac.is_empty()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DurationError::NotANumber);
    }
    let whole = match whole {
        "" => 0,
        digits => digits
            .parse::<u64>()
            .map_err(|_| DurationError::Overflow)?,
    };
    let mut total = whole.checked_mul(scale).ok_or(DurationError::Overflow)?;
    let mut place = scale;
    for digit in frac.bytes() {
        place /= 10;
        if place == 0 {
            break;
        }
        total = total
            .checked_add(u64::from(digit - b'0') * place)
            .ok_or(DurationError::Overflow)?;
    }
    Ok(total)
}

/// Formats durations the way the agent prints them: `{h}h{m}m{s}s` from one
/// second up, dropping leading zero units, and a single sub-second unit
/// below that. Fractions keep their significant digits.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000_000_000 {
        let (unit, scale) = match nanos {
            n if n < 1_000 => ("ns", 1),
            n if n < 1_000_000 => ("\u{00b5}s", 1_000),
            _ => ("ms", 1_000_000),
        };
        return format!("{}{unit}", fraction(nanos, scale));
    }

    let secs = d.as_secs();
    let (h, m) = (secs / 3600, (secs / 60) % 60);
    let s = fraction(
        u128::from(secs % 60) * 1_000_000_000 + u128::from(d.subsec_nanos()),
        1_000_000_000,
    );
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, m) => format!("{m}m{s}s"),
        (h, m) => format!("{h}h{m}m{s}s"),
    }
}

/// `value / scale` in decimal, without trailing zeros.
fn fraction(value: u128, scale: u128) -> String {
    let (whole, rem) = (value / scale, value % scale);
    if rem == 0 {
        return whole.to_string();
    }
    let width = scale.ilog10() as usize;
    let digits = format!("{rem:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// Priority classes are served by every supported Kubernetes release from
/// 1.14 on.
pub fn supports_priority_class(kubernetes_version: &str) -> bool {
    let v = kubernetes_version.trim_start_matches('v');
    let mut parts = v.split(|c: char| !c.is_ascii_digit());
    let major = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minor = parts.next().and_then(|p| p.parse::<u32>().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => (major, minor) >= (1, 14),
        _ => false,
    }
}
