//! Label, annotation, and finalizer keys shared by the hub-side resources
//! the import controller reads and writes.

use std::collections::BTreeMap;

pub type Map = BTreeMap<String, String>;

/// Set on a ManagedCluster (and its namespace) to record the cluster name.
pub const CLUSTER_NAME: &str = "open-cluster-management.io/cluster-name";

/// The older namespace label still written by some provisioners.
pub const LEGACY_CLUSTER_NAME: &str = "cluster.open-cluster-management.io/managedCluster";

/// Marks the hub itself registered as a managed cluster.
pub const SELF_MANAGED: &str = "local-cluster";

pub const CREATED_VIA: &str = "open-cluster-management/created-via";
pub const CREATED_VIA_HIVE: &str = "hive";
pub const CREATED_VIA_ASSISTED_INSTALLER: &str = "assisted-installer";
pub const CREATED_VIA_DISCOVERY: &str = "discovery";
pub const CREATED_VIA_OTHER: &str = "other";

pub const IMPORT_FINALIZER: &str =
    "managedcluster-import-controller.open-cluster-management.io/cleanup";

pub const RETAIN_NAMESPACE: &str = "open-cluster-management.io/retain-namespace";

pub const POSTPONE_DELETE: &str = "open-cluster-management/postpone-delete";

pub const IMAGE_REGISTRIES: &str = "open-cluster-management.io/image-registries";
pub const NODE_SELECTOR: &str = "open-cluster-management/nodeSelector";
pub const TOLERATIONS: &str = "open-cluster-management/tolerations";
pub const KLUSTERLET_CONFIG: &str = "agent.open-cluster-management.io/klusterlet-config";
pub const KLUSTERLET_NAMESPACE: &str = "agent.open-cluster-management.io/klusterlet-namespace";

/// Selects the agent install mode; absent means `Singleton`.
pub const KLUSTERLET_DEPLOY_MODE: &str = "import.open-cluster-management.io/klusterlet-deploy-mode";
pub const HOSTING_CLUSTER_NAME: &str = "import.open-cluster-management.io/hosting-cluster-name";

/// Stops the controller from importing a cluster that already has an
/// auto-import secret.
pub const DISABLE_AUTO_IMPORT: &str = "import.open-cluster-management.io/disable-auto-import";

/// Set on a kept auto-import secret to the digest of the manifests last
/// applied with it.
pub const AUTO_IMPORT_SYNCED: &str = "import.open-cluster-management.io/auto-import-synced";

/// Records which controller last wrote an object, used to scope list calls.
pub const MANAGED_BY: &str = "import.open-cluster-management.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "import-controller";

/// Returns `true` when the given labels mark a self-managed (hub) cluster.
pub fn is_self_managed(labels: &Map) -> bool {
    labels
        .get(SELF_MANAGED)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Returns the cluster name a namespace is labeled for, if any.
pub fn cluster_namespace_name(labels: &Map) -> Option<&str> {
    [CLUSTER_NAME, LEGACY_CLUSTER_NAME]
        .into_iter()
        .filter_map(|k| labels.get(k))
        .map(String::as_str)
        .find(|v| !v.is_empty())
}
