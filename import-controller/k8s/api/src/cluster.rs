use crate::condition::{self, Condition};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// The hub's record of a cluster to be attached.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "ManagedCluster",
    status = "ManagedClusterStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    #[serde(default)]
    pub hub_accepts_client: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_cluster_client_configs: Vec<ClientConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<k8s_openapi::ByteString>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub version: ManagedClusterVersion,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ManagedClusterVersion {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes: String,
}

/// Reported by the registration agent while its lease is renewed.
pub const CONDITION_AVAILABLE: &str = "ManagedClusterConditionAvailable";

/// Set once the registration agent's CSR is approved and it has joined.
pub const CONDITION_JOINED: &str = "ManagedClusterJoined";

/// Written by the import controller after an auto-import attempt.
pub const CONDITION_IMPORT_SUCCEEDED: &str = "ManagedClusterImportSucceeded";

// === impl ManagedCluster ===

impl ManagedCluster {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// `Available` is unknown or false, so the agent cannot be expected to
    /// act on delivered work.
    pub fn is_offline(&self) -> bool {
        match condition::find(self.conditions(), CONDITION_AVAILABLE) {
            Some(c) => !c.is_true(),
            None => false,
        }
    }

    pub fn is_joined(&self) -> bool {
        condition::is_true(self.conditions(), CONDITION_JOINED)
    }

    pub fn kubernetes_version(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.version.kubernetes.as_str())
            .unwrap_or_default()
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(status: Option<&str>) -> ManagedCluster {
        let mut c = ManagedCluster::new("c1", Default::default());
        c.status = status.map(|s| ManagedClusterStatus {
            conditions: vec![Condition {
                type_: CONDITION_AVAILABLE.to_string(),
                status: s.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        c
    }

    #[test]
    fn offline() {
        assert!(!cluster(None).is_offline(), "never reported");
        assert!(!cluster(Some(condition::TRUE)).is_offline());
        assert!(cluster(Some(condition::FALSE)).is_offline());
        assert!(cluster(Some(condition::UNKNOWN)).is_offline());
    }

    #[test]
    fn decodes_wire_form() {
        let c: ManagedCluster = serde_json::from_value(serde_json::json!({
            "apiVersion": "cluster.open-cluster-management.io/v1",
            "kind": "ManagedCluster",
            "metadata": { "name": "c1" },
            "spec": { "hubAcceptsClient": true },
            "status": {
                "conditions": [{
                    "type": CONDITION_IMPORT_SUCCEEDED,
                    "status": "True",
                    "reason": "ManagedClusterImported",
                    "message": "Import succeeded",
                    "lastTransitionTime": "2024-01-01T00:00:00Z"
                }]
            }
        }))
        .unwrap();
        assert!(c.spec.hub_accepts_client);
        assert!(condition::is_true(c.conditions(), CONDITION_IMPORT_SUCCEEDED));
    }
}
