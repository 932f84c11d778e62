//! Typed constructors for every object in the agent bundles.

use super::{pull_secret::PullSecret, Values};
use crate::{
    k8s::{
        api::{
            apps::v1::DeploymentSpec,
            core::v1::{Container, LocalObjectReference, PodSpec, PodTemplateSpec, SecurityContext},
            rbac::v1::{AggregationRule, PolicyRule, RoleRef, Subject},
            scheduling::v1::PriorityClass,
        },
        operator::{DeployOption, KlusterletSpec},
        ByteString, ClusterRole, ClusterRoleBinding, CustomResourceDefinition, Deployment,
        Klusterlet, Namespace, ObjectMeta, Secret, ServiceAccount,
    },
    Result,
};
use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
        CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
        CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps,
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const KLUSTERLET_OPERATOR: &str = "klusterlet";
pub const PRIORITY_CLASS: &str = "klusterlet-critical";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

pub(super) fn to_value(obj: &impl Serialize) -> Result<Value> {
    serde_json::to_value(obj)
        .map_err(|error| crate::Error::malformed(format!("failed to encode object: {error}")))
}

fn meta(name: &str, ns: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: ns.map(str::to_string),
        ..Default::default()
    }
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |s: &[&str]| s.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

fn binding(name: &str, role: &str, subject: Subject) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: meta(name, None),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![subject]),
    }
}

fn service_account_subject(name: &str, ns: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(ns.to_string()),
        ..Default::default()
    }
}

pub(super) fn priority_class() -> PriorityClass {
    PriorityClass {
        metadata: meta(PRIORITY_CLASS, None),
        value: 1_000_000,
        global_default: Some(false),
        preemption_policy: Some("PreemptLowerPriority".to_string()),
        description: Some("Used by the klusterlet agents on managed clusters".to_string()),
    }
}

pub(super) fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(BTreeMap::from([(
                "workload.openshift.io/allowed".to_string(),
                "management".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// The operator's service account, RBAC, and Deployment.
pub(super) fn operator(v: &Values<'_>) -> Result<Vec<Value>> {
    let ns = v.agent_namespace.as_str();
    let sa = ServiceAccount {
        metadata: meta(KLUSTERLET_OPERATOR, Some(ns)),
        image_pull_secrets: v
            .pull_secret
            .map(|_| vec![pull_secret_ref()]),
        ..Default::default()
    };

    let role = ClusterRole {
        metadata: meta(KLUSTERLET_OPERATOR, None),
        rules: Some(vec![
            rule(&[""], &["secrets", "configmaps", "serviceaccounts"], &["create", "get", "list", "update", "watch", "patch", "delete"]),
            rule(&[""], &["namespaces"], &["create", "get", "list", "watch", "delete"]),
            rule(&[""], &["nodes"], &["get", "list", "watch"]),
            rule(&["", "events.k8s.io"], &["events"], &["create", "patch", "update"]),
            rule(&["apps"], &["deployments"], &["create", "get", "list", "update", "watch", "patch", "delete"]),
            rule(&[RBAC_GROUP], &["clusterrolebindings", "rolebindings", "clusterroles", "roles"], &["create", "get", "list", "update", "watch", "patch", "delete", "escalate", "bind"]),
            rule(&["apiextensions.k8s.io"], &["customresourcedefinitions"], &["create", "get", "list", "update", "watch", "patch", "delete"]),
            rule(&["operator.open-cluster-management.io"], &["klusterlets", "klusterlets/status"], &["get", "list", "watch", "update", "patch", "delete"]),
            rule(&["work.open-cluster-management.io"], &["appliedmanifestworks"], &["list", "update", "patch"]),
        ]),
        ..Default::default()
    };

    let bootstrap_role_name = "open-cluster-management:klusterlet-bootstrap";
    let bootstrap_role = ClusterRole {
        metadata: meta(bootstrap_role_name, None),
        rules: Some(vec![
            rule(&["certificates.k8s.io"], &["certificatesigningrequests"], &["create", "get", "list", "watch"]),
            rule(&["cluster.open-cluster-management.io"], &["managedclusters"], &["get", "create"]),
        ]),
        ..Default::default()
    };

    let aggregate = ClusterRole {
        metadata: meta("open-cluster-management:klusterlet-admin-aggregate-clusterrole", None),
        aggregation_rule: Some(AggregationRule {
            cluster_role_selectors: Some(vec![LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "rbac.authorization.k8s.io/aggregate-to-admin".to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            }]),
        }),
        ..Default::default()
    };

    let subject = service_account_subject(KLUSTERLET_OPERATOR, ns);
    let role_binding = binding(KLUSTERLET_OPERATOR, KLUSTERLET_OPERATOR, subject.clone());
    let bootstrap_binding = binding(bootstrap_role_name, bootstrap_role_name, subject);

    Ok(vec![
        to_value(&sa)?,
        to_value(&role)?,
        to_value(&bootstrap_role)?,
        to_value(&aggregate)?,
        to_value(&role_binding)?,
        to_value(&bootstrap_binding)?,
        to_value(&operator_deployment(v))?,
    ])
}

fn pull_secret_ref() -> LocalObjectReference {
    LocalObjectReference {
        name: super::pull_secret::IMAGE_PULL_SECRET_NAME.to_string(),
    }
}

fn operator_deployment(v: &Values<'_>) -> Deployment {
    let labels = BTreeMap::from([("app".to_string(), KLUSTERLET_OPERATOR.to_string())]);
    let placement = &v.placement;
    Deployment {
        metadata: ObjectMeta {
            labels: Some(labels.clone()),
            ..meta(KLUSTERLET_OPERATOR, Some(&v.agent_namespace))
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(KLUSTERLET_OPERATOR.to_string()),
                    priority_class_name: v.priority_class_name.map(str::to_string),
                    node_selector: Some(placement.node_selector.clone())
                        .filter(|s| !s.is_empty()),
                    tolerations: Some(placement.tolerations.clone()).filter(|t| !t.is_empty()),
                    image_pull_secrets: v.pull_secret.map(|_| vec![pull_secret_ref()]),
                    containers: vec![Container {
                        name: "klusterlet".to_string(),
                        image: Some(v.images.registration_operator.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        args: Some(vec![
                            "/registration-operator".to_string(),
                            "klusterlet".to_string(),
                            "--disable-leader-election".to_string(),
                        ]),
                        security_context: Some(SecurityContext {
                            allow_privilege_escalation: Some(false),
                            read_only_root_filesystem: Some(true),
                            run_as_non_root: Some(true),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn kubeconfig_secret(name: &str, ns: &str, kubeconfig: &[u8]) -> Secret {
    Secret {
        metadata: meta(name, Some(ns)),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            "kubeconfig".to_string(),
            ByteString(kubeconfig.to_vec()),
        )])),
        ..Default::default()
    }
}

pub(super) fn image_pull_secret(ns: &str, secret: &PullSecret) -> Secret {
    Secret {
        metadata: meta(super::pull_secret::IMAGE_PULL_SECRET_NAME, Some(ns)),
        type_: Some(secret.type_.to_string()),
        data: Some(BTreeMap::from([(
            secret.key.to_string(),
            ByteString(secret.data.clone()),
        )])),
        ..Default::default()
    }
}

pub(super) fn klusterlet(v: &Values<'_>) -> Klusterlet {
    Klusterlet::new(
        &v.klusterlet_name,
        KlusterletSpec {
            cluster_name: v.cluster_name.to_string(),
            namespace: v.agent_namespace.clone(),
            deploy_option: DeployOption {
                mode: v.mode.as_str().to_string(),
            },
            registration_image_pull_spec: v.images.registration.clone(),
            work_image_pull_spec: v.images.work.clone(),
            image_pull_spec: v.images.registration_operator.clone(),
            node_placement: Some(v.placement.clone()),
            registration_configuration: Some(v.registration.clone()),
            work_configuration: Some(v.work.clone()),
            priority_class_name: v.priority_class_name.map(str::to_string),
        },
    )
}

/// The Klusterlet CRD the operator serves. The schema is left open; the
/// operator on the managed cluster owns validation.
pub fn klusterlet_crd() -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: meta("klusterlets.operator.open-cluster-management.io", None),
        spec: CustomResourceDefinitionSpec {
            group: "operator.open-cluster-management.io".to_string(),
            names: CustomResourceDefinitionNames {
                kind: "Klusterlet".to_string(),
                list_kind: Some("KlusterletList".to_string()),
                plural: "klusterlets".to_string(),
                singular: Some("klusterlet".to_string()),
                ..Default::default()
            },
            scope: "Cluster".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: "v1".to_string(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(JSONSchemaProps {
                        type_: Some("object".to_string()),
                        x_kubernetes_preserve_unknown_fields: Some(true),
                        ..Default::default()
                    }),
                }),
                subresources: Some(CustomResourceSubresources {
                    status: Some(CustomResourceSubresourceStatus(serde_json::json!({}))),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    }
}

/// The hub-side service account and RBAC the bootstrap token is scoped to.
pub fn hub_bootstrap_rbac(cluster: &str) -> Result<Vec<Value>> {
    let sa_name = crate::bootstrap::bootstrap_service_account_name(cluster);
    let role_name = format!("system:open-cluster-management:managedcluster:bootstrap:{cluster}");

    let sa = ServiceAccount {
        metadata: meta(&sa_name, Some(cluster)),
        ..Default::default()
    };
    let role = ClusterRole {
        metadata: meta(&role_name, None),
        rules: Some(vec![
            rule(&["certificates.k8s.io"], &["certificatesigningrequests"], &["create", "get", "list", "watch"]),
            rule(&["cluster.open-cluster-management.io"], &["managedclusters"], &["get", "create"]),
        ]),
        ..Default::default()
    };
    let role_binding = binding(&role_name, &role_name, service_account_subject(&sa_name, cluster));
    Ok(vec![to_value(&sa)?, to_value(&role)?, to_value(&role_binding)?])
}
