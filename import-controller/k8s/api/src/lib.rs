#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod addon;
pub mod cluster;
pub mod condition;
pub mod hive;
pub mod klusterlet_config;
pub mod labels;
pub mod openshift;
pub mod operator;
pub mod work;

pub use self::{
    addon::ManagedClusterAddOn,
    cluster::{ManagedCluster, ManagedClusterSpec, ManagedClusterStatus},
    condition::Condition,
    hive::{ClusterDeployment, InfraEnv},
    klusterlet_config::KlusterletConfig,
    openshift::{APIServer, Infrastructure},
    operator::Klusterlet,
    work::ManifestWork,
};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::Deployment,
        authentication::v1::{TokenRequest, TokenRequestSpec},
        core::v1::{
            ConfigMap, Namespace, Node, Pod, PodStatus, Secret, ServiceAccount, Toleration,
        },
        rbac::v1::{ClusterRole, ClusterRoleBinding},
    },
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    ByteString,
};
pub use kube::{
    api::{Api, ObjectMeta, Resource, ResourceExt},
    Client, Error,
};

/// The name of the singleton cluster-scoped OpenShift config objects.
pub const OPENSHIFT_SINGLETON: &str = "cluster";
