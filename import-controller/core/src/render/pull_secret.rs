//! Resolves the image pull credentials shipped to the managed cluster.

use super::images::ImageRegistries;
use crate::{
    ca::HubTopology,
    k8s::{klusterlet_config::ObjectReference, labels},
    Error, Result,
};
use std::collections::BTreeMap;
use tracing::debug;

/// The secret name on the managed cluster.
pub const IMAGE_PULL_SECRET_NAME: &str = "open-cluster-management-image-pull-credentials";

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_KEY: &str = ".dockercfg";
const DOCKER_CONFIG_TYPE: &str = "kubernetes.io/dockercfg";

/// Where the controller falls back to when nothing more specific is set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DefaultPullSecret {
    pub namespace: String,
    /// Empty when the hub has no default pull secret.
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullSecret {
    pub type_: &'static str,
    pub key: &'static str,
    pub data: Vec<u8>,
}

/// Reads the pull secret referenced by the KlusterletConfig, else by the
/// registries annotation, else the hub default.
pub async fn resolve<T: HubTopology + ?Sized>(
    topology: &T,
    config_ref: Option<&ObjectReference>,
    annotations: &labels::Map,
    default: &DefaultPullSecret,
) -> Result<PullSecret> {
    if let Some(r) = config_ref.filter(|r| !r.name.is_empty()) {
        return read(topology, &r.namespace, &r.name).await;
    }

    let registries = ImageRegistries::from_annotations(annotations)?;
    if let Some((ns, name)) = registries.pull_secret_ref()? {
        return read(topology, ns, name).await;
    }

    if default.name.is_empty() {
        debug!("No default image pull secret; shipping an empty docker config");
        return Ok(PullSecret {
            type_: DOCKER_CONFIG_JSON_TYPE,
            key: DOCKER_CONFIG_JSON_KEY,
            data: b"{}".to_vec(),
        });
    }
    read(topology, &default.namespace, &default.name).await
}

async fn read<T: HubTopology + ?Sized>(topology: &T, ns: &str, name: &str) -> Result<PullSecret> {
    let data = topology
        .secret(ns, name)
        .await?
        .ok_or_else(|| Error::not_found("Secret", format!("{ns}/{name}")))?;
    from_data(&data)
        .ok_or_else(|| Error::malformed(format!("pull secret {ns}/{name} has no docker config")))
}

fn from_data(data: &BTreeMap<String, Vec<u8>>) -> Option<PullSecret> {
    let nonempty = |k: &str| data.get(k).filter(|v| !v.is_empty()).cloned();
    if let Some(data) = nonempty(DOCKER_CONFIG_JSON_KEY) {
        return Some(PullSecret {
            type_: DOCKER_CONFIG_JSON_TYPE,
            key: DOCKER_CONFIG_JSON_KEY,
            data,
        });
    }
    nonempty(DOCKER_CONFIG_KEY).map(|data| PullSecret {
        type_: DOCKER_CONFIG_TYPE,
        key: DOCKER_CONFIG_KEY,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::tests::FakeTopology;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn topology() -> FakeTopology {
        FakeTopology {
            secrets: btreemap! {
                ("hub".to_string(), "default-pull".to_string()) => btreemap! {
                    DOCKER_CONFIG_JSON_KEY.to_string() => b"{\"auths\":{}}".to_vec(),
                },
                ("ns1".to_string(), "annotated".to_string()) => btreemap! {
                    DOCKER_CONFIG_KEY.to_string() => b"{\"legacy\":{}}".to_vec(),
                },
                ("ns2".to_string(), "configured".to_string()) => btreemap! {
                    DOCKER_CONFIG_JSON_KEY.to_string() => b"{\"configured\":{}}".to_vec(),
                },
                ("ns2".to_string(), "empty".to_string()) => btreemap! {
                    DOCKER_CONFIG_JSON_KEY.to_string() => Vec::new(),
                },
            },
            ..Default::default()
        }
    }

    fn default_secret(name: &str) -> DefaultPullSecret {
        DefaultPullSecret {
            namespace: "hub".to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn source_precedence() {
        let topo = topology();
        let annotations = btreemap! {
            labels::IMAGE_REGISTRIES.to_string() => r#"{"pullSecret":"ns1.annotated"}"#.to_string(),
        };
        let configured = ObjectReference {
            name: "configured".to_string(),
            namespace: "ns2".to_string(),
        };

        let s = resolve(&topo, Some(&configured), &annotations, &default_secret("default-pull"))
            .await
            .unwrap();
        assert_eq!(s.data, b"{\"configured\":{}}");

        let s = resolve(&topo, None, &annotations, &default_secret("default-pull"))
            .await
            .unwrap();
        assert_eq!((s.type_, s.key), (DOCKER_CONFIG_TYPE, DOCKER_CONFIG_KEY));

        let s = resolve(&topo, None, &Default::default(), &default_secret("default-pull"))
            .await
            .unwrap();
        assert_eq!(s.type_, DOCKER_CONFIG_JSON_TYPE);
    }

    #[tokio::test]
    async fn empty_config_without_default() {
        let s = resolve(&topology(), None, &Default::default(), &default_secret(""))
            .await
            .unwrap();
        assert_eq!(s.data, b"{}");
    }

    #[tokio::test]
    async fn missing_or_empty_secret_fails() {
        let topo = topology();
        let err = resolve(&topo, None, &Default::default(), &default_secret("absent"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let empty = ObjectReference {
            name: "empty".to_string(),
            namespace: "ns2".to_string(),
        };
        let err = resolve(&topo, Some(&empty), &Default::default(), &default_secret(""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }
}
