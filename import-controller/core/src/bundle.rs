//! Deterministic ordering and serialization of rendered manifests.

use crate::{
    bootstrap::StoredKubeconfig,
    k8s::{labels, ByteString, ObjectMeta, Secret},
    render::{RenderedManifests, BOOTSTRAP_HUB_KUBECONFIG},
    Error, Result, YAML_SEPARATOR,
};
use ring::digest;
use serde_json::Value;
use std::{collections::BTreeMap, fmt::Write};

pub const IMPORT_SECRET_CRDS_KEY: &str = "crds.yaml";
pub const IMPORT_SECRET_IMPORT_KEY: &str = "import.yaml";
pub const IMPORT_SECRET_EXPIRATION_KEY: &str = "expiration";

const AGENT_KIND: &str = "Klusterlet";

/// An ordered set of manifests: namespaces first, then everything else by
/// serialized form, then the agent CR, so the CRD defining it is applied
/// before it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bundle {
    manifests: Vec<Value>,
}

/// The hub-side `{cluster}-import` secret content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportSecret {
    pub crds_yaml: Vec<u8>,
    pub import_yaml: Vec<u8>,
    /// RFC 3339 expiry of the embedded bootstrap token; empty for tokens that
    /// do not expire.
    pub expiration: String,
}

// === impl Bundle ===

impl Bundle {
    pub fn new(objects: Vec<Value>) -> Result<Self> {
        let mut keyed = objects
            .into_iter()
            .map(|o| Ok((rank(&o), serialize(&o)?, o)))
            .collect::<Result<Vec<_>>>()?;
        keyed.sort_by(|(ra, sa, _), (rb, sb, _)| ra.cmp(rb).then_with(|| sa.cmp(sb)));
        Ok(Self {
            manifests: keyed.into_iter().map(|(_, _, o)| o).collect(),
        })
    }

    pub fn manifests(&self) -> &[Value] {
        &self.manifests
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn into_manifests(self) -> Vec<Value> {
        self.manifests
    }

    /// Concatenates the manifests as YAML documents.
    pub fn to_yaml(&self) -> Result<Vec<u8>> {
        let docs = self
            .manifests
            .iter()
            .map(serialize)
            .collect::<Result<Vec<_>>>()?;
        Ok(docs.join(YAML_SEPARATOR).into_bytes())
    }
}

fn rank(obj: &Value) -> u8 {
    match obj.get("kind").and_then(Value::as_str) {
        Some("Namespace") => 0,
        Some(AGENT_KIND) => 2,
        _ => 1,
    }
}

fn serialize(obj: &Value) -> Result<String> {
    serde_yaml::to_string(obj)
        .map(|s| s.trim_end().to_string())
        .map_err(|error| Error::malformed(format!("failed to encode manifest: {error}")))
}

// === impl ImportSecret ===

impl ImportSecret {
    pub fn from_manifests(rendered: RenderedManifests, expiration: String) -> Result<Self> {
        Ok(Self {
            crds_yaml: Bundle::new(rendered.crds)?.to_yaml()?,
            import_yaml: Bundle::new(rendered.objects)?.to_yaml()?,
            expiration,
        })
    }

    pub fn name(cluster: &str) -> String {
        format!("{cluster}-import")
    }

    pub fn to_secret(&self, cluster: &str) -> Secret {
        let data = BTreeMap::from([
            (
                IMPORT_SECRET_CRDS_KEY.to_string(),
                ByteString(self.crds_yaml.clone()),
            ),
            (
                IMPORT_SECRET_IMPORT_KEY.to_string(),
                ByteString(self.import_yaml.clone()),
            ),
            (
                IMPORT_SECRET_EXPIRATION_KEY.to_string(),
                ByteString(self.expiration.clone().into_bytes()),
            ),
        ]);
        Secret {
            metadata: ObjectMeta {
                name: Some(Self::name(cluster)),
                namespace: Some(cluster.to_string()),
                labels: Some(BTreeMap::from([(
                    labels::CLUSTER_NAME.to_string(),
                    cluster.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let get = |k: &str| data.get(k).map(|v| v.0.clone()).unwrap_or_default();
        Some(Self {
            crds_yaml: get(IMPORT_SECRET_CRDS_KEY),
            import_yaml: get(IMPORT_SECRET_IMPORT_KEY),
            expiration: String::from_utf8_lossy(&get(IMPORT_SECRET_EXPIRATION_KEY)).into_owned(),
        })
    }

    /// A short, stable fingerprint of the delivered manifests. The token
    /// expiry is left out; it changes only along with the kubeconfig.
    pub fn digest(&self) -> String {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&self.crds_yaml);
        ctx.update(YAML_SEPARATOR.as_bytes());
        ctx.update(&self.import_yaml);
        ctx.finish().as_ref()[..8]
            .iter()
            .fold(String::with_capacity(16), |mut s, b| {
                let _ = write!(s, "{b:02x}");
                s
            })
    }

    /// The bootstrap kubeconfig delivered by a previous render, if any.
    pub fn stored_kubeconfig(&self) -> Option<StoredKubeconfig> {
        let kubeconfig = parse_yaml(&self.import_yaml)
            .ok()?
            .into_iter()
            .filter(|o| o.get("kind").and_then(Value::as_str) == Some("Secret"))
            .filter_map(|o| serde_json::from_value::<Secret>(o).ok())
            .find(|s| s.metadata.name.as_deref() == Some(BOOTSTRAP_HUB_KUBECONFIG))?
            .data?
            .remove("kubeconfig")?;
        Some(StoredKubeconfig {
            kubeconfig: kubeconfig.0,
            expiration: Some(self.expiration.clone()).filter(|e| !e.is_empty()),
        })
    }
}

/// Splits concatenated YAML documents back into manifests, skipping empty
/// documents.
pub fn parse_yaml(data: &[u8]) -> Result<Vec<Value>> {
    let text = std::str::from_utf8(data)
        .map_err(|error| Error::malformed(format!("manifests are not UTF-8: {error}")))?;
    text.split(YAML_SEPARATOR)
        .flat_map(|chunk| chunk.split("\n---"))
        .map(|doc| doc.trim_start_matches("---").trim())
        .filter(|doc| !doc.is_empty())
        .map(|doc| {
            serde_yaml::from_str::<Value>(doc)
                .map_err(|error| Error::malformed(format!("invalid manifest: {error}")))
        })
        .filter(|v| !matches!(v, Ok(Value::Null)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn obj(kind: &str, name: &str) -> Value {
        json!({ "apiVersion": "v1", "kind": kind, "metadata": { "name": name } })
    }

    fn order(b: &Bundle) -> Vec<String> {
        b.manifests()
            .iter()
            .map(|o| {
                let kind = o["kind"].as_str().unwrap();
                format!("{kind}/{}", o["metadata"]["name"].as_str().unwrap())
            })
            .collect()
    }

    #[test]
    fn namespaces_first_agent_last() {
        let b = Bundle::new(vec![
            obj("Klusterlet", "klusterlet"),
            obj("Secret", "b"),
            obj("Namespace", "agent"),
            obj("ServiceAccount", "a"),
            obj("Secret", "a"),
        ])
        .unwrap();
        assert_eq!(
            order(&b),
            vec![
                "Namespace/agent",
                "Secret/a",
                "Secret/b",
                "ServiceAccount/a",
                "Klusterlet/klusterlet",
            ]
        );
    }

    #[test]
    fn ordering_is_input_independent() {
        let objects = vec![
            obj("ClusterRole", "x"),
            obj("Namespace", "n"),
            obj("Klusterlet", "k"),
            obj("Deployment", "d"),
        ];
        let mut reversed = objects.clone();
        reversed.reverse();
        let a = Bundle::new(objects).unwrap().to_yaml().unwrap();
        let b = Bundle::new(reversed).unwrap().to_yaml().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn yaml_round_trip() {
        let b = Bundle::new(vec![obj("Namespace", "n"), obj("Secret", "s")]).unwrap();
        let yaml = b.to_yaml().unwrap();
        let text = String::from_utf8(yaml.clone()).unwrap();
        assert_eq!(text.matches(YAML_SEPARATOR).count(), 1);
        assert_eq!(parse_yaml(&yaml).unwrap(), b.into_manifests());
    }

    #[test]
    fn empty_bundle() {
        let b = Bundle::new(vec![]).unwrap();
        assert!(b.is_empty());
        assert!(b.to_yaml().unwrap().is_empty());
        assert!(parse_yaml(b"").unwrap().is_empty());
    }

    #[test]
    fn import_secret_layout() {
        let secret = ImportSecret {
            crds_yaml: b"crds".to_vec(),
            import_yaml: b"import".to_vec(),
            expiration: "2025-01-01T00:00:00Z".to_string(),
        };
        let s = secret.to_secret("c1");
        assert_eq!(s.metadata.name.as_deref(), Some("c1-import"));
        assert_eq!(s.metadata.namespace.as_deref(), Some("c1"));
        assert_eq!(ImportSecret::from_secret(&s), Some(secret));
    }

    #[test]
    fn digest_tracks_manifest_content() {
        let secret = ImportSecret {
            crds_yaml: b"crds".to_vec(),
            import_yaml: b"import".to_vec(),
            expiration: "2025-01-01T00:00:00Z".to_string(),
        };
        let digest = secret.digest();
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));

        let renewed = ImportSecret {
            expiration: "2026-01-01T00:00:00Z".to_string(),
            ..secret.clone()
        };
        assert_eq!(renewed.digest(), digest);

        let changed = ImportSecret {
            import_yaml: b"import2".to_vec(),
            ..secret
        };
        assert_ne!(changed.digest(), digest);
    }

    #[test]
    fn stored_kubeconfig_is_recovered() {
        let bootstrap = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": BOOTSTRAP_HUB_KUBECONFIG, "namespace": "agent" },
            "data": { "kubeconfig": "a3ViZWNvbmZpZw==" },
        });
        let import_yaml = Bundle::new(vec![obj("Namespace", "agent"), bootstrap])
            .unwrap()
            .to_yaml()
            .unwrap();
        let secret = ImportSecret {
            import_yaml,
            expiration: "2025-01-01T00:00:00Z".to_string(),
            ..Default::default()
        };
        let stored = secret.stored_kubeconfig().unwrap();
        assert_eq!(stored.kubeconfig, b"kubeconfig");
        assert_eq!(stored.expiration.as_deref(), Some("2025-01-01T00:00:00Z"));

        assert!(ImportSecret::default().stored_kubeconfig().is_none());
    }
}
