//! Agent image selection and registry mirror rewriting.

use crate::{
    k8s::{klusterlet_config::Registry, labels},
    Error, Result,
};
use serde::Deserialize;

/// The hub's default component images.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DefaultImages {
    pub registration_operator: String,
    pub registration: String,
    pub work: String,
}

/// The images written into the rendered agent manifests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Images {
    pub registration_operator: String,
    pub registration: String,
    pub work: String,
}

/// The JSON document carried by the cluster's image registries annotation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistries {
    /// A `namespace.name` reference to a pull secret on the hub.
    #[serde(default)]
    pub pull_secret: String,
    #[serde(default)]
    pub registries: Vec<Registry>,
}

// === impl DefaultImages ===

impl DefaultImages {
    /// Applies the first non-empty override source: the KlusterletConfig
    /// mirror list, then the cluster annotation.
    pub fn resolve(
        &self,
        config_registries: &[Registry],
        annotations: &labels::Map,
    ) -> Result<Images> {
        let annotated = ImageRegistries::from_annotations(annotations)?;
        let registries = if config_registries.is_empty() {
            annotated.registries.as_slice()
        } else {
            config_registries
        };

        let pick = |name: &'static str, image: &str| -> Result<String> {
            if image.is_empty() {
                return Err(Error::malformed(format!("no default {name} image is configured")));
            }
            Ok(override_image(registries, image))
        };
        Ok(Images {
            registration_operator: pick("registration operator", &self.registration_operator)?,
            registration: pick("registration", &self.registration)?,
            work: pick("work", &self.work)?,
        })
    }
}

// === impl ImageRegistries ===

impl ImageRegistries {
    pub fn from_annotations(annotations: &labels::Map) -> Result<Self> {
        match annotations.get(labels::IMAGE_REGISTRIES) {
            None => Ok(Self::default()),
            Some(json) => serde_json::from_str(json).map_err(|error| {
                Error::malformed(format!(
                    "invalid {} annotation: {error}",
                    labels::IMAGE_REGISTRIES
                ))
            }),
        }
    }

    /// Splits the `namespace.name` pull secret reference.
    pub fn pull_secret_ref(&self) -> Result<Option<(&str, &str)>> {
        if self.pull_secret.is_empty() {
            return Ok(None);
        }
        match self.pull_secret.split('.').collect::<Vec<_>>().as_slice() {
            [ns, name] => Ok(Some((ns, name))),
            _ => Err(Error::malformed(format!(
                "wrong pullSecret format {} in the {} annotation",
                self.pull_secret,
                labels::IMAGE_REGISTRIES
            ))),
        }
    }
}

/// Rewrites `image` through each registry in order; the last matching
/// registry wins.
pub fn override_image(registries: &[Registry], image: &str) -> String {
    let mut out = image.to_string();
    for r in registries {
        let candidate = mirror_image(&r.source, &r.mirror, image);
        if candidate != image {
            out = candidate;
        }
    }
    out
}

fn mirror_image(source: &str, mirror: &str, image: &str) -> String {
    let source = source.trim_end_matches('/');
    let mirror = mirror.trim_end_matches('/');
    if source.is_empty() {
        let name_tag = image.rsplit('/').next().unwrap_or(image);
        if mirror.is_empty() {
            return name_tag.to_string();
        }
        return format!("{mirror}/{name_tag}");
    }
    match image.strip_prefix(source) {
        Some(rest) => format!("{mirror}{rest}"),
        None => image.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn registry(source: &str, mirror: &str) -> Registry {
        Registry {
            source: source.to_string(),
            mirror: mirror.to_string(),
        }
    }

    #[rstest]
    #[case("quay.io/ocm/registration:v1", "quay.io/ocm", "mirror.local/ocm", "mirror.local/ocm/registration:v1")]
    #[case("quay.io/ocm/registration:v1", "quay.io/ocm/", "mirror.local/ocm/", "mirror.local/ocm/registration:v1")]
    #[case("quay.io/ocm/registration:v1", "", "mirror.local", "mirror.local/registration:v1")]
    #[case("quay.io/ocm/registration:v1", "", "", "registration:v1")]
    #[case("quay.io/ocm/registration:v1", "docker.io", "mirror.local", "quay.io/ocm/registration:v1")]
    fn mirrors(
        #[case] image: &str,
        #[case] source: &str,
        #[case] mirror: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(mirror_image(source, mirror, image), expected);
    }

    #[test]
    fn last_matching_registry_wins() {
        let registries = vec![
            registry("quay.io/ocm", "first.local/ocm"),
            registry("docker.io", "ignored.local"),
            registry("quay.io/ocm", "second.local/ocm"),
        ];
        assert_eq!(
            override_image(&registries, "quay.io/ocm/work:v1"),
            "second.local/ocm/work:v1"
        );
    }

    fn defaults() -> DefaultImages {
        DefaultImages {
            registration_operator: "quay.io/ocm/registration-operator:v1".to_string(),
            registration: "quay.io/ocm/registration:v1".to_string(),
            work: "quay.io/ocm/work:v1".to_string(),
        }
    }

    #[test]
    fn config_registries_win_over_annotation() {
        let annotations = btreemap! {
            labels::IMAGE_REGISTRIES.to_string() =>
                r#"{"registries":[{"source":"quay.io/ocm","mirror":"annotated.local"}]}"#.to_string(),
        };
        let images = defaults()
            .resolve(&[registry("quay.io/ocm", "config.local")], &annotations)
            .unwrap();
        assert_eq!(images.work, "config.local/work:v1");

        let images = defaults().resolve(&[], &annotations).unwrap();
        assert_eq!(images.work, "annotated.local/work:v1");
        assert_eq!(images.registration_operator, "annotated.local/registration-operator:v1");

        let images = defaults().resolve(&[], &Default::default()).unwrap();
        assert_eq!(images.registration, "quay.io/ocm/registration:v1");
    }

    #[test]
    fn missing_default_image() {
        let mut d = defaults();
        d.work.clear();
        assert!(matches!(
            d.resolve(&[], &Default::default()),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn pull_secret_reference() {
        let regs = ImageRegistries {
            pull_secret: "ns1.pull".to_string(),
            ..Default::default()
        };
        assert_eq!(regs.pull_secret_ref().unwrap(), Some(("ns1", "pull")));

        let regs = ImageRegistries {
            pull_secret: "a.b.c".to_string(),
            ..Default::default()
        };
        assert!(regs.pull_secret_ref().is_err());
        assert_eq!(ImageRegistries::default().pull_secret_ref().unwrap(), None);
    }

    #[test]
    fn invalid_annotation() {
        let annotations = btreemap! {
            labels::IMAGE_REGISTRIES.to_string() => "{".to_string(),
        };
        assert!(ImageRegistries::from_annotations(&annotations).is_err());
    }
}
