//! Node selector and toleration resolution for the agent workloads.

use crate::{
    k8s::{labels, operator::NodePlacement, Toleration},
    Error, Result,
};
use std::collections::BTreeMap;

const INFRA_TAINT: &str = "node-role.kubernetes.io/infra";
const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// Resolves placement from the KlusterletConfig when it sets a value, else
/// from the cluster annotations, and validates the result.
pub fn resolve(config: Option<&NodePlacement>, annotations: &labels::Map) -> Result<NodePlacement> {
    let node_selector = match config.filter(|p| !p.node_selector.is_empty()) {
        Some(p) => p.node_selector.clone(),
        None => annotated_node_selector(annotations)?,
    };
    validate_node_selector(&node_selector)?;

    let tolerations = match config.filter(|p| !p.tolerations.is_empty()) {
        Some(p) => p.tolerations.clone(),
        None => annotated_tolerations(annotations)?,
    };
    validate_tolerations(&tolerations)?;

    Ok(NodePlacement {
        node_selector,
        tolerations,
    })
}

fn annotated_node_selector(annotations: &labels::Map) -> Result<BTreeMap<String, String>> {
    let Some(json) = annotations.get(labels::NODE_SELECTOR) else {
        return Ok(BTreeMap::new());
    };
    serde_json::from_str(json)
        .map_err(|error| Error::malformed(format!("invalid nodeSelector annotation: {error}")))
}

/// Agents tolerate the infra taint unless the cluster says otherwise.
fn annotated_tolerations(annotations: &labels::Map) -> Result<Vec<Toleration>> {
    let Some(json) = annotations.get(labels::TOLERATIONS) else {
        return Ok(vec![Toleration {
            key: Some(INFRA_TAINT.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        }]);
    };
    serde_json::from_str(json)
        .map_err(|error| Error::malformed(format!("invalid tolerations annotation: {error}")))
}

pub fn validate_node_selector(selector: &BTreeMap<String, String>) -> Result<()> {
    let errors = selector
        .iter()
        .flat_map(|(k, v)| [check_qualified_name(k), check_label_value(v)])
        .flatten()
        .collect::<Vec<_>>();
    aggregate("nodeSelector", errors)
}

pub fn validate_tolerations(tolerations: &[Toleration]) -> Result<()> {
    let mut errors = Vec::new();
    for t in tolerations {
        let key = t.key.as_deref().unwrap_or_default();
        let op = t.operator.as_deref().unwrap_or_default();
        let value = t.value.as_deref().unwrap_or_default();
        let effect = t.effect.as_deref().unwrap_or_default();

        if !key.is_empty() {
            errors.extend(check_qualified_name(key));
        } else if op.is_empty() {
            errors.push(
                "operator must be Exists when `key` is empty, which means \"match all values and all keys\""
                    .to_string(),
            );
        }

        if t.toleration_seconds.is_some() && effect != "NoExecute" {
            errors.push("effect must be 'NoExecute' when `tolerationSeconds` is set".to_string());
        }

        match op {
            "Equal" | "" => errors.extend(check_label_value(value)),
            "Exists" if !value.is_empty() => {
                errors.push("value must be empty when `operator` is 'Exists'".to_string())
            }
            "Exists" => {}
            other => errors.push(format!("the operator {other:?} is not supported")),
        }

        if !matches!(effect, "" | "NoSchedule" | "PreferNoSchedule" | "NoExecute") {
            errors.push(format!("the effect {effect:?} is not supported"));
        }
    }
    aggregate("tolerations", errors)
}

fn aggregate(what: &str, errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    Err(Error::malformed(format!("invalid {what}: {}", errors.join("; "))))
}

fn check_qualified_name(key: &str) -> Option<String> {
    let (prefix, name) = match key.split_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN || !is_dns_subdomain(prefix) {
            return Some(format!("{key:?}: prefix must be a DNS subdomain"));
        }
    }
    if name.is_empty() || name.len() > MAX_NAME_LEN || !is_label_token(name) {
        return Some(format!(
            "{key:?}: name part must be at most 63 alphanumeric characters, '-', '_' or '.', starting and ending with an alphanumeric character"
        ));
    }
    None
}

fn check_label_value(value: &str) -> Option<String> {
    if value.is_empty() || (value.len() <= MAX_NAME_LEN && is_label_token(value)) {
        return None;
    }
    Some(format!(
        "{value:?}: a label value must be at most 63 alphanumeric characters, '-', '_' or '.', starting and ending with an alphanumeric character"
    ))
}

fn is_label_token(s: &str) -> bool {
    let bytes = s.as_bytes();
    let edge = |b: &u8| b.is_ascii_alphanumeric();
    bytes.first().is_some_and(edge)
        && bytes.last().is_some_and(edge)
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn is_dns_subdomain(s: &str) -> bool {
    s.split('.').all(|label| {
        let bytes = label.as_bytes();
        let edge = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        bytes.first().is_some_and(edge)
            && bytes.last().is_some_and(edge)
            && bytes.iter().all(|b| edge(b) || *b == b'-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn toleration(key: &str, op: &str, value: &str, effect: &str) -> Toleration {
        let opt = |s: &str| Some(s.to_string()).filter(|s| !s.is_empty());
        Toleration {
            key: opt(key),
            operator: opt(op),
            value: opt(value),
            effect: opt(effect),
            toleration_seconds: None,
        }
    }

    #[test]
    fn defaults_to_infra_toleration() {
        let placement = resolve(None, &Default::default()).unwrap();
        assert!(placement.node_selector.is_empty());
        assert_eq!(
            placement.tolerations,
            vec![toleration(INFRA_TAINT, "Exists", "", "NoSchedule")]
        );
    }

    #[test]
    fn config_wins_per_field() {
        let annotations = btreemap! {
            labels::NODE_SELECTOR.to_string() => r#"{"kubernetes.io/os":"linux"}"#.to_string(),
            labels::TOLERATIONS.to_string() =>
                r#"[{"key":"dedicated","operator":"Equal","value":"agents","effect":"NoSchedule"}]"#.to_string(),
        };
        let config = NodePlacement {
            node_selector: btreemap! { "zone".to_string() => "a".to_string() },
            tolerations: vec![],
        };
        let placement = resolve(Some(&config), &annotations).unwrap();
        assert_eq!(
            placement.node_selector,
            btreemap! { "zone".to_string() => "a".to_string() }
        );
        assert_eq!(
            placement.tolerations,
            vec![toleration("dedicated", "Equal", "agents", "NoSchedule")]
        );
    }

    #[rstest]
    #[case("kubernetes.io/os", "linux", true)]
    #[case("zone", "", true)]
    #[case("-bad", "x", false)]
    #[case("Example.com/os", "x", false)]
    #[case("os", "bad value", false)]
    #[case("/os", "x", false)]
    fn node_selectors(#[case] key: &str, #[case] value: &str, #[case] ok: bool) {
        let selector = btreemap! { key.to_string() => value.to_string() };
        assert_eq!(validate_node_selector(&selector).is_ok(), ok, "{key}={value}");
    }

    #[rstest]
    #[case(toleration("", "Exists", "", ""), true)]
    #[case(toleration("", "", "", ""), false)]
    #[case(toleration("k", "Exists", "v", ""), false)]
    #[case(toleration("k", "Gt", "1", ""), false)]
    #[case(toleration("k", "Equal", "v", "Sometimes"), false)]
    #[case(toleration("k", "", "v", "NoExecute"), true)]
    fn tolerations(#[case] t: Toleration, #[case] ok: bool) {
        assert_eq!(validate_tolerations(&[t.clone()]).is_ok(), ok, "{t:?}");
    }

    #[test]
    fn toleration_seconds_require_no_execute() {
        let mut t = toleration("k", "Exists", "", "NoSchedule");
        t.toleration_seconds = Some(30);
        assert!(validate_tolerations(&[t.clone()]).is_err());
        t.effect = Some("NoExecute".to_string());
        assert!(validate_tolerations(&[t]).is_ok());
    }

    #[test]
    fn invalid_annotation_json() {
        let annotations = btreemap! {
            labels::NODE_SELECTOR.to_string() => "[".to_string(),
        };
        assert!(matches!(resolve(None, &annotations), Err(Error::Malformed(_))));
    }
}
