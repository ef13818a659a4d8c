//! Node eligibility predicates
//!
//! Decides whether a daemon pod built from a template may run on a node:
//! template `nodeSelector`, required node affinity and NoSchedule/NoExecute
//! taint toleration. Also hosts label selector evaluation shared by the
//! node listing, canary selection and the setting reconciler.

use k8s_openapi::api::core::v1::{Node, NodeSelectorRequirement, NodeSelectorTerm, PodSpec, Taint, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;

/// Field key accepted by node affinity `matchFields`
pub const NODE_NAME_FIELD: &str = "metadata.name";

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

pub fn node_labels(node: &Node) -> BTreeMap<String, String> {
    node.metadata.labels.clone().unwrap_or_default()
}

/// Evaluate a label selector against a label set
///
/// An empty selector matches everything.
///
/// # Returns
/// * `Err(String)` - The selector uses an unknown operator or malformed values
pub fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool, String> {
    validate_selector(selector)?;

    if let Some(match_labels) = &selector.match_labels {
        if match_labels.iter().any(|(k, v)| labels.get(k) != Some(v)) {
            return Ok(false);
        }
    }

    let mut matched = true;
    for expr in selector.match_expressions.as_deref().unwrap_or_default() {
        matched &= expression_matches(expr, labels)?;
    }
    Ok(matched)
}

/// Check a label selector is well formed
pub fn validate_selector(selector: &LabelSelector) -> Result<(), String> {
    validate_expressions(selector.match_expressions.as_deref().unwrap_or_default())
}

fn validate_expressions(exprs: &[LabelSelectorRequirement]) -> Result<(), String> {
    for expr in exprs {
        expression_matches(expr, &BTreeMap::new())?;
    }
    Ok(())
}

fn expression_matches(
    expr: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, String> {
    let values = expr.values.as_deref().unwrap_or_default();
    let current = labels.get(&expr.key);
    match expr.operator.as_str() {
        "In" => {
            if values.is_empty() {
                return Err(format!("operator In on key {} requires values", expr.key));
            }
            Ok(current.map(|v| values.contains(v)).unwrap_or(false))
        }
        "NotIn" => {
            if values.is_empty() {
                return Err(format!("operator NotIn on key {} requires values", expr.key));
            }
            Ok(current.map(|v| !values.contains(v)).unwrap_or(true))
        }
        "Exists" => Ok(current.is_some()),
        "DoesNotExist" => Ok(current.is_none()),
        other => Err(format!("{:?} is not a valid label selector operator", other)),
    }
}

/// Whether a daemon pod with this spec may run on the node
pub fn check_node_fitness(spec: &PodSpec, node: &Node) -> bool {
    node_selector_matches(spec, node) && tolerates_node_taints(spec, node)
}

fn node_selector_matches(spec: &PodSpec, node: &Node) -> bool {
    let labels = node_labels(node);

    if let Some(node_selector) = &spec.node_selector {
        if node_selector.iter().any(|(k, v)| labels.get(k) != Some(v)) {
            return false;
        }
    }

    let required = spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref());

    match required {
        None => true,
        Some(selector) => node_selector_terms_match(&selector.node_selector_terms, node),
    }
}

/// Terms are ORed; an empty term selects nothing
pub fn node_selector_terms_match(terms: &[NodeSelectorTerm], node: &Node) -> bool {
    let labels = node_labels(node);
    let name = node_name(node);

    terms.iter().any(|term| {
        let exprs = term.match_expressions.as_deref().unwrap_or_default();
        let fields = term.match_fields.as_deref().unwrap_or_default();
        if exprs.is_empty() && fields.is_empty() {
            return false;
        }
        exprs
            .iter()
            .all(|req| node_requirement_matches(req, &labels).unwrap_or(false))
            && fields
                .iter()
                .all(|req| field_requirement_matches(req, name).unwrap_or(false))
    })
}

fn node_requirement_matches(
    req: &NodeSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, String> {
    let values = req.values.as_deref().unwrap_or_default();
    let current = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => Ok(current.map(|v| values.contains(v)).unwrap_or(false)),
        "NotIn" => Ok(current.map(|v| !values.contains(v)).unwrap_or(true)),
        "Exists" => Ok(current.is_some()),
        "DoesNotExist" => Ok(current.is_none()),
        "Gt" | "Lt" => {
            let [bound] = values else {
                return Err(format!("operator {} requires a single value", req.operator));
            };
            let bound: i64 = bound.parse().map_err(|_| format!("invalid bound {}", bound))?;
            let Some(current) = current.and_then(|v| v.parse::<i64>().ok()) else {
                return Ok(false);
            };
            Ok(if req.operator == "Gt" {
                current > bound
            } else {
                current < bound
            })
        }
        other => Err(format!("{:?} is not a valid node selector operator", other)),
    }
}

fn field_requirement_matches(req: &NodeSelectorRequirement, node_name: &str) -> Result<bool, String> {
    if req.key != NODE_NAME_FIELD {
        return Err(format!("unsupported node field {}", req.key));
    }
    let [value] = req.values.as_deref().unwrap_or_default() else {
        return Err(format!("node field operator {} requires a single value", req.operator));
    };
    match req.operator.as_str() {
        "In" => Ok(node_name == value.as_str()),
        "NotIn" => Ok(node_name != value.as_str()),
        other => Err(format!("{:?} is not a valid node field selector operator", other)),
    }
}

fn tolerates_node_taints(spec: &PodSpec, node: &Node) -> bool {
    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or_default();
    let tolerations = spec.tolerations.as_deref().unwrap_or_default();

    taints
        .iter()
        .filter(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
        .all(|taint| tolerations.iter().any(|tol| tolerates(tol, taint)))
}

/// Kubernetes toleration semantics for a single taint
pub fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref().filter(|e| !e.is_empty()) {
        if effect != taint.effect {
            return false;
        }
    }

    if let Some(key) = toleration.key.as_deref().filter(|k| !k.is_empty()) {
        if key != taint.key {
            return false;
        }
    }

    match toleration.operator.as_deref().unwrap_or("Equal") {
        "Exists" => true,
        "Equal" | "" => toleration.value.as_deref().unwrap_or_default()
            == taint.value.as_deref().unwrap_or_default(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(yaml: &str) -> Node {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn pod_spec(yaml: &str) -> PodSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_match_labels_and_expressions() {
        let selector: LabelSelector = serde_yaml::from_str(
            r#"
matchLabels:
  pool: general
matchExpressions:
- key: zone
  operator: In
  values: [a, b]
- key: gpu
  operator: DoesNotExist
"#,
        )
        .unwrap();

        assert_eq!(
            selector_matches(&selector, &labels(&[("pool", "general"), ("zone", "a")])),
            Ok(true)
        );
        assert_eq!(
            selector_matches(&selector, &labels(&[("pool", "general"), ("zone", "c")])),
            Ok(false)
        );
        assert_eq!(
            selector_matches(
                &selector,
                &labels(&[("pool", "general"), ("zone", "a"), ("gpu", "1")])
            ),
            Ok(false)
        );
    }

    #[test]
    fn test_selector_invalid_operator_is_error() {
        let selector: LabelSelector = serde_yaml::from_str(
            r#"
matchExpressions:
- key: zone
  operator: Near
"#,
        )
        .unwrap();

        assert!(selector_matches(&selector, &BTreeMap::new()).is_err());
        assert!(validate_selector(&selector).is_err());
    }

    #[test]
    fn test_empty_selector_matches_all() {
        assert_eq!(
            selector_matches(&LabelSelector::default(), &labels(&[("a", "b")])),
            Ok(true)
        );
    }

    #[test]
    fn test_fitness_respects_node_selector() {
        let spec = pod_spec(
            r#"
containers: [{name: agent}]
nodeSelector:
  kubernetes.io/os: linux
"#,
        );
        let linux = node("metadata: {name: n1, labels: {kubernetes.io/os: linux}}");
        let windows = node("metadata: {name: n2, labels: {kubernetes.io/os: windows}}");

        assert!(check_node_fitness(&spec, &linux));
        assert!(!check_node_fitness(&spec, &windows));
    }

    #[test]
    fn test_fitness_required_affinity_by_name_and_gt() {
        let spec = pod_spec(
            r#"
containers: [{name: agent}]
affinity:
  nodeAffinity:
    requiredDuringSchedulingIgnoredDuringExecution:
      nodeSelectorTerms:
      - matchFields:
        - key: metadata.name
          operator: In
          values: [n1]
      - matchExpressions:
        - key: cores
          operator: Gt
          values: ["8"]
"#,
        );

        assert!(check_node_fitness(&spec, &node("metadata: {name: n1}")));
        assert!(check_node_fitness(
            &spec,
            &node("metadata: {name: n2, labels: {cores: '16'}}")
        ));
        assert!(!check_node_fitness(
            &spec,
            &node("metadata: {name: n3, labels: {cores: '4'}}")
        ));
    }

    #[test]
    fn test_fitness_taints_need_toleration() {
        let tainted = node(
            r#"
metadata: {name: n1}
spec:
  taints:
  - key: dedicated
    value: db
    effect: NoSchedule
  - key: soft
    effect: PreferNoSchedule
"#,
        );
        let plain = pod_spec("containers: [{name: agent}]");
        let tolerant = pod_spec(
            r#"
containers: [{name: agent}]
tolerations:
- key: dedicated
  operator: Equal
  value: db
  effect: NoSchedule
"#,
        );
        let tolerate_all = pod_spec(
            r#"
containers: [{name: agent}]
tolerations:
- operator: Exists
"#,
        );

        assert!(!check_node_fitness(&plain, &tainted));
        assert!(check_node_fitness(&tolerant, &tainted));
        assert!(check_node_fitness(&tolerate_all, &tainted));
    }
}
