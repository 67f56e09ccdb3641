//! Node matcher: selects which instances feed a given request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::instances::{Instance, InstanceStore};

/// Matching configuration, sourced from the `matching` config block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub enabled: bool,
    pub source_key: String,
    pub node_key: String,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { enabled: false, source_key: "service_clusters".to_string(), node_key: "cluster".to_string() }
    }
}

/// Extract a value from nested JSON via a dotted path, e.g. `"a.b.c"`.
pub fn extract_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

fn contains_wildcard(value: &Value) -> bool {
    match value {
        Value::String(s) => s == "*",
        Value::Array(items) => items.iter().any(|v| v.as_str() == Some("*")),
        _ => false,
    }
}

fn values_match(node_value: &Value, source_value: &Value) -> bool {
    if contains_wildcard(node_value) || contains_wildcard(source_value) {
        return true;
    }
    if node_value == source_value {
        return true;
    }
    match (node_value, source_value) {
        (Value::Array(a), Value::Array(b)) => a.iter().any(|v| b.contains(v)),
        (Value::Array(items), scalar) => items.contains(scalar),
        (scalar, Value::Array(items)) => items.contains(scalar),
        _ => false,
    }
}

/// Select the instances that feed a given request, preserving input order.
pub fn select<'a>(
    store: &'a InstanceStore,
    node: &Value,
    resource_type: &str,
    config: &MatchingConfig,
) -> Vec<&'a Instance> {
    let candidates = store.scoped(resource_type);

    if !config.enabled {
        return candidates;
    }

    let Some(node_value) = extract_path(node, &config.node_key) else {
        return Vec::new();
    };

    candidates
        .into_iter()
        .filter(|instance| {
            extract_path(instance.fields(), &config.source_key)
                .is_some_and(|source_value| values_match(&node_value, &source_value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::InstanceStore;
    use serde_json::json;

    fn store_with(instances: Vec<(&str, Value)>) -> InstanceStore {
        let mut store = InstanceStore::empty();
        for (scope, fields) in instances {
            store.insert_instance(scope, Instance::new(fields));
        }
        store
    }

    #[test]
    fn disabled_matching_returns_scope_plus_default() {
        let store = store_with(vec![
            ("clusters", json!({"name": "a"})),
            ("default", json!({"name": "d"})),
        ]);
        let config = MatchingConfig { enabled: false, ..Default::default() };
        let selected = select(&store, &json!({}), "clusters", &config);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn excludes_non_matching_instances() {
        let store = store_with(vec![
            ("clusters", json!({"service_clusters": ["T1"]})),
            ("clusters", json!({"service_clusters": ["X1"]})),
        ]);
        let config = MatchingConfig { enabled: true, ..Default::default() };
        let node = json!({"cluster": "T1"});
        let selected = select(&store, &node, "clusters", &config);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].fields()["service_clusters"], json!(["T1"]));
    }

    #[test]
    fn wildcard_on_source_matches_any_node() {
        let store = store_with(vec![("clusters", json!({"service_clusters": ["*"]}))]);
        let config = MatchingConfig { enabled: true, ..Default::default() };
        let node = json!({"cluster": "anything"});
        let selected = select(&store, &node, "clusters", &config);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn preserves_input_order() {
        let store = store_with(vec![
            ("clusters", json!({"service_clusters": ["*"], "name": "first"})),
            ("clusters", json!({"service_clusters": ["*"], "name": "second"})),
        ]);
        let config = MatchingConfig { enabled: true, ..Default::default() };
        let selected = select(&store, &json!({"cluster": "x"}), "clusters", &config);
        assert_eq!(selected[0].fields()["name"], "first");
        assert_eq!(selected[1].fields()["name"], "second");
    }

    #[test]
    fn dotted_path_extracts_nested_node_key() {
        let value = json!({"metadata": {"region": "us-east-1"}});
        assert_eq!(extract_path(&value, "metadata.region"), Some(json!("us-east-1")));
        assert_eq!(extract_path(&value, "metadata.missing"), None);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn wildcard_on_either_side_always_matches_non_empty_values(
                node_value in "[a-z]{1,8}",
                source_value in "[a-z]{1,8}",
            ) {
                prop_assert!(values_match(&json!("*"), &json!(node_value)));
                prop_assert!(values_match(&json!(source_value), &json!("*")));
            }

            #[test]
            fn equal_scalars_always_match(value in "[a-z]{1,8}") {
                prop_assert!(values_match(&json!(value.clone()), &json!(value)));
            }
        }
    }
}
