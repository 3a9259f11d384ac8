//! Environment variable substitution.
//!
//! `$name` and `${name}` references inside parameter strings are replaced by
//! environment values. Keys are applied longest first, so `$ab` is never
//! mistaken for `$a` followed by a literal `b`.

use serde_json::{Map, Value};

/// Text inserted for an environment value
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Keys ordered longest first, ties broken alphabetically
fn ordered_keys(environment: &Map<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = environment.keys().filter(|k| !k.is_empty()).collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    keys
}

fn substitute_with(text: &str, keys: &[&String], environment: &Map<String, Value>) -> String {
    if !text.contains('$') {
        return text.to_string();
    }
    let mut result = text.to_string();
    for key in keys {
        let rendered = render(&environment[key.as_str()]);
        result = result
            .replace(&format!("${{{key}}}"), &rendered)
            .replace(&format!("${key}"), &rendered);
    }
    result
}

/// Substitute environment references in one string
pub fn substitute(text: &str, environment: &Map<String, Value>) -> String {
    substitute_with(text, &ordered_keys(environment), environment)
}

/// Substitute environment references in every string of a JSON value
pub fn substitute_value(value: &Value, environment: &Map<String, Value>) -> Value {
    if environment.is_empty() {
        return value.clone();
    }
    let keys = ordered_keys(environment);
    substitute_tree(value, &keys, environment)
}

fn substitute_tree(value: &Value, keys: &[&String], environment: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_with(s, keys, environment)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_tree(item, keys, environment))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_tree(v, keys, environment)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn env(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_both_reference_forms() {
        let environment = env(json!({"ispyb_dcid": 1234, "name": "thaumatin"}));
        assert_eq!(
            substitute("/dls/${name}/dc$ispyb_dcid.log", &environment),
            "/dls/thaumatin/dc1234.log"
        );
    }

    #[test]
    fn test_longest_key_wins() {
        let environment = env(json!({"a": "short", "ab": "long"}));
        assert_eq!(substitute("$ab $a ${a}b", &environment), "long short shortb");
    }

    #[test]
    fn test_unknown_reference_left_alone() {
        let environment = env(json!({"x": 1}));
        assert_eq!(substitute("cost: $5 and $y", &environment), "cost: $5 and $y");
    }

    #[test]
    fn test_nested_values() {
        let environment = env(json!({"jobid": 77}));
        let value = json!({"p": ["$jobid", {"q": "job-${jobid}"}], "n": 3});
        assert_eq!(
            substitute_value(&value, &environment),
            json!({"p": ["77", {"q": "job-77"}], "n": 3})
        );
    }

    proptest! {
        #[test]
        fn braced_tokens_match_longest_first_reference(
            keys in proptest::collection::btree_set("[a-c]{1,4}", 1..6),
            picks in proptest::collection::vec(0usize..6, 1..8),
        ) {
            let keys: Vec<String> = keys.into_iter().collect();
            let environment: Map<String, Value> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| (k.clone(), Value::String(format!("<{i}>"))))
                .collect();

            let chosen: Vec<&String> = picks.iter().map(|p| &keys[p % keys.len()]).collect();
            let text: String = chosen.iter().map(|k| format!("${{{k}}}|")).collect();
            let expected: String = chosen
                .iter()
                .map(|k| format!("{}|", render(&environment[k.as_str()])))
                .collect();

            prop_assert_eq!(substitute(&text, &environment), expected);
        }
    }
}
