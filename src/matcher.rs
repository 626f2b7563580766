//! Structural pattern matching.
//!
//! A pattern is a JSON object describing required fields. A message matches
//! when every key of the pattern is present in the message with an equal
//! value; nested objects recurse, extra message keys are ignored. The empty
//! object is the catch-all.
//!
//! Arrays are compared by exact sequence equality, not index by index.

use serde_json::Value;

/// Whether `value` can be used as a pattern.
pub fn is_valid_pattern(value: &Value) -> bool {
    value.is_object()
}

/// Test `message` against `pattern`.
///
/// Fails closed: a non-object pattern never matches.
pub fn matches(message: &Value, pattern: &Value) -> bool {
    let Some(pattern) = pattern.as_object() else {
        return false;
    };

    if pattern.is_empty() {
        return true;
    }

    let Some(message) = message.as_object() else {
        return false;
    };

    pattern.iter().all(|(key, expected)| match message.get(key) {
        None => false,
        Some(actual) if expected.is_object() && actual.is_object() => matches(actual, expected),
        Some(actual) => actual == expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_pattern_is_catch_all() {
        assert!(matches(&json!({}), &json!({})));
        assert!(matches(&json!({"a": 1}), &json!({})));
        assert!(matches(&json!("scalar"), &json!({})));
    }

    #[test]
    fn test_non_object_pattern_never_matches() {
        assert!(!matches(&json!({"a": 1}), &json!("a")));
        assert!(!matches(&json!({"a": 1}), &Value::Null));
        assert!(!matches(&json!({"0": 1}), &json!([1])));
    }

    #[test]
    fn test_subset_semantics() {
        let message = json!({"topic": "news", "content": "Hello, world!"});
        assert!(matches(&message, &json!({"topic": "news"})));
        assert!(!matches(&message, &json!({"topic": "sports"})));
        assert!(!matches(&message, &json!({"missing": "news"})));
    }

    #[test]
    fn test_nested_objects_recurse() {
        let message = json!({"match": "this", "and": {"also": "this", "extra": true}});
        assert!(matches(&message, &json!({"and": {"also": "this"}})));
        assert!(!matches(&json!({"a": {"b": 2}}), &json!({"a": {"b": 1}})));
    }

    #[test]
    fn test_object_against_scalar_is_unequal() {
        assert!(!matches(&json!({"a": 1}), &json!({"a": {"b": 1}})));
        assert!(!matches(&json!({"a": {"b": 1}}), &json!({"a": 1})));
    }

    #[test]
    fn test_arrays_compare_exactly() {
        let message = json!({"tags": ["a", "b"]});
        assert!(matches(&message, &json!({"tags": ["a", "b"]})));
        assert!(!matches(&message, &json!({"tags": ["a"]})));
        assert!(!matches(&message, &json!({"tags": {"0": "a"}})));
    }

    #[test]
    fn test_strict_value_equality() {
        assert!(!matches(&json!({"n": 1}), &json!({"n": "1"})));
        assert!(!matches(&json!({"n": null}), &json!({"n": false})));
        assert!(matches(&json!({"n": null}), &json!({"n": null})));
    }

    #[test]
    fn test_is_valid_pattern() {
        assert!(is_valid_pattern(&json!({})));
        assert!(!is_valid_pattern(&json!("invalid pattern")));
        assert!(!is_valid_pattern(&json!([])));
    }
}
