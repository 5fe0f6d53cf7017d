//! Canonical JSON normalization, snapshot hashing, and redaction.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::rules::helpers::HASH_LEN;

fn is_primitive(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

/// Normalize a JSON document for hashing.
///
/// Maps keep primitive entries as-is and recurse into the rest. Arrays of
/// objects are normalized element-wise and then sorted by their canonical
/// serialization; primitive arrays sort ascending. serde_json's map is a
/// BTreeMap, so key order is already lexicographic at serialization time.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let normalized = map
                .iter()
                .map(|(k, v)| {
                    let v = if is_primitive(v) {
                        v.clone()
                    } else {
                        normalize(v)
                    };
                    (k.clone(), v)
                })
                .collect();
            Value::Object(normalized)
        }
        Value::Array(items) => {
            let mut normalized: Vec<Value> = items.iter().map(normalize).collect();
            normalized.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
            Value::Array(normalized)
        }
        primitive => primitive.clone(),
    }
}

/// The stable serialization hashes are computed over.
pub fn canonical_string(value: &Value) -> String {
    normalize(value).to_string()
}

/// SHA-256 of the normalized form, truncated to 16 hex characters.
pub fn snapshot_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(value).as_bytes());
    hex::encode(hasher.finalize())[..HASH_LEN].to_string()
}

/// Replace the value of any key whose lowercased name contains "password" or
/// "secret", at all depths.
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                let lower = key.to_lowercase();
                if lower.contains("password") || lower.contains("secret") {
                    *v = Value::String("[REDACTED]".to_string());
                } else {
                    redact(v);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitive_arrays_sort_ascending() {
        let a = json!({"ids": [3, 1, 2]});
        let b = json!({"ids": [1, 2, 3]});
        assert_eq!(snapshot_hash(&a), snapshot_hash(&b));
    }

    #[test]
    fn test_object_arrays_sort_by_serialization() {
        let a = json!({"items": [{"sku": "B"}, {"sku": "A"}]});
        let b = json!({"items": [{"sku": "A"}, {"sku": "B"}]});
        assert_eq!(snapshot_hash(&a), snapshot_hash(&b));
    }

    #[test]
    fn test_nested_normalization() {
        let a = json!({"outer": {"inner": [{"v": [2, 1]}, {"v": [4, 3]}]}});
        let b = json!({"outer": {"inner": [{"v": [3, 4]}, {"v": [1, 2]}]}});
        assert_eq!(snapshot_hash(&a), snapshot_hash(&b));
    }

    #[test]
    fn test_distinct_content_distinct_hash() {
        let a = json!({"sku": "SKU001"});
        let b = json!({"sku": "SKU002"});
        assert_ne!(snapshot_hash(&a), snapshot_hash(&b));
        assert_eq!(snapshot_hash(&a).len(), HASH_LEN);
    }

    #[test]
    fn test_redaction_at_all_depths() {
        let mut doc = json!({
            "api_password": "hunter2",
            "nested": {"client_secret": "abc", "fine": "keep"},
            "list": [{"SECRET_KEY": "xyz"}]
        });
        redact(&mut doc);
        assert_eq!(doc["api_password"], "[REDACTED]");
        assert_eq!(doc["nested"]["client_secret"], "[REDACTED]");
        assert_eq!(doc["nested"]["fine"], "keep");
        assert_eq!(doc["list"][0]["SECRET_KEY"], "[REDACTED]");
    }
}
