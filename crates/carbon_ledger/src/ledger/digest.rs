//! Canonical JSON and SHA-256 fingerprint of dashboard output.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Normalize JSON for hashing: sorted keys, no whitespace.
pub fn normalize_for_hash(value: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&sort_json_keys(value))
}

fn sort_json_keys(v: &Value) -> Value {
    match v {
        Value::Object(m) => {
            let mut entries: Vec<(&String, &Value)> = m.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_json_keys(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_json_keys).collect()),
        other => other.clone(),
    }
}

/// Hex SHA-256 over the normalized JSON form of `value`.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let normalized = normalize_for_hash(&serde_json::to_value(value)?)?;
    Ok(hex::encode(Sha256::digest(normalized.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_ignores_key_order() {
        let a = serde_json::json!({"z": 1, "a": {"y": [2, {"c": 1, "b": 0}], "x": null}});
        let b = serde_json::json!({"a": {"x": null, "y": [2, {"b": 0, "c": 1}]}, "z": 1});
        assert_eq!(normalize_for_hash(&a).unwrap(), normalize_for_hash(&b).unwrap());
        assert_eq!(
            normalize_for_hash(&b).unwrap(),
            r#"{"a":{"x":null,"y":[2,{"b":0,"c":1}]},"z":1}"#
        );
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let h = fingerprint(&serde_json::json!({"remaining_credits": "20"})).unwrap();
        assert_eq!(h.len(), 64);
        assert_ne!(h, fingerprint(&serde_json::json!({"remaining_credits": "21"})).unwrap());
    }
}
