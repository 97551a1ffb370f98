//! Canonical JSON and content hashing.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Canonical (sorted-key, compact) JSON rendering of a value.
///
/// `serde_json`'s default map is ordered, so a parse/serialize round trip
/// yields deterministic output regardless of the input key order.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Deterministic SHA-256 hash of a JSON document given as a string.
pub fn schema_hash(schema_json: &str) -> String {
    let parsed: Value = serde_json::from_str(schema_json).unwrap_or(Value::Null);
    sha256_hex(canonical_json(&parsed).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_hex_stable() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_schema_hash_key_order_independent() {
        let a = r#"{"b": 1, "a": 2}"#;
        let b = r#"{"a": 2, "b": 1}"#;
        assert_eq!(schema_hash(a), schema_hash(b));
    }

    #[test]
    fn test_canonical_json_sorted() {
        let v: Value = serde_json::from_str(r#"{"z": 1, "a": {"y": 2, "b": 3}}"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"a":{"b":3,"y":2},"z":1}"#);
    }

    #[test]
    fn test_canonical_json_nested_arrays() {
        let v = json!({"list": [{"b": 1, "a": 2}]});
        assert_eq!(canonical_json(&v), r#"{"list":[{"a":2,"b":1}]}"#);
    }
}
