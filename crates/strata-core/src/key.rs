//! Deterministic key derivation.
//!
//! Cache keys, dependency keys and checksums are all digests of canonical
//! JSON, so the same logical input always lands on the same store record
//! regardless of field order in the incoming parameters.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::source::EntityRef;

/// Render a JSON value with object keys sorted recursively.
///
/// `serde_json::Map` preserves insertion order, so two semantically equal
/// parameter sets can serialize differently. Digests are always taken over
/// this canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // object keys are plain strings, serde_json can't fail here
                out.push_str(&serde_json::to_string(k).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn digest(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    // 16 bytes of sha-256 keeps keys short while staying collision-safe
    // for cache purposes
    hex::encode(&hash[..16])
}

/// Checksum of a data value, used for change detection.
pub fn checksum(data: &Value) -> String {
    digest(&canonical_json(data))
}

/// Derive the cache key for a (source, reduced params) pair.
pub fn cache_key(source: &str, params: &Value) -> String {
    let scope = serde_json::json!({ "source": source, "params": params });
    digest(&canonical_json(&scope))
}

/// Derive the dependency key for an upstream entity.
///
/// Aggregate results (counts, lists) depend on the entity kind without an
/// id, so the id is optional; the kind is not.
pub fn dependency_key(entity: &EntityRef) -> Result<String> {
    if entity.kind.is_empty() {
        return Err(CoreError::invalid_entity("entity kind is required"));
    }
    let mut scope = serde_json::json!({ "kind": entity.kind });
    if let Some(id) = &entity.id {
        scope["id"] = Value::String(id.clone());
    }
    Ok(digest(&canonical_json(&scope)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_object_keys() {
        let a = json!({"b": 1, "a": {"d": 4, "c": 3}});
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":4},"b":1}"#);
    }

    #[test]
    fn canonical_json_preserves_array_order() {
        let a = json!([3, 1, 2]);
        assert_eq!(canonical_json(&a), "[3,1,2]");
    }

    #[test]
    fn checksum_is_field_order_independent() {
        let a = json!({"x": 1, "y": [true, null]});
        let b = json!({"y": [true, null], "x": 1});
        assert_eq!(checksum(&a), checksum(&b));
        assert_ne!(checksum(&a), checksum(&json!({"x": 2, "y": [true, null]})));
    }

    #[test]
    fn cache_key_depends_on_source_and_params() {
        let params = json!({"id": 7});
        let k1 = cache_key("products", &params);
        let k2 = cache_key("orders", &params);
        let k3 = cache_key("products", &json!({"id": 8}));
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1, cache_key("products", &json!({"id": 7})));
        assert_eq!(k1.len(), 32);
    }

    #[test]
    fn dependency_key_requires_kind() {
        let err = dependency_key(&EntityRef::kind_only("")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidEntity(_)));

        let with_id = dependency_key(&EntityRef::new("product", "15")).unwrap();
        let kind_only = dependency_key(&EntityRef::kind_only("product")).unwrap();
        assert_ne!(with_id, kind_only);
    }
}
