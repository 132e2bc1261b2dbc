// # Node identity
//
// A node's identity is the SHA-256 digest of its proxy-protocol options in
// canonical JSON form: object keys sorted lexicographically at every depth,
// no insignificant whitespace, array order preserved. Two option blobs that
// differ only in whitespace or key order hash identically, so the same node
// fed by several subscriptions is one pool entry.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Lowercase-hex SHA-256 of canonicalised options.
pub type NodeHash = String;

/// Compute a node's identity from its raw options.
pub fn identity_of(options: &Value) -> NodeHash {
    let mut hasher = Sha256::new();
    write_canonical(options, &mut hasher);
    hex::encode(hasher.finalize())
}

/// Canonical textual form, used for persistence of `raw_options_blob` so the
/// stored blob re-hashes to the row key.
pub fn canonical_json(options: &Value) -> String {
    let mut out = String::new();
    render_canonical(options, &mut out);
    out
}

fn write_canonical(v: &Value, hasher: &mut Sha256) {
    let mut s = String::new();
    render_canonical(v, &mut s);
    hasher.update(s.as_bytes());
}

fn render_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are JSON strings; serde escaping is deterministic.
                out.push_str(&serde_json::to_string(k).unwrap_or_default());
                out.push(':');
                render_canonical(&map[*k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already render canonically through serde_json.
        other => out.push_str(&serde_json::to_string(other).unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_ignores_key_order_and_whitespace() {
        let a: Value = serde_json::from_str(r#"{"type":"ss","server":"1.2.3.4","port":8388}"#)
            .unwrap();
        let b: Value =
            serde_json::from_str("{ \"port\": 8388,\n  \"server\": \"1.2.3.4\", \"type\": \"ss\" }")
                .unwrap();
        assert_eq!(identity_of(&a), identity_of(&b));
    }

    #[test]
    fn test_identity_is_sensitive_to_values() {
        let a = json!({"server": "1.2.3.4", "port": 8388});
        let b = json!({"server": "1.2.3.4", "port": 8389});
        assert_ne!(identity_of(&a), identity_of(&b));
    }

    #[test]
    fn test_nested_objects_sorted_at_every_depth() {
        let a = json!({"outer": {"b": 1, "a": 2}, "list": [{"z": 0, "y": 1}]});
        let b = json!({"list": [{"y": 1, "z": 0}], "outer": {"a": 2, "b": 1}});
        assert_eq!(identity_of(&a), identity_of(&b));
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_array_order_matters() {
        let a = json!({"hosts": ["a", "b"]});
        let b = json!({"hosts": ["b", "a"]});
        assert_ne!(identity_of(&a), identity_of(&b));
    }

    #[test]
    fn test_canonical_blob_rehashes_to_same_identity() {
        let a = json!({"type": "trojan", "sni": "x.example", "port": 443});
        let blob = canonical_json(&a);
        let reparsed: Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(identity_of(&a), identity_of(&reparsed));
    }

    #[test]
    fn test_identity_is_hex_sha256() {
        let id = identity_of(&json!({}));
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
