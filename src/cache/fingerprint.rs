//! Canonical request fingerprints.
//!
//! A fingerprint is built from an ordered list of request fields. Each field
//! contributes one or more parts:
//! - arrays contribute one part per element, the element's own fingerprint
//! - objects contribute their canonical JSON (keys sorted at every depth)
//! - scalars contribute themselves
//!
//! The digest is SHA-256 over the canonical JSON of the part list, truncated
//! to 128 bits. Incidental key order never changes the result; element order,
//! and any change in content, does.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{Fingerprint, FINGERPRINT_LEN};

/// Accumulates request fields into a fingerprint.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    parts: Vec<Value>,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add any serializable field.
    pub fn push<T: Serialize + ?Sized>(&mut self, field: &T) -> Result<&mut Self, serde_json::Error> {
        let value = serde_json::to_value(field)?;
        Ok(self.push_value(value))
    }

    /// Add an already-converted JSON field.
    pub fn push_value(&mut self, value: Value) -> &mut Self {
        match value {
            Value::Array(items) => {
                for item in items {
                    let digest = Self::digest_of(item);
                    self.parts.push(Value::String(digest.to_hex()));
                }
            }
            Value::Object(_) => self.parts.push(Value::String(canonical_json(&value))),
            scalar => self.parts.push(scalar),
        }
        self
    }

    pub fn finish(&self) -> Fingerprint {
        let canonical = canonical_json(&Value::Array(self.parts.clone()));
        let hash = Sha256::digest(canonical.as_bytes());
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&hash[..FINGERPRINT_LEN]);
        Fingerprint::from_bytes(bytes)
    }

    fn digest_of(value: Value) -> Fingerprint {
        let mut inner = Fingerprinter::new();
        inner.push_value(value);
        inner.finish()
    }
}

/// Compact JSON with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fingerprint(fields: &[Value]) -> Fingerprint {
        let mut fp = Fingerprinter::new();
        for f in fields {
            fp.push_value(f.clone());
        }
        fp.finish()
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value: Value =
            serde_json::from_str(r#"{"b": {"z": 1, "a": [ {"y": 2, "x": 1} ]}, "a": null}"#)
                .unwrap();
        assert_eq!(
            canonical_json(&value),
            r#"{"a":null,"b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"properties": {"b": {"type": "number"}, "a": {"type": "number"}}, "type": "object"}"#).unwrap();
        assert_eq!(
            fingerprint(&[json!([a]), json!("gpt-4")]),
            fingerprint(&[json!([b]), json!("gpt-4")])
        );
    }

    #[test]
    fn element_order_matters() {
        let first = fingerprint(&[json!([{"role": "user", "content": "a"}, {"role": "user", "content": "b"}])]);
        let second = fingerprint(&[json!([{"role": "user", "content": "b"}, {"role": "user", "content": "a"}])]);
        assert_ne!(first, second);
    }

    #[test]
    fn content_change_changes_fingerprint() {
        let base = fingerprint(&[json!([{"role": "user", "content": "What is 1 + 1?"}]), json!("gpt-4")]);
        let changed = fingerprint(&[json!([{"role": "user", "content": "What is 1 + 2?"}]), json!("gpt-4")]);
        let other_model = fingerprint(&[json!([{"role": "user", "content": "What is 1 + 1?"}]), json!("gpt-3.5")]);
        assert_ne!(base, changed);
        assert_ne!(base, other_model);
    }

    #[test]
    fn absent_field_is_distinct_from_missing_field() {
        let with_null = fingerprint(&[json!("gpt-4"), Value::Null]);
        let without = fingerprint(&[json!("gpt-4")]);
        assert_ne!(with_null, without);
    }

    #[test]
    fn fingerprint_is_stable_across_runs() {
        // Pinned so a change to the canonical form is caught: existing caches
        // would silently stop hitting.
        let fp = fingerprint(&[json!("gpt-4")]);
        assert_eq!(fp, fingerprint(&[json!("gpt-4")]));
        let expected = {
            let hash = Sha256::digest(br#"["gpt-4"]"#);
            hex::encode(&hash[..FINGERPRINT_LEN])
        };
        assert_eq!(fp.to_hex(), expected);
    }
}
