//! Hashing System - Document Fingerprints
//!
//! Same template and same rows always give the same fingerprint, so a printed
//! invoice can be matched back to the data it was rendered from.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::templates::{RowValues, Template};

/// SHA-256 of bytes as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Convert to canonical JSON (sorted keys, no whitespace, no negative zero)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    serde_json::to_string(&canonicalize(v))
}

fn canonicalize(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, canonicalize(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Number(n) if n.as_f64() == Some(0.0) => Value::from(0),
        other => other,
    }
}

pub fn template_fingerprint(template: &Template) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(canonical_json(template)?.as_bytes()))
}

/// fingerprint = sha256(template_fingerprint + ":" + canonical rows + ":" + engine_version)
pub fn document_fingerprint(
    template: &Template,
    rows: &[RowValues],
    engine_version: &str,
) -> Result<String, serde_json::Error> {
    let combined = format!(
        "{}:{}:{}",
        template_fingerprint(template)?,
        canonical_json(&rows)?,
        engine_version
    );
    Ok(sha256_hex(combined.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::CellValue;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": {"b": -0.0, "a": 3}});
        assert_eq!(canonical_json(&obj).unwrap(), r#"{"a":2,"m":{"a":3,"b":0},"z":1}"#);
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_document_fingerprint_tracks_rows() {
        let template = Template::default_invoice();
        let mut row = RowValues::new();
        row.insert("qty".into(), CellValue::Number(2.0));

        let a = document_fingerprint(&template, &[row.clone()], "1.0.0").unwrap();
        let b = document_fingerprint(&template, &[row.clone()], "1.0.0").unwrap();
        row.insert("qty".into(), CellValue::Number(3.0));
        let c = document_fingerprint(&template, &[row], "1.0.0").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
