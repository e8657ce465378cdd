//! psm-fingerprint
//!
//! Content fingerprints for property payloads.
//!
//! Canonical form is compact JSON with map keys sorted recursively and no
//! whitespace. The fingerprint is the lowercase hex SHA-256 of those bytes.
//! Integers and floats keep their distinct renderings (`1` vs `1.0`), except
//! integral floats large enough to render in exponent form, which hash as the
//! integer they equal. `-0.0` is normalized to `0.0`.

use std::fmt;

use psm_schemas::{Fingerprint, Number, Payload};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A payload value that has no canonical JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingError {
    /// JSON pointer (RFC 6901) of the offending value; `""` is the root.
    pub pointer: String,
    pub reason: String,
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = if self.pointer.is_empty() {
            "/"
        } else {
            self.pointer.as_str()
        };
        write!(f, "cannot encode payload at {at}: {}", self.reason)
    }
}

impl std::error::Error for EncodingError {}

/// Fingerprint a payload.
pub fn digest(payload: &Payload) -> Result<Fingerprint, EncodingError> {
    let canonical = canonical_json(payload)?;
    Ok(Fingerprint::from_hex(sha256_hex(canonical.as_bytes())))
}

/// Fingerprint raw JSON, as received from an import body.
pub fn digest_json(value: &Value) -> Result<Fingerprint, EncodingError> {
    digest(&Payload::from(value))
}

/// Canonical compact JSON rendering of `payload`.
pub fn canonical_json(payload: &Payload) -> Result<String, EncodingError> {
    let mut pointer = String::new();
    let value = canonical_value(payload, &mut pointer)?;
    serde_json::to_string(&value).map_err(|e| EncodingError {
        pointer: String::new(),
        reason: e.to_string(),
    })
}

/// Recompute and compare. Used to audit stored records.
pub fn verify(payload: &Payload, expected: &Fingerprint) -> Result<bool, EncodingError> {
    Ok(digest(payload)? == *expected)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn canonical_value(p: &Payload, pointer: &mut String) -> Result<Value, EncodingError> {
    Ok(match p {
        Payload::Null => Value::Null,
        Payload::Bool(b) => Value::Bool(*b),
        Payload::Number(n) => canonical_number(n.canonical(), pointer)?,
        Payload::String(s) => Value::String(s.clone()),
        Payload::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let len = pointer.len();
                pointer.push('/');
                pointer.push_str(&i.to_string());
                out.push(canonical_value(item, pointer)?);
                pointer.truncate(len);
            }
            Value::Array(out)
        }
        Payload::Map(map) => {
            // BTreeMap iteration is already key-sorted.
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let len = pointer.len();
                pointer.push('/');
                push_escaped(pointer, k);
                out.insert(k.clone(), canonical_value(v, pointer)?);
                pointer.truncate(len);
            }
            Value::Object(out)
        }
    })
}

fn canonical_number(n: Number, pointer: &str) -> Result<Value, EncodingError> {
    Ok(match n {
        Number::Int(i) => Value::from(i),
        Number::UInt(u) => Value::from(u),
        Number::Float(f) => {
            if !f.is_finite() {
                return Err(EncodingError {
                    pointer: pointer.to_string(),
                    reason: format!("non-finite float {f}"),
                });
            }
            // -0.0 == 0.0 but renders differently.
            let f = if f == 0.0 { 0.0 } else { f };
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| EncodingError {
                    pointer: pointer.to_string(),
                    reason: format!("unrepresentable float {f}"),
                })?
        }
    })
}

fn push_escaped(pointer: &mut String, key: &str) {
    for c in key.chars() {
        match c {
            '~' => pointer.push_str("~0"),
            '/' => pointer.push_str("~1"),
            _ => pointer.push(c),
        }
    }
}
