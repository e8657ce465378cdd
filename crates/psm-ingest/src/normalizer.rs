//! Raw map → normalized record.
//!
//! Identity is taken from the first usable candidate field. The raw map is
//! kept verbatim as the payload, identity fields included.

use std::collections::BTreeMap;
use std::fmt;

use psm_schemas::{BatchRejection, Identity, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Identity candidates
// ---------------------------------------------------------------------------

/// Ordered identity candidates: `primary` first, then `fallback`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFields {
    pub primary: String,
    pub fallback: Option<String>,
}

impl Default for IdentityFields {
    fn default() -> Self {
        Self {
            primary: "id".to_string(),
            fallback: Some("external_id".to_string()),
        }
    }
}

impl IdentityFields {
    pub fn new(primary: impl Into<String>, fallback: Option<String>) -> Self {
        Self {
            primary: primary.into(),
            fallback,
        }
    }

    /// Build from a configured list; the first entry is primary, the second
    /// the fallback. Extra entries are ignored.
    pub fn from_list(fields: &[String]) -> Option<Self> {
        let primary = fields.first()?.trim();
        if primary.is_empty() {
            return None;
        }
        let fallback = fields
            .get(1)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Some(Self::new(primary, fallback))
    }

    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallback.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Zero-based position in the submitted batch (0 for single records).
    pub position: usize,
    pub identity: Identity,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub position: usize,
    pub error: NormalizeError,
}

impl Rejection {
    pub fn to_batch_rejection(&self) -> BatchRejection {
        let identity = match &self.error {
            NormalizeError::DuplicateInBatch { identity, .. } => Some(identity.clone()),
            _ => None,
        };
        BatchRejection {
            position: self.position,
            identity,
            reason: self.error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedBatch {
    /// Accepted records in input order.
    pub accepted: Vec<NormalizedRecord>,
    /// Rejections sorted by position.
    pub rejections: Vec<Rejection>,
}

impl NormalizedBatch {
    pub fn batch_rejections(&self) -> Vec<BatchRejection> {
        self.rejections.iter().map(Rejection::to_batch_rejection).collect()
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// The raw record is not a JSON object.
    NotAnObject { kind: &'static str },
    /// No candidate field holds a usable identity.
    MissingIdentity { tried: Vec<String> },
    /// A candidate is present but holds a value that cannot be an identity.
    UnsupportedIdentity { field: String, kind: &'static str },
    /// A later record in the same batch carries the same identity.
    DuplicateInBatch {
        identity: Identity,
        superseded_by: usize,
    },
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::NotAnObject { kind } => {
                write!(f, "record must be an object, got {kind}")
            }
            NormalizeError::MissingIdentity { tried } => {
                write!(f, "missing identity (tried: {})", tried.join(", "))
            }
            NormalizeError::UnsupportedIdentity { field, kind } => {
                write!(f, "identity field '{field}' holds unsupported {kind}")
            }
            NormalizeError::DuplicateInBatch {
                identity,
                superseded_by,
            } => write!(
                f,
                "duplicate identity '{identity}' superseded by record at position {superseded_by}"
            ),
        }
    }
}

impl std::error::Error for NormalizeError {}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize one raw record.
pub fn normalize(raw: &Value, fields: &IdentityFields) -> Result<NormalizedRecord, NormalizeError> {
    normalize_at(0, raw, fields)
}

/// Normalize a batch, isolating failures per record.
///
/// Duplicate identities keep the later record; each earlier occurrence is
/// reported as [`NormalizeError::DuplicateInBatch`].
pub fn normalize_batch(raws: &[Value], fields: &IdentityFields) -> NormalizedBatch {
    let mut accepted: Vec<NormalizedRecord> = Vec::with_capacity(raws.len());
    let mut rejections = Vec::new();

    for (position, raw) in raws.iter().enumerate() {
        match normalize_at(position, raw, fields) {
            Ok(rec) => accepted.push(rec),
            Err(error) => rejections.push(Rejection { position, error }),
        }
    }

    // Last occurrence of each identity wins.
    let mut last: BTreeMap<Identity, usize> = BTreeMap::new();
    for rec in &accepted {
        last.insert(rec.identity.clone(), rec.position);
    }
    let (keep, dropped): (Vec<_>, Vec<_>) = accepted
        .into_iter()
        .partition(|rec| last.get(&rec.identity) == Some(&rec.position));

    for rec in dropped {
        let superseded_by = last.get(&rec.identity).copied().unwrap_or(rec.position);
        rejections.push(Rejection {
            position: rec.position,
            error: NormalizeError::DuplicateInBatch {
                identity: rec.identity,
                superseded_by,
            },
        });
    }
    rejections.sort_by_key(|r| r.position);

    NormalizedBatch {
        accepted: keep,
        rejections,
    }
}

fn normalize_at(
    position: usize,
    raw: &Value,
    fields: &IdentityFields,
) -> Result<NormalizedRecord, NormalizeError> {
    let map = raw.as_object().ok_or(NormalizeError::NotAnObject {
        kind: json_kind(raw),
    })?;

    let mut unsupported: Option<NormalizeError> = None;
    let mut identity: Option<Identity> = None;

    for field in fields.candidates() {
        match map.get(field) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    continue;
                }
                identity = Some(Identity::new(trimmed));
                break;
            }
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => {
                identity = Some(Identity::new(n.to_string()));
                break;
            }
            Some(other) => {
                if unsupported.is_none() {
                    unsupported = Some(NormalizeError::UnsupportedIdentity {
                        field: field.to_string(),
                        kind: json_kind(other),
                    });
                }
            }
        }
    }

    match identity {
        Some(identity) => Ok(NormalizedRecord {
            position,
            identity,
            payload: Payload::from(raw),
        }),
        None => Err(unsupported.unwrap_or_else(|| NormalizeError::MissingIdentity {
            tried: fields.candidates().map(str::to_string).collect(),
        })),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
