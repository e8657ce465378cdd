//! Property payload model.
//!
//! A payload is a closed tagged union over map / sequence / string / number /
//! bool / null. Maps are held in a `BTreeMap` so key order is a property of
//! the value, never of how the value was built. Serialization is plain JSON
//! (untagged), so a payload round-trips through any JSON column or body.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric leaf.
///
/// Integers stay integers; only values that do not fit an integer land in
/// `Float`. `Float` may hold non-finite values when built in memory; those
/// cannot be canonicalized and are rejected by the fingerprinter.
///
/// An integral float of magnitude [`INTEGRAL_FLOAT_FLOOR`] or more that fits
/// an `i64`/`u64` is the same number as that integer: JSON writers render it
/// in exponent form and Postgres `jsonb` hands it back without one.
/// [`Number::canonical`] folds it into the integer variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    UInt(u64),
    Float(f64),
}

/// Smallest magnitude at which an integral `f64` loses its `.0` rendering.
pub const INTEGRAL_FLOAT_FLOOR: f64 = 1e16;

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

impl Number {
    pub fn from_f64(f: f64) -> Self {
        if !f.is_finite() || f.fract() != 0.0 || f.abs() < INTEGRAL_FLOAT_FLOOR {
            return Number::Float(f);
        }
        if (-TWO_POW_63..TWO_POW_63).contains(&f) {
            Number::Int(f as i64)
        } else if (0.0..TWO_POW_64).contains(&f) {
            Number::UInt(f as u64)
        } else {
            Number::Float(f)
        }
    }

    /// Same value in the variant it takes after a JSON round trip.
    pub fn canonical(self) -> Self {
        match self {
            Number::Float(f) => Number::from_f64(f),
            n => n,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Number::Int(i) => Some(i),
            Number::UInt(u) => i64::try_from(u).ok(),
            Number::Float(_) => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, Number::Float(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Sequence(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
}

impl Payload {
    /// Empty map payload.
    pub fn empty_map() -> Self {
        Payload::Map(BTreeMap::new())
    }

    /// Short type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Null => "null",
            Payload::Bool(_) => "bool",
            Payload::Number(n) if n.is_integer() => "integer",
            Payload::Number(_) => "float",
            Payload::String(_) => "string",
            Payload::Sequence(_) => "sequence",
            Payload::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Payload>> {
        match self {
            Payload::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Payload>> {
        match self {
            Payload::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    /// Map lookup; `None` for non-map payloads.
    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Convert into a `serde_json::Value`.
    ///
    /// Non-finite floats have no JSON representation and become `null`;
    /// callers that need to detect them must fingerprint first.
    pub fn to_json(&self) -> Value {
        match self {
            Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(*b),
            Payload::Number(n) => match n.canonical() {
                Number::Int(i) => Value::from(i),
                Number::UInt(u) => Value::from(u),
                Number::Float(f) => serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            },
            Payload::String(s) => Value::String(s.clone()),
            Payload::Sequence(items) => Value::Array(items.iter().map(Payload::to_json).collect()),
            Payload::Map(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json());
                }
                Value::Object(out)
            }
        }
    }
}

impl From<&Value> for Payload {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Payload::Number(Number::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Payload::Number(Number::UInt(u))
                } else {
                    Payload::Number(Number::from_f64(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            Value::String(s) => Payload::String(s.clone()),
            Value::Array(items) => Payload::Sequence(items.iter().map(Payload::from).collect()),
            Value::Object(map) => Payload::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Payload::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::from(&v)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::String(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::String(s)
    }
}

impl From<i64> for Payload {
    fn from(i: i64) -> Self {
        Payload::Number(Number::Int(i))
    }
}

impl From<f64> for Payload {
    fn from(f: f64) -> Self {
        Payload::Number(Number::from_f64(f))
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Payload::Bool(b)
    }
}
