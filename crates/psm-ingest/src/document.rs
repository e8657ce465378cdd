//! Import document loading.
//!
//! Accepted shapes: a bare JSON array of records, or an object carrying the
//! records under `data`.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Bytes are not valid JSON.
    Parse(String),
    /// Valid JSON of the wrong shape.
    Shape(String),
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::Parse(msg) => write!(f, "import document is not valid JSON: {msg}"),
            DocumentError::Shape(msg) => write!(f, "import document has wrong shape: {msg}"),
        }
    }
}

impl std::error::Error for DocumentError {}

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Parse an import document into its raw record list.
pub fn load_json_document(bytes: &[u8]) -> Result<Vec<Value>, DocumentError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let doc: Value =
        serde_json::from_slice(bytes).map_err(|e| DocumentError::Parse(e.to_string()))?;
    into_records(doc)
}

/// Same as [`load_json_document`] for an already-parsed body.
pub fn into_records(doc: Value) -> Result<Vec<Value>, DocumentError> {
    match doc {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(DocumentError::Shape("'data' must be an array".to_string())),
            None => Err(DocumentError::Shape(
                "expected an array or an object with a 'data' array".to_string(),
            )),
        },
        _ => Err(DocumentError::Shape(
            "expected an array or an object with a 'data' array".to_string(),
        )),
    }
}
