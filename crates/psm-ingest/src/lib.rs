//! psm-ingest
//!
//! Turns raw JSON property maps into normalized records keyed by identity.
//!
//! This crate does **not** write to storage and does not interpret payloads
//! beyond identity extraction. Callers hand the accepted records to
//! `psm-reconcile`.

pub mod document;
pub mod normalizer;

pub use document::{into_records, load_json_document, DocumentError};
pub use normalizer::{
    normalize, normalize_batch, IdentityFields, NormalizeError, NormalizedBatch, NormalizedRecord,
    Rejection,
};
