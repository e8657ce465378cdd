//! Error types for the storage seam, single records and whole runs.

use std::fmt;

use psm_fingerprint::EncodingError;
use psm_schemas::{CollectionId, CollectionKind, CollectionScope, Identity, RunStats};

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Failure reported by a [`crate::RecordStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Collection does not exist for this tenant.
    CollectionNotFound(CollectionScope),
    /// Collection exists with the other kind.
    WrongKind {
        collection_id: CollectionId,
        expected: CollectionKind,
        found: CollectionKind,
    },
    /// Collection exists but is deactivated.
    Inactive(CollectionId),
    /// Record does not exist.
    RecordNotFound(Identity),
    /// Insert collided with an existing identity or collection name.
    AlreadyExists(String),
    /// Stored fingerprint moved since the snapshot was captured.
    StaleWrite { identity: Identity },
    /// Driver / connection / serialization failure.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::CollectionNotFound(scope) => write!(f, "collection not found: {scope}"),
            StoreError::WrongKind {
                collection_id,
                expected,
                found,
            } => write!(
                f,
                "collection {collection_id} is {found}, expected {expected}"
            ),
            StoreError::Inactive(id) => write!(f, "collection {id} is inactive"),
            StoreError::RecordNotFound(identity) => write!(f, "record '{identity}' not found"),
            StoreError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            StoreError::StaleWrite { identity } => write!(
                f,
                "stale write for '{identity}': stored fingerprint changed since snapshot"
            ),
            StoreError::Backend(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// RecordError
// ---------------------------------------------------------------------------

/// Failure scoped to one identity. Never aborts a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    Encoding(EncodingError),
    Store(StoreError),
    NotFound(Identity),
    InvalidPatch(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::Encoding(e) => write!(f, "{e}"),
            RecordError::Store(e) => write!(f, "{e}"),
            RecordError::NotFound(identity) => write!(f, "record '{identity}' not found"),
            RecordError::InvalidPatch(msg) => write!(f, "invalid patch: {msg}"),
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Encoding(e) => Some(e),
            RecordError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EncodingError> for RecordError {
    fn from(e: EncodingError) -> Self {
        RecordError::Encoding(e)
    }
}

impl From<StoreError> for RecordError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RecordNotFound(identity) => RecordError::NotFound(identity),
            other => RecordError::Store(other),
        }
    }
}

// ---------------------------------------------------------------------------
// RunError
// ---------------------------------------------------------------------------

/// Failure of a run-level operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RunError {
    /// Another run holds the (tenant, target) lock. Retry later.
    RunInProgress(CollectionScope),
    /// Source or target could not be opened. The run was logged as failed.
    CollectionUnavailable {
        reason: StoreError,
        stats: Box<RunStats>,
    },
    /// Lock, run-log or collection access failed outside a run.
    Store(StoreError),
    /// Single-record operation failed.
    Record {
        identity: Identity,
        error: RecordError,
    },
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::RunInProgress(scope) => {
                write!(f, "a run is already in progress for target {scope}")
            }
            RunError::CollectionUnavailable { reason, stats } => {
                write!(f, "cannot open collection (run {}): {reason}", stats.run_id)
            }
            RunError::Store(e) => write!(f, "{e}"),
            RunError::Record { identity, error } => write!(f, "record '{identity}': {error}"),
        }
    }
}

impl std::error::Error for RunError {}

impl From<StoreError> for RunError {
    fn from(e: StoreError) -> Self {
        RunError::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psm_schemas::TenantId;

    #[test]
    fn missing_record_maps_to_not_found() {
        let e: RecordError = StoreError::RecordNotFound(Identity::from("P1")).into();
        assert_eq!(e, RecordError::NotFound(Identity::from("P1")));
        assert_eq!(e.to_string(), "record 'P1' not found");
    }

    #[test]
    fn run_in_progress_names_scope() {
        let scope = CollectionScope::new(TenantId::new_random(), CollectionId::new_random());
        let msg = RunError::RunInProgress(scope).to_string();
        assert!(msg.contains(&scope.collection_id.to_string()));
    }
}
