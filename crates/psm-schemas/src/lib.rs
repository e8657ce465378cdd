//! psm-schemas
//!
//! Shared data model for the property sync manager: payloads, identities,
//! collection scopes, property records, snapshots and run bookkeeping.
//!
//! Plain data only. Digest computation lives in `psm-fingerprint`; the rules
//! that keep `fingerprint == digest(payload)` live in `psm-reconcile`.

mod payload;

pub use payload::{Number, Payload, INTEGRAL_FLOAT_FLOOR};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

uuid_id!(
    /// Tenant scope. Every collection, record and snapshot belongs to one tenant.
    TenantId
);
uuid_id!(CollectionId);
uuid_id!(RunId);
uuid_id!(SnapshotId);

/// Caller-supplied record key, unique within (tenant, collection).
///
/// Integer identities are stored in their decimal rendering so `42` and `"42"`
/// address the same record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<i64> for Identity {
    fn from(i: i64) -> Self {
        Self(i.to_string())
    }
}

/// SHA-256 hex digest of a canonicalized payload (64 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed hex digest (e.g. read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines and warnings.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Source,
    Target,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Source => "SOURCE",
            CollectionKind::Target => "TARGET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SOURCE" => Some(CollectionKind::Source),
            "TARGET" => Some(CollectionKind::Target),
            _ => None,
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered source or target collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub collection_id: CollectionId,
    pub tenant_id: TenantId,
    pub name: String,
    pub kind: CollectionKind,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// (tenant, collection) pair every storage call is scoped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionScope {
    pub tenant_id: TenantId,
    pub collection_id: CollectionId,
}

impl CollectionScope {
    pub fn new(tenant_id: TenantId, collection_id: CollectionId) -> Self {
        Self {
            tenant_id,
            collection_id,
        }
    }
}

impl fmt::Display for CollectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.collection_id)
    }
}

// ---------------------------------------------------------------------------
// Records + snapshots
// ---------------------------------------------------------------------------

/// One property in one collection.
///
/// Source-side records leave `source_fingerprint`, `manual_change_flag` and
/// `warning_message` at their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub identity: Identity,
    pub payload: Payload,
    pub fingerprint: Fingerprint,
    /// Fingerprint of the source payload that last produced this target record.
    pub source_fingerprint: Option<Fingerprint>,
    pub manual_change_flag: bool,
    pub warning_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable pre-mutation copy of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub scope: CollectionScope,
    pub identity: Identity,
    pub payload: Payload,
    pub fingerprint: Fingerprint,
    pub captured_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Pending,
    Success,
    Partial,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Pending => "PENDING",
            RunOutcome::Success => "SUCCESS",
            RunOutcome::Partial => "PARTIAL",
            RunOutcome::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RunOutcome::Pending),
            "SUCCESS" => Some(RunOutcome::Success),
            "PARTIAL" => Some(RunOutcome::Partial),
            "FAILED" => Some(RunOutcome::Failed),
            _ => None,
        }
    }
}

/// Terminal decision taken for one record in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Created,
    Updated,
    SkippedUnchanged,
    SkippedConflict,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub identity: Identity,
    pub action: RecordAction,
}

/// A record that was read but could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub identity: Identity,
    pub error: String,
}

/// A raw input rejected before it became a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRejection {
    /// Zero-based position in the submitted batch.
    pub position: usize,
    pub identity: Option<Identity>,
    pub reason: String,
}

/// Result of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: RunId,
    pub created: u64,
    pub updated: u64,
    pub skipped_unchanged: u64,
    pub skipped_conflict: u64,
    /// Per-record failures plus ingest rejections.
    pub rejected: u64,
    pub outcome: RunOutcome,
    pub cancelled: bool,
    pub outcomes: Vec<RecordOutcome>,
    pub failures: Vec<RecordFailure>,
    pub rejections: Vec<BatchRejection>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStats {
    pub fn new(run_id: RunId, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            created: 0,
            updated: 0,
            skipped_unchanged: 0,
            skipped_conflict: 0,
            rejected: 0,
            outcome: RunOutcome::Pending,
            cancelled: false,
            outcomes: Vec::new(),
            failures: Vec::new(),
            rejections: Vec::new(),
            started_at,
            finished_at: None,
        }
    }

    /// Count one terminal record decision.
    pub fn record(&mut self, identity: Identity, action: RecordAction) {
        match action {
            RecordAction::Created => self.created += 1,
            RecordAction::Updated => self.updated += 1,
            RecordAction::SkippedUnchanged => self.skipped_unchanged += 1,
            RecordAction::SkippedConflict => self.skipped_conflict += 1,
            RecordAction::Failed => self.rejected += 1,
        }
        self.outcomes.push(RecordOutcome { identity, action });
    }

    pub fn record_failure(&mut self, identity: Identity, error: impl Into<String>) {
        self.failures.push(RecordFailure {
            identity: identity.clone(),
            error: error.into(),
        });
        self.record(identity, RecordAction::Failed);
    }

    pub fn record_rejection(&mut self, rejection: BatchRejection) {
        self.rejected += 1;
        self.rejections.push(rejection);
    }

    /// Records that reached a terminal decision (failures included).
    pub fn processed(&self) -> u64 {
        self.outcomes.len() as u64
    }

    pub fn has_errors(&self) -> bool {
        self.rejected > 0
    }
}

/// Persistent record of one run, written pending and finalized once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub source_id: CollectionId,
    pub target_id: CollectionId,
    pub created: u64,
    pub updated: u64,
    pub skipped_unchanged: u64,
    pub skipped_conflict: u64,
    pub rejected: u64,
    pub outcome: RunOutcome,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunLogEntry {
    pub fn pending(
        run_id: RunId,
        tenant_id: TenantId,
        source_id: CollectionId,
        target_id: CollectionId,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            tenant_id,
            source_id,
            target_id,
            created: 0,
            updated: 0,
            skipped_unchanged: 0,
            skipped_conflict: 0,
            rejected: 0,
            outcome: RunOutcome::Pending,
            message: None,
            started_at,
            finished_at: None,
        }
    }

    /// Copy final counts from `stats`.
    pub fn finalized(mut self, stats: &RunStats, message: Option<String>) -> Self {
        self.created = stats.created;
        self.updated = stats.updated;
        self.skipped_unchanged = stats.skipped_unchanged;
        self.skipped_conflict = stats.skipped_conflict;
        self.rejected = stats.rejected;
        self.outcome = stats.outcome;
        self.message = message;
        self.finished_at = stats.finished_at;
        self
    }
}

/// Result of importing a raw batch into a source collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImportStats {
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub rejected: u64,
    pub failures: Vec<RecordFailure>,
    pub rejections: Vec<BatchRejection>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_stats_counts_by_action() {
        let mut s = RunStats::new(RunId::new_random(), Utc::now());
        s.record("A".into(), RecordAction::Created);
        s.record("B".into(), RecordAction::SkippedConflict);
        s.record_failure("C".into(), "storage error: boom");
        s.record_rejection(BatchRejection {
            position: 3,
            identity: None,
            reason: "missing identity".to_string(),
        });

        assert_eq!(s.created, 1);
        assert_eq!(s.skipped_conflict, 1);
        assert_eq!(s.rejected, 2);
        assert_eq!(s.processed(), 3);
        assert_eq!(s.failures[0].identity.as_str(), "C");
    }

    #[test]
    fn collection_kind_parse_is_case_insensitive() {
        assert_eq!(CollectionKind::parse("source"), Some(CollectionKind::Source));
        assert_eq!(CollectionKind::parse(" TARGET "), Some(CollectionKind::Target));
        assert_eq!(CollectionKind::parse("sink"), None);
    }

    #[test]
    fn integer_identity_renders_decimal() {
        assert_eq!(Identity::from(42), Identity::from("42"));
    }

    #[test]
    fn outcome_serializes_lowercase() {
        let v = serde_json::to_value(RunOutcome::Partial).unwrap();
        assert_eq!(v, serde_json::json!("partial"));
        assert_eq!(RunOutcome::parse("PARTIAL"), Some(RunOutcome::Partial));
    }
}
