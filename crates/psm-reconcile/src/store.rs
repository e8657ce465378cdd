//! Storage seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psm_schemas::{
    Collection, CollectionKind, CollectionScope, Fingerprint, Identity, Payload, PropertyRecord,
    RunLogEntry, Snapshot, TenantId,
};

use crate::error::StoreError;

/// New state for an existing record, committed together with a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub identity: Identity,
    pub payload: Payload,
    pub fingerprint: Fingerprint,
    pub source_fingerprint: Option<Fingerprint>,
    pub manual_change_flag: bool,
    pub warning_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent record store shared by every operation.
///
/// Implementations must scope every call by tenant and must make
/// [`RecordStore::commit_update`] atomic.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Held for the duration of a run. Dropping it must free the scope.
    type Lock: Send + 'static;

    async fn create_collection(
        &self,
        tenant_id: TenantId,
        name: &str,
        kind: CollectionKind,
    ) -> Result<Collection, StoreError>;

    async fn list_collections(&self, tenant_id: TenantId) -> Result<Vec<Collection>, StoreError>;

    /// Fails unless the collection exists, has `kind` and is active.
    async fn open_collection(
        &self,
        scope: CollectionScope,
        kind: CollectionKind,
    ) -> Result<Collection, StoreError>;

    /// Mark a collection inactive. Records and snapshots are kept; runs and
    /// edits refuse to open it afterwards. Idempotent.
    async fn deactivate_collection(&self, scope: CollectionScope)
        -> Result<Collection, StoreError>;

    /// All records in insertion order.
    async fn list_records(&self, scope: CollectionScope) -> Result<Vec<PropertyRecord>, StoreError>;

    async fn get_record(
        &self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<Option<PropertyRecord>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] if the identity is taken.
    async fn insert_record(
        &self,
        scope: CollectionScope,
        record: &PropertyRecord,
    ) -> Result<(), StoreError>;

    /// Insert `snapshot` and apply `update` in one transaction.
    ///
    /// Refuses with [`StoreError::StaleWrite`] when the stored fingerprint no
    /// longer equals `snapshot.fingerprint`. On error neither write is visible.
    async fn commit_update(
        &self,
        snapshot: &Snapshot,
        update: &RecordUpdate,
    ) -> Result<(), StoreError>;

    /// Set the manual-change flag and warning. Payload, fingerprints and
    /// `updated_at` are untouched.
    async fn flag_conflict(
        &self,
        scope: CollectionScope,
        identity: &Identity,
        warning: &str,
    ) -> Result<(), StoreError>;

    /// Clear the manual-change flag and warning. Payload untouched.
    async fn clear_flag(&self, scope: CollectionScope, identity: &Identity)
        -> Result<(), StoreError>;

    /// Snapshots of one record, oldest first.
    async fn list_snapshots(
        &self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// Delete every snapshot of the tenant captured strictly before `cutoff`.
    async fn delete_snapshots_before(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn begin_run(&self, entry: &RunLogEntry) -> Result<(), StoreError>;

    /// Finalize a pending run. A run is finalized at most once.
    async fn finish_run(&self, entry: &RunLogEntry) -> Result<(), StoreError>;

    /// `Ok(None)` when another holder has the scope.
    async fn try_lock_target(
        &self,
        scope: CollectionScope,
    ) -> Result<Option<Self::Lock>, StoreError>;

    async fn release_lock(&self, lock: Self::Lock) -> Result<(), StoreError> {
        drop(lock);
        Ok(())
    }
}
