//! In-memory `RecordStore`.
//!
//! All state sits behind one mutex, so every trait call is atomic. Faults can
//! be injected per identity to exercise failure isolation, and snapshots can
//! be planted at arbitrary timestamps for retention tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psm_reconcile::{CancelFlag, RecordStore, RecordUpdate, StoreError};
use psm_schemas::{
    Collection, CollectionId, CollectionKind, CollectionScope, Identity, Payload, PropertyRecord,
    RunId, RunLogEntry, RunOutcome, Snapshot, SnapshotId, TenantId,
};

#[derive(Debug, Default)]
struct Table {
    order: Vec<Identity>,
    rows: BTreeMap<Identity, PropertyRecord>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_get: HashSet<Identity>,
    fail_commit: HashSet<Identity>,
    fail_insert: HashSet<Identity>,
    /// Out-of-band edits applied just before the next commit for an identity.
    race_on_commit: BTreeMap<Identity, Payload>,
    cancel_after_writes: Option<(u64, CancelFlag)>,
}

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<CollectionId, Collection>,
    tables: BTreeMap<CollectionScope, Table>,
    snapshots: Vec<Snapshot>,
    runs: BTreeMap<RunId, RunLogEntry>,
    writes: u64,
    faults: Faults,
}

/// Cloneable handle; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    locks: Arc<Mutex<HashSet<CollectionScope>>>,
}

/// Run lock. Frees its scope on drop.
#[derive(Debug)]
pub struct MemoryLock {
    scope: CollectionScope,
    held: Arc<Mutex<HashSet<CollectionScope>>>,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.scope);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))
    }

    fn state_unchecked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// `get_record` for `identity` fails with a backend error.
    pub fn fail_get(&self, identity: impl Into<Identity>) {
        self.state_unchecked().faults.fail_get.insert(identity.into());
    }

    /// `commit_update` for `identity` fails with a backend error.
    pub fn fail_commit(&self, identity: impl Into<Identity>) {
        self.state_unchecked().faults.fail_commit.insert(identity.into());
    }

    /// `insert_record` for `identity` fails with a backend error.
    pub fn fail_insert(&self, identity: impl Into<Identity>) {
        self.state_unchecked().faults.fail_insert.insert(identity.into());
    }

    /// Simulate an out-of-band edit landing between read and commit.
    pub fn race_edit_on_commit(&self, identity: impl Into<Identity>, payload: Payload) {
        self.state_unchecked()
            .faults
            .race_on_commit
            .insert(identity.into(), payload);
    }

    /// Trip `flag` once `n` record writes have been committed.
    pub fn cancel_after_writes(&self, n: u64, flag: CancelFlag) {
        self.state_unchecked().faults.cancel_after_writes = Some((n, flag));
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn runs(&self) -> Vec<RunLogEntry> {
        let mut runs: Vec<_> = self.state_unchecked().runs.values().cloned().collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    pub fn snapshot_count(&self) -> usize {
        self.state_unchecked().snapshots.len()
    }

    pub fn all_snapshots(&self) -> Vec<Snapshot> {
        self.state_unchecked().snapshots.clone()
    }

    pub fn is_locked(&self, scope: CollectionScope) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&scope)
    }

    /// Plant a snapshot captured at `at`, bypassing the engine.
    pub fn plant_snapshot(
        &self,
        scope: CollectionScope,
        identity: impl Into<Identity>,
        payload: Payload,
        at: DateTime<Utc>,
    ) -> Result<SnapshotId, psm_fingerprint::EncodingError> {
        let fingerprint = psm_fingerprint::digest(&payload)?;
        let snapshot_id = SnapshotId::new_random();
        self.state_unchecked().snapshots.push(Snapshot {
            snapshot_id,
            scope,
            identity: identity.into(),
            payload,
            fingerprint,
            captured_at: at,
        });
        Ok(snapshot_id)
    }

    /// Overwrite a stored record verbatim, fingerprint included.
    pub fn overwrite_raw(&self, scope: CollectionScope, record: PropertyRecord) {
        let mut st = self.state_unchecked();
        let table = st.tables.entry(scope).or_default();
        if !table.rows.contains_key(&record.identity) {
            table.order.push(record.identity.clone());
        }
        table.rows.insert(record.identity.clone(), record);
    }
}

fn backend(msg: &str, identity: &Identity) -> StoreError {
    StoreError::Backend(format!("injected {msg} failure for '{identity}'"))
}

impl Inner {
    fn note_write(&mut self) {
        self.writes += 1;
        if let Some((n, flag)) = &self.faults.cancel_after_writes {
            if self.writes >= *n {
                flag.cancel();
            }
        }
    }

    fn table_mut(
        &mut self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<&mut PropertyRecord, StoreError> {
        self.tables
            .get_mut(&scope)
            .and_then(|t| t.rows.get_mut(identity))
            .ok_or_else(|| StoreError::RecordNotFound(identity.clone()))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    type Lock = MemoryLock;

    async fn create_collection(
        &self,
        tenant_id: TenantId,
        name: &str,
        kind: CollectionKind,
    ) -> Result<Collection, StoreError> {
        let mut st = self.state()?;
        let taken = st
            .collections
            .values()
            .any(|c| c.tenant_id == tenant_id && c.name == name && c.kind == kind);
        if taken {
            return Err(StoreError::AlreadyExists(format!(
                "{} collection '{name}'",
                kind.as_str()
            )));
        }
        let c = Collection {
            collection_id: CollectionId::new_random(),
            tenant_id,
            name: name.to_string(),
            kind,
            is_active: true,
            created_at: Utc::now(),
        };
        st.collections.insert(c.collection_id, c.clone());
        Ok(c)
    }

    async fn list_collections(&self, tenant_id: TenantId) -> Result<Vec<Collection>, StoreError> {
        let st = self.state()?;
        let mut out: Vec<_> = st
            .collections
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.kind.as_str().cmp(b.kind.as_str())));
        Ok(out)
    }

    async fn open_collection(
        &self,
        scope: CollectionScope,
        kind: CollectionKind,
    ) -> Result<Collection, StoreError> {
        let st = self.state()?;
        let c = st
            .collections
            .get(&scope.collection_id)
            .filter(|c| c.tenant_id == scope.tenant_id)
            .ok_or(StoreError::CollectionNotFound(scope))?;
        if c.kind != kind {
            return Err(StoreError::WrongKind {
                collection_id: c.collection_id,
                expected: kind,
                found: c.kind,
            });
        }
        if !c.is_active {
            return Err(StoreError::Inactive(c.collection_id));
        }
        Ok(c.clone())
    }

    async fn deactivate_collection(&self, scope: CollectionScope) -> Result<Collection, StoreError> {
        let mut st = self.state()?;
        let c = st
            .collections
            .get_mut(&scope.collection_id)
            .filter(|c| c.tenant_id == scope.tenant_id)
            .ok_or(StoreError::CollectionNotFound(scope))?;
        c.is_active = false;
        Ok(c.clone())
    }

    async fn list_records(&self, scope: CollectionScope) -> Result<Vec<PropertyRecord>, StoreError> {
        let st = self.state()?;
        Ok(st
            .tables
            .get(&scope)
            .map(|t| {
                t.order
                    .iter()
                    .filter_map(|id| t.rows.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_record(
        &self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<Option<PropertyRecord>, StoreError> {
        let st = self.state()?;
        if st.faults.fail_get.contains(identity) {
            return Err(backend("read", identity));
        }
        Ok(st
            .tables
            .get(&scope)
            .and_then(|t| t.rows.get(identity))
            .cloned())
    }

    async fn insert_record(
        &self,
        scope: CollectionScope,
        record: &PropertyRecord,
    ) -> Result<(), StoreError> {
        let mut st = self.state()?;
        if st.faults.fail_insert.contains(&record.identity) {
            return Err(backend("insert", &record.identity));
        }
        let table = st.tables.entry(scope).or_default();
        if table.rows.contains_key(&record.identity) {
            return Err(StoreError::AlreadyExists(format!(
                "record '{}'",
                record.identity
            )));
        }
        table.order.push(record.identity.clone());
        table.rows.insert(record.identity.clone(), record.clone());
        st.note_write();
        Ok(())
    }

    async fn commit_update(
        &self,
        snapshot: &Snapshot,
        update: &RecordUpdate,
    ) -> Result<(), StoreError> {
        let mut st = self.state()?;
        let identity = &update.identity;
        if st.faults.fail_commit.contains(identity) {
            return Err(backend("commit", identity));
        }

        if let Some(payload) = st.faults.race_on_commit.remove(identity) {
            let fingerprint = psm_fingerprint::digest(&payload)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let row = st.table_mut(snapshot.scope, identity)?;
            row.payload = payload;
            row.fingerprint = fingerprint;
        }

        let row = st.table_mut(snapshot.scope, identity)?;
        if row.fingerprint != snapshot.fingerprint {
            return Err(StoreError::StaleWrite {
                identity: identity.clone(),
            });
        }
        row.payload = update.payload.clone();
        row.fingerprint = update.fingerprint.clone();
        row.source_fingerprint = update.source_fingerprint.clone();
        row.manual_change_flag = update.manual_change_flag;
        row.warning_message = update.warning_message.clone();
        row.updated_at = update.updated_at;

        st.snapshots.push(snapshot.clone());
        st.note_write();
        Ok(())
    }

    async fn flag_conflict(
        &self,
        scope: CollectionScope,
        identity: &Identity,
        warning: &str,
    ) -> Result<(), StoreError> {
        let mut st = self.state()?;
        let row = st.table_mut(scope, identity)?;
        row.manual_change_flag = true;
        row.warning_message = Some(warning.to_string());
        Ok(())
    }

    async fn clear_flag(
        &self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<(), StoreError> {
        let mut st = self.state()?;
        let row = st.table_mut(scope, identity)?;
        row.manual_change_flag = false;
        row.warning_message = None;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let st = self.state()?;
        let mut out: Vec<_> = st
            .snapshots
            .iter()
            .filter(|s| s.scope == scope && s.identity == *identity)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.captured_at);
        Ok(out)
    }

    async fn delete_snapshots_before(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut st = self.state()?;
        let before = st.snapshots.len();
        st.snapshots
            .retain(|s| !(s.scope.tenant_id == tenant_id && s.captured_at < cutoff));
        Ok((before - st.snapshots.len()) as u64)
    }

    async fn begin_run(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        let mut st = self.state()?;
        if st.runs.contains_key(&entry.run_id) {
            return Err(StoreError::AlreadyExists(format!("run {}", entry.run_id)));
        }
        st.runs.insert(entry.run_id, entry.clone());
        Ok(())
    }

    async fn finish_run(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        let mut st = self.state()?;
        let row = st
            .runs
            .get_mut(&entry.run_id)
            .ok_or_else(|| StoreError::Backend(format!("run {} not begun", entry.run_id)))?;
        if row.outcome != RunOutcome::Pending {
            return Err(StoreError::Backend(format!(
                "run {} already finalized",
                entry.run_id
            )));
        }
        *row = entry.clone();
        Ok(())
    }

    async fn try_lock_target(
        &self,
        scope: CollectionScope,
    ) -> Result<Option<Self::Lock>, StoreError> {
        let mut held = self
            .locks
            .lock()
            .map_err(|_| StoreError::Backend("lock table poisoned".to_string()))?;
        if !held.insert(scope) {
            return Ok(None);
        }
        Ok(Some(MemoryLock {
            scope,
            held: self.locks.clone(),
        }))
    }
}
