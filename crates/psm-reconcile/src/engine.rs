//! Reconciliation engine and the operations built on it.

use chrono::{DateTime, Utc};
use psm_fingerprint::{digest, verify};
use psm_ingest::{normalize_batch, NormalizedRecord};
use psm_schemas::{
    BatchRejection, Collection, CollectionId, CollectionKind, CollectionScope, Identity,
    ImportStats, Payload, PropertyRecord, RecordAction, RecordFailure, RunId, RunLogEntry, RunOutcome,
    RunStats,
};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::cancel::CancelFlag;
use crate::conflict::{detect, drift_warning, ConflictState};
use crate::context::SyncContext;
use crate::error::{RecordError, RunError, StoreError};
use crate::record::{new_source_record, new_target_record};
use crate::snapshot::{self, Mutation};
use crate::store::RecordStore;

/// Orchestrates runs over one [`RecordStore`].
#[derive(Debug, Clone)]
pub struct SyncEngine<S> {
    store: S,
}

impl<S: RecordStore> SyncEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    pub async fn create_collection(
        &self,
        ctx: &SyncContext,
        name: &str,
        kind: CollectionKind,
    ) -> Result<Collection, StoreError> {
        let c = self.store.create_collection(ctx.tenant_id, name, kind).await?;
        info!(tenant = %ctx.tenant_id, collection = %c.collection_id, name, kind = kind.as_str(), "collection created");
        Ok(c)
    }

    pub async fn list_collections(&self, ctx: &SyncContext) -> Result<Vec<Collection>, StoreError> {
        self.store.list_collections(ctx.tenant_id).await
    }

    /// Target records with their flag and warning, in insertion order.
    pub async fn list_target(
        &self,
        ctx: &SyncContext,
        target_id: CollectionId,
    ) -> Result<Vec<PropertyRecord>, StoreError> {
        let scope = CollectionScope::new(ctx.tenant_id, target_id);
        self.store.open_collection(scope, CollectionKind::Target).await?;
        self.store.list_records(scope).await
    }

    /// Source records as imported, in insertion order.
    pub async fn list_source(
        &self,
        ctx: &SyncContext,
        source_id: CollectionId,
    ) -> Result<Vec<PropertyRecord>, StoreError> {
        let scope = CollectionScope::new(ctx.tenant_id, source_id);
        self.store.open_collection(scope, CollectionKind::Source).await?;
        self.store.list_records(scope).await
    }

    /// Take a collection out of service. Its records and snapshots stay, but
    /// runs, imports and edits refuse to open it from now on.
    ///
    /// Refused while a run holds the collection as its target.
    pub async fn deactivate_collection(
        &self,
        ctx: &SyncContext,
        collection_id: CollectionId,
    ) -> Result<Collection, RunError> {
        let scope = CollectionScope::new(ctx.tenant_id, collection_id);
        let Some(lock) = self.store.try_lock_target(scope).await? else {
            warn!(tenant = %ctx.tenant_id, collection = %collection_id, "deactivate refused: run in progress");
            return Err(RunError::RunInProgress(scope));
        };

        let result = self.store.deactivate_collection(scope).await;

        if let Err(e) = self.store.release_lock(lock).await {
            warn!(tenant = %ctx.tenant_id, collection = %collection_id, error = %e, "run lock release failed");
        }
        let c = result?;
        info!(tenant = %ctx.tenant_id, collection = %collection_id, kind = c.kind.as_str(), "collection deactivated");
        Ok(c)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Reconcile every source record into the target.
    pub async fn reconcile(
        &self,
        ctx: &SyncContext,
        source_id: CollectionId,
        target_id: CollectionId,
        cancel: &CancelFlag,
    ) -> Result<RunStats, RunError> {
        self.run(ctx, source_id, target_id, None, cancel).await
    }

    /// Import `raws` into the source, then reconcile, under one run lock.
    /// Ingest rejections are reported on the run.
    pub async fn import_and_reconcile(
        &self,
        ctx: &SyncContext,
        source_id: CollectionId,
        target_id: CollectionId,
        raws: &[Value],
        cancel: &CancelFlag,
    ) -> Result<RunStats, RunError> {
        self.run(ctx, source_id, target_id, Some(raws), cancel).await
    }

    async fn run(
        &self,
        ctx: &SyncContext,
        source_id: CollectionId,
        target_id: CollectionId,
        raws: Option<&[Value]>,
        cancel: &CancelFlag,
    ) -> Result<RunStats, RunError> {
        let target = CollectionScope::new(ctx.tenant_id, target_id);
        let lock = match self.store.try_lock_target(target).await? {
            Some(lock) => lock,
            None => {
                warn!(tenant = %ctx.tenant_id, target = %target_id, "run refused: target locked");
                return Err(RunError::RunInProgress(target));
            }
        };

        let result = self.run_locked(ctx, source_id, target_id, raws, cancel).await;

        if let Err(e) = self.store.release_lock(lock).await {
            warn!(tenant = %ctx.tenant_id, target = %target_id, error = %e, "run lock release failed");
        }
        result
    }

    async fn run_locked(
        &self,
        ctx: &SyncContext,
        source_id: CollectionId,
        target_id: CollectionId,
        raws: Option<&[Value]>,
        cancel: &CancelFlag,
    ) -> Result<RunStats, RunError> {
        let source = CollectionScope::new(ctx.tenant_id, source_id);
        let target = CollectionScope::new(ctx.tenant_id, target_id);

        let run_id = RunId::new_random();
        let started_at = ctx.now();
        let entry = RunLogEntry::pending(run_id, ctx.tenant_id, source_id, target_id, started_at);
        self.store.begin_run(&entry).await?;
        info!(%run_id, tenant = %ctx.tenant_id, source = %source_id, target = %target_id, "run started");

        let mut stats = RunStats::new(run_id, started_at);

        let records = match self.open_pair(source, target).await {
            Ok(()) => {
                if let Some(raws) = raws {
                    let imported = self.import_into(ctx, source, raws).await;
                    for r in imported.rejections {
                        stats.record_rejection(r);
                    }
                    stats.failures.extend(imported.failures);
                }
                self.store.list_records(source).await
            }
            Err(e) => Err(e),
        };

        let records = match records {
            Ok(records) => records,
            Err(reason) => {
                stats.outcome = RunOutcome::Failed;
                stats.finished_at = Some(ctx.now());
                error!(%run_id, error = %reason, "run failed: cannot open collection");
                self.finalize(&entry, &stats, Some(format!("cannot open collection: {reason}")))
                    .await;
                return Err(RunError::CollectionUnavailable {
                    reason,
                    stats: Box::new(stats),
                });
            }
        };

        for src in records {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                warn!(%run_id, processed = stats.processed(), "run cancelled");
                break;
            }

            let identity = src.identity.clone();
            match self.sync_one(ctx, target, src).await {
                Ok(action) => stats.record(identity, action),
                Err(e) => {
                    error!(%run_id, identity = %identity, error = %e, "record failed");
                    stats.record_failure(identity, e.to_string());
                }
            }
        }

        stats.outcome = if stats.has_errors() || stats.cancelled {
            RunOutcome::Partial
        } else {
            RunOutcome::Success
        };
        stats.finished_at = Some(ctx.now());

        let message = stats.cancelled.then(|| "cancelled".to_string());
        self.finalize(&entry, &stats, message).await;

        info!(
            %run_id,
            outcome = stats.outcome.as_str(),
            created = stats.created,
            updated = stats.updated,
            skipped_unchanged = stats.skipped_unchanged,
            skipped_conflict = stats.skipped_conflict,
            rejected = stats.rejected,
            "run finished"
        );
        Ok(stats)
    }

    async fn open_pair(
        &self,
        source: CollectionScope,
        target: CollectionScope,
    ) -> Result<(), StoreError> {
        self.store.open_collection(source, CollectionKind::Source).await?;
        self.store.open_collection(target, CollectionKind::Target).await?;
        Ok(())
    }

    /// Finalization failures are logged; the caller still gets the stats.
    async fn finalize(&self, entry: &RunLogEntry, stats: &RunStats, message: Option<String>) {
        let done = entry.clone().finalized(stats, message);
        if let Err(e) = self.store.finish_run(&done).await {
            error!(run_id = %entry.run_id, error = %e, "run log finalize failed");
        }
    }

    /// Decide and apply the action for one source record.
    async fn sync_one(
        &self,
        ctx: &SyncContext,
        target: CollectionScope,
        src: PropertyRecord,
    ) -> Result<RecordAction, RecordError> {
        let incoming = digest(&src.payload)?;

        let Some(current) = self.store.get_record(target, &src.identity).await? else {
            let rec = new_target_record(src.identity, src.payload, ctx.now())?;
            self.store.insert_record(target, &rec).await?;
            return Ok(RecordAction::Created);
        };

        let state = detect(&current, &incoming);
        if let ConflictState::Conflicted { .. } = state {
            let warning = drift_warning(&state).unwrap_or_default();
            if !current.manual_change_flag
                || current.warning_message.as_deref() != Some(warning.as_str())
            {
                self.store
                    .flag_conflict(target, &current.identity, &warning)
                    .await?;
            }
            warn!(identity = %current.identity, %warning, "target modified out of band; skipped");
            return Ok(RecordAction::SkippedConflict);
        }

        if incoming == current.fingerprint {
            if current.manual_change_flag || current.warning_message.is_some() {
                self.store.clear_flag(target, &current.identity).await?;
            }
            return Ok(RecordAction::SkippedUnchanged);
        }

        snapshot::apply(
            &self.store,
            target,
            &current,
            src.payload,
            Mutation::Sync,
            ctx.now(),
        )
        .await?;
        Ok(RecordAction::Updated)
    }

    // -----------------------------------------------------------------------
    // Import
    // -----------------------------------------------------------------------

    /// Normalize `raws` and upsert them into a source collection.
    pub async fn import(
        &self,
        ctx: &SyncContext,
        source_id: CollectionId,
        raws: &[Value],
    ) -> Result<ImportStats, RunError> {
        let source = CollectionScope::new(ctx.tenant_id, source_id);
        self.store.open_collection(source, CollectionKind::Source).await?;
        Ok(self.import_into(ctx, source, raws).await)
    }

    async fn import_into(
        &self,
        ctx: &SyncContext,
        source: CollectionScope,
        raws: &[Value],
    ) -> ImportStats {
        let batch = normalize_batch(raws, &ctx.identity_fields);
        let mut stats = ImportStats {
            rejected: batch.rejections.len() as u64,
            rejections: batch.batch_rejections(),
            ..ImportStats::default()
        };
        for r in &batch.rejections {
            warn!(position = r.position, error = %r.error, "import rejected record");
        }

        for rec in batch.accepted {
            let position = rec.position;
            let identity = rec.identity.clone();
            match self.upsert_source(ctx, source, rec).await {
                Ok(RecordAction::Created) => stats.created += 1,
                Ok(RecordAction::Updated) => stats.updated += 1,
                Ok(_) => stats.unchanged += 1,
                Err(e) => {
                    error!(identity = %identity, error = %e, "import failed for record");
                    stats.rejected += 1;
                    stats.rejections.push(BatchRejection {
                        position,
                        identity: Some(identity.clone()),
                        reason: e.to_string(),
                    });
                    stats.failures.push(RecordFailure {
                        identity,
                        error: e.to_string(),
                    });
                }
            }
        }
        stats.rejections.sort_by_key(|r| r.position);

        info!(
            tenant = %ctx.tenant_id,
            source = %source.collection_id,
            created = stats.created,
            updated = stats.updated,
            unchanged = stats.unchanged,
            rejected = stats.rejected,
            "import finished"
        );
        stats
    }

    async fn upsert_source(
        &self,
        ctx: &SyncContext,
        source: CollectionScope,
        rec: NormalizedRecord,
    ) -> Result<RecordAction, RecordError> {
        let fingerprint = digest(&rec.payload)?;
        match self.store.get_record(source, &rec.identity).await? {
            None => {
                let new = new_source_record(rec.identity, rec.payload, ctx.now())?;
                self.store.insert_record(source, &new).await?;
                Ok(RecordAction::Created)
            }
            Some(current) if current.fingerprint == fingerprint => {
                Ok(RecordAction::SkippedUnchanged)
            }
            Some(current) => {
                snapshot::apply(
                    &self.store,
                    source,
                    &current,
                    rec.payload,
                    Mutation::Import,
                    ctx.now(),
                )
                .await?;
                Ok(RecordAction::Updated)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Out-of-band edits and conflict resolution
    // -----------------------------------------------------------------------

    /// Shallow-merge `patch` into a target record's payload.
    ///
    /// The record keeps its baseline, so the next run sees it as Conflicted.
    /// Identity fields cannot be changed.
    pub async fn edit_target(
        &self,
        ctx: &SyncContext,
        target_id: CollectionId,
        identity: &Identity,
        patch: &Value,
    ) -> Result<PropertyRecord, RecordError> {
        let target = CollectionScope::new(ctx.tenant_id, target_id);
        self.store.open_collection(target, CollectionKind::Target).await?;

        let patch = patch
            .as_object()
            .ok_or_else(|| RecordError::InvalidPatch("patch must be an object".to_string()))?;

        let current = self
            .store
            .get_record(target, identity)
            .await?
            .ok_or_else(|| RecordError::NotFound(identity.clone()))?;

        let mut merged = current.payload.clone();
        let map = merged.as_map_mut().ok_or_else(|| {
            RecordError::InvalidPatch(format!(
                "target payload is a {}, not a map",
                current.payload.kind()
            ))
        })?;

        for (k, v) in patch {
            let new_value = Payload::from(v);
            if ctx.identity_fields.candidates().any(|f| f == k)
                && map.get(k) != Some(&new_value)
            {
                return Err(RecordError::InvalidPatch(format!(
                    "identity field '{k}' is immutable"
                )));
            }
            map.insert(k.clone(), new_value);
        }

        if digest(&merged)? == current.fingerprint {
            return Ok(current);
        }

        let updated = snapshot::apply(
            &self.store,
            target,
            &current,
            merged,
            Mutation::ManualEdit,
            ctx.now(),
        )
        .await?;
        info!(tenant = %ctx.tenant_id, target = %target_id, identity = %identity, "target edited out of band");
        Ok(updated)
    }

    /// Resolve a conflict by overwriting the target record from the source.
    pub async fn accept_source(
        &self,
        ctx: &SyncContext,
        source_id: CollectionId,
        target_id: CollectionId,
        identity: &Identity,
    ) -> Result<PropertyRecord, RunError> {
        let target = CollectionScope::new(ctx.tenant_id, target_id);
        let lock = match self.store.try_lock_target(target).await? {
            Some(lock) => lock,
            None => return Err(RunError::RunInProgress(target)),
        };

        let result = self.accept_source_locked(ctx, source_id, target, identity).await;

        if let Err(e) = self.store.release_lock(lock).await {
            warn!(tenant = %ctx.tenant_id, target = %target_id, error = %e, "run lock release failed");
        }
        result
    }

    async fn accept_source_locked(
        &self,
        ctx: &SyncContext,
        source_id: CollectionId,
        target: CollectionScope,
        identity: &Identity,
    ) -> Result<PropertyRecord, RunError> {
        let source = CollectionScope::new(ctx.tenant_id, source_id);
        self.open_pair(source, target).await?;

        let record_err = |error: RecordError| RunError::Record {
            identity: identity.clone(),
            error,
        };

        let src = self
            .store
            .get_record(source, identity)
            .await
            .map_err(|e| record_err(e.into()))?
            .ok_or_else(|| record_err(RecordError::NotFound(identity.clone())))?;

        let current = self
            .store
            .get_record(target, identity)
            .await
            .map_err(|e| record_err(e.into()))?;

        let resolved = match current {
            None => {
                let rec = new_target_record(src.identity, src.payload, ctx.now())
                    .map_err(|e| record_err(e.into()))?;
                self.store
                    .insert_record(target, &rec)
                    .await
                    .map_err(|e| record_err(e.into()))?;
                rec
            }
            Some(current) if Self::in_step_with(&current, &src).map_err(record_err)? => {
                if current.manual_change_flag || current.warning_message.is_some() {
                    self.store
                        .clear_flag(target, identity)
                        .await
                        .map_err(|e| record_err(e.into()))?;
                }
                info!(tenant = %ctx.tenant_id, target = %target.collection_id, identity = %identity, "target already matches source; nothing to overwrite");
                return Ok(PropertyRecord {
                    manual_change_flag: false,
                    warning_message: None,
                    ..current
                });
            }
            Some(current) => snapshot::apply(
                &self.store,
                target,
                &current,
                src.payload,
                Mutation::Sync,
                ctx.now(),
            )
            .await
            .map_err(record_err)?,
        };

        info!(tenant = %ctx.tenant_id, target = %target.collection_id, identity = %identity, "source accepted over manual edit");
        Ok(resolved)
    }

    /// Target content and baseline both equal the source payload.
    fn in_step_with(target: &PropertyRecord, src: &PropertyRecord) -> Result<bool, RecordError> {
        Ok(verify(&src.payload, &target.fingerprint)?
            && target.source_fingerprint.as_ref() == Some(&target.fingerprint))
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Apply the context's retention horizon at `now`.
    pub async fn cleanup(&self, ctx: &SyncContext, now: DateTime<Utc>) -> Result<u64, StoreError> {
        snapshot::cleanup(&self.store, ctx.tenant_id, ctx.retention, now).await
    }
}
