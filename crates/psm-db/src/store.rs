//! `RecordStore` over Postgres.
//!
//! Queries return `anyhow::Result` with context; the trait impl at the bottom
//! maps them to `StoreError`.
//!
//! Payloads are bound through `Payload::to_json`, which writes large integral
//! floats as integers. `jsonb` returns numbers in that form, so a payload read
//! back fingerprints the same as the one written.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psm_reconcile::{RecordStore, RecordUpdate, StoreError};
use psm_schemas::{
    Collection, CollectionId, CollectionKind, CollectionScope, Fingerprint, Identity, Payload,
    PropertyRecord, RunLogEntry, Snapshot, TenantId,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::lock::PgLock;

/// Cloneable handle; clones share the pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

enum CommitOutcome {
    Committed,
    Missing,
    Stale,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    async fn insert_collection(&self, c: &Collection) -> Result<()> {
        sqlx::query(
            r#"
            insert into collections (collection_id, tenant_id, name, kind, is_active, created_at)
            values ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(c.collection_id.as_uuid())
        .bind(c.tenant_id.as_uuid())
        .bind(&c.name)
        .bind(c.kind.as_str())
        .bind(c.is_active)
        .bind(c.created_at)
        .execute(&self.pool)
        .await
        .context("insert_collection failed")?;
        Ok(())
    }

    async fn fetch_collections(&self, tenant_id: TenantId) -> Result<Vec<Collection>> {
        let rows = sqlx::query(
            r#"
            select collection_id, tenant_id, name, kind, is_active, created_at
            from collections
            where tenant_id = $1
            order by name, kind
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .context("fetch_collections failed")?;

        rows.iter().map(collection_from_row).collect()
    }

    async fn fetch_collection(&self, scope: CollectionScope) -> Result<Option<Collection>> {
        let row = sqlx::query(
            r#"
            select collection_id, tenant_id, name, kind, is_active, created_at
            from collections
            where tenant_id = $1 and collection_id = $2
            "#,
        )
        .bind(scope.tenant_id.as_uuid())
        .bind(scope.collection_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .context("fetch_collection failed")?;

        row.as_ref().map(collection_from_row).transpose()
    }

    /// Mark a collection inactive; runs refuse to open it afterwards. Records
    /// and snapshots stay. `None` when the collection does not exist.
    async fn mark_inactive(&self, scope: CollectionScope) -> Result<Option<Collection>> {
        let row = sqlx::query(
            r#"
            update collections set is_active = false
            where tenant_id = $1 and collection_id = $2
            returning collection_id, tenant_id, name, kind, is_active, created_at
            "#,
        )
        .bind(scope.tenant_id.as_uuid())
        .bind(scope.collection_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .context("deactivate_collection failed")?;

        row.as_ref().map(collection_from_row).transpose()
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    async fn fetch_records(&self, scope: CollectionScope) -> Result<Vec<PropertyRecord>> {
        let rows = sqlx::query(
            r#"
            select identity, payload, fingerprint, source_fingerprint,
                   manual_change_flag, warning_message, created_at, updated_at
            from properties
            where tenant_id = $1 and collection_id = $2
            order by seq
            "#,
        )
        .bind(scope.tenant_id.as_uuid())
        .bind(scope.collection_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .context("fetch_records failed")?;

        rows.iter().map(record_from_row).collect()
    }

    async fn fetch_record(
        &self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<Option<PropertyRecord>> {
        let row = sqlx::query(
            r#"
            select identity, payload, fingerprint, source_fingerprint,
                   manual_change_flag, warning_message, created_at, updated_at
            from properties
            where tenant_id = $1 and collection_id = $2 and identity = $3
            "#,
        )
        .bind(scope.tenant_id.as_uuid())
        .bind(scope.collection_id.as_uuid())
        .bind(identity.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("fetch_record failed")?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert_property(&self, scope: CollectionScope, r: &PropertyRecord) -> Result<()> {
        sqlx::query(
            r#"
            insert into properties (
              tenant_id, collection_id, identity, payload, fingerprint, source_fingerprint,
              manual_change_flag, warning_message, created_at, updated_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            )
            "#,
        )
        .bind(scope.tenant_id.as_uuid())
        .bind(scope.collection_id.as_uuid())
        .bind(r.identity.as_str())
        .bind(r.payload.to_json())
        .bind(r.fingerprint.as_str())
        .bind(r.source_fingerprint.as_ref().map(Fingerprint::as_str))
        .bind(r.manual_change_flag)
        .bind(r.warning_message.as_deref())
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&self.pool)
        .await
        .context("insert_property failed")?;
        Ok(())
    }

    /// Snapshot insert and record update in one transaction, guarded by a
    /// row lock on the current fingerprint.
    async fn commit_in_tx(&self, snapshot: &Snapshot, update: &RecordUpdate) -> Result<CommitOutcome> {
        let scope = snapshot.scope;
        let mut tx = self.pool.begin().await.context("begin commit_update tx")?;

        let current: Option<(String,)> = sqlx::query_as::<_, (String,)>(
            r#"
            select fingerprint
            from properties
            where tenant_id = $1 and collection_id = $2 and identity = $3
            for update
            "#,
        )
        .bind(scope.tenant_id.as_uuid())
        .bind(scope.collection_id.as_uuid())
        .bind(update.identity.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("commit_update row lock failed")?;

        match current {
            None => return Ok(CommitOutcome::Missing),
            Some((fp,)) if fp != snapshot.fingerprint.as_str() => return Ok(CommitOutcome::Stale),
            Some(_) => {}
        }

        sqlx::query(
            r#"
            insert into property_snapshots (
              snapshot_id, tenant_id, collection_id, identity, payload, fingerprint, captured_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7
            )
            "#,
        )
        .bind(snapshot.snapshot_id.as_uuid())
        .bind(scope.tenant_id.as_uuid())
        .bind(scope.collection_id.as_uuid())
        .bind(snapshot.identity.as_str())
        .bind(snapshot.payload.to_json())
        .bind(snapshot.fingerprint.as_str())
        .bind(snapshot.captured_at)
        .execute(&mut *tx)
        .await
        .context("insert snapshot failed")?;

        sqlx::query(
            r#"
            update properties
            set payload = $4,
                fingerprint = $5,
                source_fingerprint = $6,
                manual_change_flag = $7,
                warning_message = $8,
                updated_at = $9
            where tenant_id = $1 and collection_id = $2 and identity = $3
            "#,
        )
        .bind(scope.tenant_id.as_uuid())
        .bind(scope.collection_id.as_uuid())
        .bind(update.identity.as_str())
        .bind(update.payload.to_json())
        .bind(update.fingerprint.as_str())
        .bind(update.source_fingerprint.as_ref().map(Fingerprint::as_str))
        .bind(update.manual_change_flag)
        .bind(update.warning_message.as_deref())
        .bind(update.updated_at)
        .execute(&mut *tx)
        .await
        .context("update property failed")?;

        tx.commit().await.context("commit_update commit failed")?;
        Ok(CommitOutcome::Committed)
    }

    async fn set_flag(
        &self,
        scope: CollectionScope,
        identity: &Identity,
        flag: bool,
        warning: Option<&str>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update properties
            set manual_change_flag = $4,
                warning_message = $5
            where tenant_id = $1 and collection_id = $2 and identity = $3
            "#,
        )
        .bind(scope.tenant_id.as_uuid())
        .bind(scope.collection_id.as_uuid())
        .bind(identity.as_str())
        .bind(flag)
        .bind(warning)
        .execute(&self.pool)
        .await
        .context("set_flag failed")?;
        Ok(res.rows_affected() == 1)
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    async fn fetch_snapshots(
        &self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query(
            r#"
            select snapshot_id, identity, payload, fingerprint, captured_at
            from property_snapshots
            where tenant_id = $1 and collection_id = $2 and identity = $3
            order by captured_at
            "#,
        )
        .bind(scope.tenant_id.as_uuid())
        .bind(scope.collection_id.as_uuid())
        .bind(identity.as_str())
        .fetch_all(&self.pool)
        .await
        .context("fetch_snapshots failed")?;

        rows.iter()
            .map(|row| -> Result<Snapshot> {
                Ok(Snapshot {
                    snapshot_id: row.try_get::<Uuid, _>("snapshot_id")?.into(),
                    scope,
                    identity: Identity::new(row.try_get::<String, _>("identity")?),
                    payload: Payload::from(row.try_get::<Value, _>("payload")?),
                    fingerprint: Fingerprint::from_hex(row.try_get::<String, _>("fingerprint")?),
                    captured_at: row.try_get("captured_at")?,
                })
            })
            .collect()
    }

    async fn purge_snapshots(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            "delete from property_snapshots where tenant_id = $1 and captured_at < $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("purge_snapshots failed")?;
        Ok(res.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Run log
    // -----------------------------------------------------------------------

    async fn insert_run(&self, e: &RunLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            insert into sync_runs (run_id, tenant_id, source_id, target_id, status, started_at)
            values ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(e.run_id.as_uuid())
        .bind(e.tenant_id.as_uuid())
        .bind(e.source_id.as_uuid())
        .bind(e.target_id.as_uuid())
        .bind(e.outcome.as_str())
        .bind(e.started_at)
        .execute(&self.pool)
        .await
        .context("insert_run failed")?;
        Ok(())
    }

    /// Only a PENDING run moves; returns false otherwise.
    async fn close_run(&self, e: &RunLogEntry) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update sync_runs
            set status = $2,
                created = $3,
                updated = $4,
                skipped_unchanged = $5,
                skipped_conflict = $6,
                rejected = $7,
                message = $8,
                finished_at = $9
            where run_id = $1
              and status = 'PENDING'
            "#,
        )
        .bind(e.run_id.as_uuid())
        .bind(e.outcome.as_str())
        .bind(e.created as i64)
        .bind(e.updated as i64)
        .bind(e.skipped_unchanged as i64)
        .bind(e.skipped_conflict as i64)
        .bind(e.rejected as i64)
        .bind(e.message.as_deref())
        .bind(e.finished_at)
        .execute(&self.pool)
        .await
        .context("close_run failed")?;
        Ok(res.rows_affected() == 1)
    }
}

fn collection_from_row(row: &PgRow) -> Result<Collection> {
    let kind: String = row.try_get("kind")?;
    Ok(Collection {
        collection_id: row.try_get::<Uuid, _>("collection_id")?.into(),
        tenant_id: row.try_get::<Uuid, _>("tenant_id")?.into(),
        name: row.try_get("name")?,
        kind: CollectionKind::parse(&kind)
            .with_context(|| format!("invalid collection kind: {kind}"))?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<PropertyRecord> {
    Ok(PropertyRecord {
        identity: Identity::new(row.try_get::<String, _>("identity")?),
        payload: Payload::from(row.try_get::<Value, _>("payload")?),
        fingerprint: Fingerprint::from_hex(row.try_get::<String, _>("fingerprint")?),
        source_fingerprint: row
            .try_get::<Option<String>, _>("source_fingerprint")?
            .map(Fingerprint::from_hex),
        manual_change_flag: row.try_get("manual_change_flag")?,
        warning_message: row.try_get("warning_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Postgres unique_violation (23505), optionally on a named constraint.
fn is_unique_violation(err: &anyhow::Error, constraint: &str) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

fn backend(err: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

#[async_trait]
impl RecordStore for PgStore {
    type Lock = PgLock;

    async fn create_collection(
        &self,
        tenant_id: TenantId,
        name: &str,
        kind: CollectionKind,
    ) -> Result<Collection, StoreError> {
        let c = Collection {
            collection_id: CollectionId::new_random(),
            tenant_id,
            name: name.to_string(),
            kind,
            is_active: true,
            created_at: Utc::now(),
        };
        match self.insert_collection(&c).await {
            Ok(()) => Ok(c),
            Err(e) if is_unique_violation(&e, "uq_collections_tenant_name_kind") => Err(
                StoreError::AlreadyExists(format!("{} collection '{name}'", kind.as_str())),
            ),
            Err(e) => Err(backend(e)),
        }
    }

    async fn list_collections(&self, tenant_id: TenantId) -> Result<Vec<Collection>, StoreError> {
        self.fetch_collections(tenant_id).await.map_err(backend)
    }

    async fn open_collection(
        &self,
        scope: CollectionScope,
        kind: CollectionKind,
    ) -> Result<Collection, StoreError> {
        let c = self
            .fetch_collection(scope)
            .await
            .map_err(backend)?
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
        Ok(c)
    }

    async fn deactivate_collection(&self, scope: CollectionScope) -> Result<Collection, StoreError> {
        self.mark_inactive(scope)
            .await
            .map_err(backend)?
            .ok_or(StoreError::CollectionNotFound(scope))
    }

    async fn list_records(&self, scope: CollectionScope) -> Result<Vec<PropertyRecord>, StoreError> {
        self.fetch_records(scope).await.map_err(backend)
    }

    async fn get_record(
        &self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<Option<PropertyRecord>, StoreError> {
        self.fetch_record(scope, identity).await.map_err(backend)
    }

    async fn insert_record(
        &self,
        scope: CollectionScope,
        record: &PropertyRecord,
    ) -> Result<(), StoreError> {
        match self.insert_property(scope, record).await {
            Ok(()) => Ok(()),
            Err(e) if is_unique_violation(&e, "uq_properties_identity") => Err(
                StoreError::AlreadyExists(format!("record '{}'", record.identity)),
            ),
            Err(e) => Err(backend(e)),
        }
    }

    async fn commit_update(
        &self,
        snapshot: &Snapshot,
        update: &RecordUpdate,
    ) -> Result<(), StoreError> {
        match self.commit_in_tx(snapshot, update).await.map_err(backend)? {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::Missing => Err(StoreError::RecordNotFound(update.identity.clone())),
            CommitOutcome::Stale => Err(StoreError::StaleWrite {
                identity: update.identity.clone(),
            }),
        }
    }

    async fn flag_conflict(
        &self,
        scope: CollectionScope,
        identity: &Identity,
        warning: &str,
    ) -> Result<(), StoreError> {
        if self
            .set_flag(scope, identity, true, Some(warning))
            .await
            .map_err(backend)?
        {
            Ok(())
        } else {
            Err(StoreError::RecordNotFound(identity.clone()))
        }
    }

    async fn clear_flag(
        &self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<(), StoreError> {
        if self
            .set_flag(scope, identity, false, None)
            .await
            .map_err(backend)?
        {
            Ok(())
        } else {
            Err(StoreError::RecordNotFound(identity.clone()))
        }
    }

    async fn list_snapshots(
        &self,
        scope: CollectionScope,
        identity: &Identity,
    ) -> Result<Vec<Snapshot>, StoreError> {
        self.fetch_snapshots(scope, identity).await.map_err(backend)
    }

    async fn delete_snapshots_before(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.purge_snapshots(tenant_id, cutoff).await.map_err(backend)
    }

    async fn begin_run(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        self.insert_run(entry).await.map_err(backend)
    }

    async fn finish_run(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        if self.close_run(entry).await.map_err(backend)? {
            Ok(())
        } else {
            Err(StoreError::Backend(format!(
                "run {} is not pending",
                entry.run_id
            )))
        }
    }

    async fn try_lock_target(
        &self,
        scope: CollectionScope,
    ) -> Result<Option<Self::Lock>, StoreError> {
        PgLock::try_acquire(&self.pool, scope).await.map_err(backend)
    }

    async fn release_lock(&self, lock: Self::Lock) -> Result<(), StoreError> {
        lock.release().await.map_err(backend)
    }
}
