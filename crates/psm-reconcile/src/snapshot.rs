//! Snapshot capture, snapshot-guarded mutation and retention.

use chrono::{DateTime, Duration, Utc};
use psm_fingerprint::digest;
use psm_schemas::{CollectionScope, Payload, PropertyRecord, Snapshot, SnapshotId, TenantId};
use tracing::{debug, info, warn};

use crate::conflict::manual_edit_warning;
use crate::error::{RecordError, StoreError};
use crate::store::{RecordStore, RecordUpdate};

/// How the baseline and flag move with a payload write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Engine write to a target: baseline follows content, flag cleared.
    Sync,
    /// Out-of-band target edit: baseline kept, flag set.
    ManualEdit,
    /// Source import: no baseline, no flag.
    Import,
}

/// Pure pre-mutation copy of `record`.
pub fn capture(scope: CollectionScope, record: &PropertyRecord, at: DateTime<Utc>) -> Snapshot {
    Snapshot {
        snapshot_id: SnapshotId::new_random(),
        scope,
        identity: record.identity.clone(),
        payload: record.payload.clone(),
        fingerprint: record.fingerprint.clone(),
        captured_at: at,
    }
}

/// Smallest `updated_at` a write following a snapshot at `captured_at` may use.
pub fn next_updated_at(captured_at: DateTime<Utc>) -> DateTime<Utc> {
    captured_at + Duration::microseconds(1)
}

/// Snapshot `current`, then replace its payload, in one store transaction.
///
/// Returns the record as stored. On error nothing was written.
pub async fn apply<S: RecordStore + ?Sized>(
    store: &S,
    scope: CollectionScope,
    current: &PropertyRecord,
    new_payload: Payload,
    mutation: Mutation,
    at: DateTime<Utc>,
) -> Result<PropertyRecord, RecordError> {
    let fingerprint = digest(&new_payload)?;

    // Never move updated_at backwards even if the clock did.
    let captured_at = at.max(current.updated_at);
    let snapshot = capture(scope, current, captured_at);
    let updated_at = next_updated_at(captured_at);

    let (source_fingerprint, manual_change_flag, warning_message) = match mutation {
        Mutation::Sync => (Some(fingerprint.clone()), false, None),
        Mutation::Import => (None, false, None),
        Mutation::ManualEdit => {
            let baseline = current
                .source_fingerprint
                .clone()
                .unwrap_or_else(|| current.fingerprint.clone());
            let warning = manual_edit_warning(&baseline, &fingerprint);
            (current.source_fingerprint.clone(), true, Some(warning))
        }
    };

    let update = RecordUpdate {
        identity: current.identity.clone(),
        payload: new_payload,
        fingerprint,
        source_fingerprint,
        manual_change_flag,
        warning_message,
        updated_at,
    };

    store.commit_update(&snapshot, &update).await?;
    debug!(
        identity = %update.identity,
        snapshot_id = %snapshot.snapshot_id,
        from = snapshot.fingerprint.short(),
        to = update.fingerprint.short(),
        "snapshot committed with update"
    );

    Ok(PropertyRecord {
        identity: update.identity,
        payload: update.payload,
        fingerprint: update.fingerprint,
        source_fingerprint: update.source_fingerprint,
        manual_change_flag: update.manual_change_flag,
        warning_message: update.warning_message,
        created_at: current.created_at,
        updated_at: update.updated_at,
    })
}

/// Delete the tenant's snapshots captured strictly before `now - horizon`.
///
/// Runs without the run lock; snapshots are append-only so a concurrent run
/// only adds rows newer than the cutoff. A horizon reaching past the start of
/// representable time deletes nothing.
pub async fn cleanup<S: RecordStore + ?Sized>(
    store: &S,
    tenant_id: TenantId,
    horizon: Duration,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let Some(cutoff) = now.checked_sub_signed(horizon) else {
        warn!(tenant = %tenant_id, horizon_days = horizon.num_days(), "retention horizon precedes all time; nothing to delete");
        return Ok(0);
    };
    let deleted = store.delete_snapshots_before(tenant_id, cutoff).await?;
    info!(tenant = %tenant_id, %cutoff, deleted, "snapshot retention cleanup");
    Ok(deleted)
}
