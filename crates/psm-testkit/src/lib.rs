//! psm-testkit
//!
//! In-memory [`RecordStore`](psm_reconcile::RecordStore) and a manual clock
//! for exercising the engine without a database. Scenario tests live under
//! `tests/`.

mod clock;
mod memory_store;

pub use clock::ManualClock;
pub use memory_store::{MemoryLock, MemoryStore};

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use psm_reconcile::{SyncContext, SyncEngine};
use psm_schemas::{Collection, CollectionKind, TenantId};

/// Fixed start instant for deterministic scenarios.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// A tenant with one source and one target collection.
pub struct Fixture {
    pub engine: SyncEngine<MemoryStore>,
    pub ctx: SyncContext,
    pub clock: Arc<ManualClock>,
    pub source: Collection,
    pub target: Collection,
}

impl Fixture {
    pub fn store(&self) -> &MemoryStore {
        self.engine.store()
    }
}

/// Build a [`Fixture`] on a fresh store with the clock at [`epoch`].
pub async fn fixture() -> Fixture {
    fixture_on(MemoryStore::new()).await
}

/// Build a [`Fixture`] sharing `store` with other fixtures.
pub async fn fixture_on(store: MemoryStore) -> Fixture {
    let clock = Arc::new(ManualClock::new(epoch()));
    let ctx = SyncContext::new(TenantId::new_random()).with_clock(clock.clone());
    let engine = SyncEngine::new(store);

    let source = engine
        .create_collection(&ctx, "feed", CollectionKind::Source)
        .await
        .unwrap_or_else(|e| panic!("create source collection: {e}"));
    let target = engine
        .create_collection(&ctx, "site", CollectionKind::Target)
        .await
        .unwrap_or_else(|e| panic!("create target collection: {e}"));

    Fixture {
        engine,
        ctx,
        clock,
        source,
        target,
    }
}
