//! Shared runtime state for psm-daemon.
//!
//! Handlers receive `State<Arc<AppState<S>>>` from Axum. The state is generic
//! over the record store so tests can drive the router on an in-memory store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use psm_config::{SyncSettings, DEFAULT_RETENTION_DAYS};
use psm_ingest::IdentityFields;
use psm_reconcile::{CancelFlag, RecordStore, SyncContext, SyncEngine};
use psm_schemas::{CollectionId, CollectionScope, Identity, RunId, RunOutcome, RunStats, TenantId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat {
        ts_millis: i64,
    },
    RunStarted {
        tenant_id: TenantId,
        source_id: CollectionId,
        target_id: CollectionId,
    },
    RunFinished {
        run_id: RunId,
        tenant_id: TenantId,
        target_id: CollectionId,
        outcome: RunOutcome,
        created: u64,
        updated: u64,
        skipped_unchanged: u64,
        skipped_conflict: u64,
        rejected: u64,
        cancelled: bool,
    },
    /// A target record was skipped because it carries manual edits.
    Conflict {
        tenant_id: TenantId,
        target_id: CollectionId,
        identity: Identity,
    },
    LogLine {
        level: String,
        msg: String,
    },
}

impl BusMsg {
    pub fn run_finished(tenant_id: TenantId, target_id: CollectionId, stats: &RunStats) -> Self {
        BusMsg::RunFinished {
            run_id: stats.run_id,
            tenant_id,
            target_id,
            outcome: stats.outcome,
            created: stats.created,
            updated: stats.updated,
            skipped_unchanged: stats.skipped_unchanged,
            skipped_conflict: stats.skipped_conflict,
            rejected: stats.rejected,
            cancelled: stats.cancelled,
        }
    }

    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::RunStarted { .. } => "run_started",
            BusMsg::RunFinished { .. } => "run_finished",
            BusMsg::Conflict { .. } => "conflict",
            BusMsg::LogLine { .. } => "log",
        }
    }
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// SyncDefaults
// ---------------------------------------------------------------------------

/// Per-request context inputs taken from config at boot.
#[derive(Clone, Debug)]
pub struct SyncDefaults {
    pub identity_fields: IdentityFields,
    pub retention_days: u32,
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self {
            identity_fields: IdentityFields::default(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl SyncDefaults {
    pub fn from_settings(settings: &SyncSettings) -> Result<Self> {
        let identity_fields = IdentityFields::from_list(&settings.identity_fields)
            .ok_or_else(|| anyhow!("CONFIG_INVALID: ingest.identity_fields must not be empty"))?;
        Ok(Self {
            identity_fields,
            retention_days: settings.retention_days,
        })
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

type ActiveRuns = Arc<Mutex<BTreeMap<CollectionScope, CancelFlag>>>;

/// Shared across all Axum handlers behind an `Arc`.
pub struct AppState<S> {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub engine: SyncEngine<S>,
    pub defaults: SyncDefaults,
    /// Cancel flags of runs started by this daemon, by target.
    active: ActiveRuns,
}

impl<S: RecordStore> AppState<S> {
    pub fn new(engine: SyncEngine<S>, defaults: SyncDefaults) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "psm-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            engine,
            defaults,
            active: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn context(&self, tenant_id: TenantId) -> SyncContext {
        SyncContext::new(tenant_id)
            .with_identity_fields(self.defaults.identity_fields.clone())
            .with_retention_days(self.defaults.retention_days)
    }

    /// Register a run on `scope`. `None` if this daemon already runs it.
    pub fn begin_active(&self, scope: CollectionScope) -> Option<ActiveRun> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if active.contains_key(&scope) {
            return None;
        }
        let cancel = CancelFlag::new();
        active.insert(scope, cancel.clone());
        Some(ActiveRun {
            scope,
            cancel,
            active: Arc::clone(&self.active),
        })
    }

    /// Trip the cancel flag of the run on `scope`, if any.
    pub fn cancel_active(&self, scope: CollectionScope) -> bool {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        match active.get(&scope) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_scopes(&self) -> Vec<CollectionScope> {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.keys().copied().collect()
    }
}

/// Registration of one in-flight run. Deregisters on drop, including when
/// the request future is dropped mid-run.
pub struct ActiveRun {
    scope: CollectionScope,
    pub cancel: CancelFlag,
    active: ActiveRuns,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.scope);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
