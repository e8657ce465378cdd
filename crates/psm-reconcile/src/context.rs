//! Per-call configuration.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use psm_ingest::IdentityFields;
use psm_schemas::TenantId;

/// Time source. Readings are truncated to microseconds so they survive a
/// round-trip through storage unchanged.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }
}

/// Everything an operation needs besides the store. Passed per call.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub tenant_id: TenantId,
    pub identity_fields: IdentityFields,
    /// Snapshot retention horizon.
    pub retention: Duration,
    pub clock: Arc<dyn Clock>,
}

impl SyncContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            identity_fields: IdentityFields::default(),
            retention: Duration::days(30),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_identity_fields(mut self, fields: IdentityFields) -> Self {
        self.identity_fields = fields;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention = Duration::days(i64::from(days));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
