//! Typed view over the merged config.

use anyhow::{anyhow, bail, Result};
use psm_schemas::TenantId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
/// Upper bound on any retention horizon, config or per-call.
pub const MAX_RETENTION_DAYS: u32 = 36_500;
pub const DEFAULT_DATABASE_URL_ENV: &str = "PSM_DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Default tenant when a command does not name one.
    pub tenant_id: Option<TenantId>,
    /// Identity candidates, primary first.
    pub identity_fields: Vec<String>,
    pub retention_days: u32,
    /// Name of the env var holding the database URL. Never the URL itself.
    pub database_url_env: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tenant_id: None,
            identity_fields: vec!["id".to_string(), "external_id".to_string()],
            retention_days: DEFAULT_RETENTION_DAYS,
            database_url_env: DEFAULT_DATABASE_URL_ENV.to_string(),
        }
    }
}

impl SyncSettings {
    /// Read settings; absent keys take defaults, malformed keys are errors.
    pub fn from_config_json(config: &Value) -> Result<Self> {
        let mut s = SyncSettings::default();

        if let Some(v) = present(config, "/tenant/tenant_id") {
            let raw = v
                .as_str()
                .ok_or_else(|| anyhow!("CONFIG_INVALID /tenant/tenant_id must be a string"))?;
            s.tenant_id = Some(
                raw.parse()
                    .map_err(|_| anyhow!("CONFIG_INVALID /tenant/tenant_id is not a uuid: {raw}"))?,
            );
        }

        if let Some(v) = present(config, "/ingest/identity_fields") {
            let arr = v.as_array().ok_or_else(|| {
                anyhow!("CONFIG_INVALID /ingest/identity_fields must be a list of strings")
            })?;
            let mut fields = Vec::with_capacity(arr.len());
            for item in arr {
                let f = item.as_str().map(str::trim).unwrap_or("");
                if f.is_empty() {
                    bail!("CONFIG_INVALID /ingest/identity_fields entries must be non-empty strings");
                }
                fields.push(f.to_string());
            }
            if fields.is_empty() || fields.len() > 2 {
                bail!("CONFIG_INVALID /ingest/identity_fields takes a primary and an optional fallback");
            }
            s.identity_fields = fields;
        }

        if let Some(v) = present(config, "/retention/snapshot_days") {
            s.retention_days = v
                .as_u64()
                .and_then(|d| u32::try_from(d).ok())
                .ok_or_else(|| {
                    anyhow!("CONFIG_INVALID /retention/snapshot_days must be a non-negative integer")
                })?;
            check_retention_days(s.retention_days)
                .map_err(|e| anyhow!("CONFIG_INVALID /retention/snapshot_days {e}"))?;
        }

        if let Some(v) = present(config, "/database/url_env") {
            let name = v.as_str().map(str::trim).unwrap_or("");
            if name.is_empty() {
                bail!("CONFIG_INVALID /database/url_env must name an environment variable");
            }
            s.database_url_env = name.to_string();
        }

        Ok(s)
    }
}

/// Bounds shared by config, CLI flags and API parameters.
pub fn check_retention_days(days: u32) -> Result<u32> {
    if days > MAX_RETENTION_DAYS {
        bail!("retention of {days} days exceeds the maximum of {MAX_RETENTION_DAYS}");
    }
    Ok(days)
}

fn present<'a>(config: &'a Value, pointer: &str) -> Option<&'a Value> {
    config.pointer(pointer).filter(|v| !v.is_null())
}
