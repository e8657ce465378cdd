//! Command handler modules for psm-cli.
//!
//! Shared bootstrap (config, tenant, store) lives here; command-specific
//! logic lives in the submodules.

pub mod collection;
pub mod sync;

use anyhow::{anyhow, Context, Result};
use psm_config::{ConfigCommand, LoadedConfig, SyncSettings, UnusedKeyPolicy};
use psm_db::PgStore;
use psm_ingest::IdentityFields;
use psm_reconcile::{SyncContext, SyncEngine};
use psm_schemas::TenantId;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use tracing::warn;

/// Options shared by every database-backed command.
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub config_paths: Vec<String>,
    pub tenant: Option<String>,
    pub strict_config: bool,
}

/// Engine plus per-call context, ready for one command.
pub struct Session {
    pub engine: SyncEngine<PgStore>,
    pub ctx: SyncContext,
    pub settings: SyncSettings,
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Load layered config (or an empty one) and check unused keys for `cmd`.
pub fn load_config(opts: &GlobalOpts, cmd: ConfigCommand) -> Result<(LoadedConfig, SyncSettings)> {
    let loaded = if opts.config_paths.is_empty() {
        LoadedConfig::empty()?
    } else {
        let refs: Vec<&str> = opts.config_paths.iter().map(|s| s.as_str()).collect();
        psm_config::load_layered_yaml(&refs)?
    };

    let policy = if opts.strict_config {
        UnusedKeyPolicy::Fail
    } else {
        UnusedKeyPolicy::Warn
    };
    let report = psm_config::report_unused_keys(cmd, &loaded.config_json, policy)?;
    if !report.is_clean() {
        warn!(
            command = %report.command,
            unused = ?report.unused_leaf_pointers,
            "config has keys this command does not read"
        );
    }

    let settings = loaded.settings()?;
    Ok((loaded, settings))
}

/// `--tenant` wins over `tenant.tenant_id` from config.
pub fn resolve_tenant(opts: &GlobalOpts, settings: &SyncSettings) -> Result<TenantId> {
    if let Some(raw) = opts.tenant.as_deref() {
        return raw
            .parse()
            .with_context(|| format!("invalid --tenant uuid: {raw}"));
    }
    settings
        .tenant_id
        .ok_or_else(|| anyhow!("no tenant: pass --tenant or set tenant.tenant_id in config"))
}

pub fn context_for(tenant_id: TenantId, settings: &SyncSettings) -> Result<SyncContext> {
    let fields = IdentityFields::from_list(&settings.identity_fields)
        .ok_or_else(|| anyhow!("CONFIG_INVALID: ingest.identity_fields must not be empty"))?;
    Ok(SyncContext::new(tenant_id)
        .with_identity_fields(fields)
        .with_retention_days(settings.retention_days))
}

pub async fn connect(settings: &SyncSettings) -> Result<PgStore> {
    let url = psm_config::resolve_database_url(settings)?;
    let pool = psm_db::connect(url.expose()).await?;
    Ok(PgStore::new(pool))
}

/// Config, tenant and store for a database-backed command.
pub async fn open_session(opts: &GlobalOpts, cmd: ConfigCommand) -> Result<Session> {
    let (_, settings) = load_config(opts, cmd)?;
    let tenant_id = resolve_tenant(opts, &settings)?;
    let ctx = context_for(tenant_id, &settings)?;
    let store = connect(&settings).await?;
    Ok(Session {
        engine: SyncEngine::new(store),
        ctx,
        settings,
    })
}

/// Read a JSON document of records from a file (array or `{ "data": [...] }`).
pub fn read_records(path: &str) -> Result<Vec<Value>> {
    let bytes = fs::read(path).with_context(|| format!("read records file failed: {path}"))?;
    psm_ingest::load_json_document(&bytes).with_context(|| format!("invalid records file: {path}"))
}

/// Load a JSON patch from either an inline string or a file path.
pub fn load_patch(patch: Option<String>, patch_file: Option<String>) -> Result<Value> {
    if let Some(p) = patch_file {
        let bytes = fs::read(&p).with_context(|| format!("read patch-file failed: {}", p))?;
        let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(&bytes);
        let raw = String::from_utf8(bytes.to_vec()).context("patch-file must be UTF-8 text")?;
        let v: Value =
            serde_json::from_str(raw.trim()).context("patch-file must contain valid JSON")?;
        return Ok(v);
    }

    let raw = patch.context("must provide --patch or --patch-file")?;
    let v: Value = serde_json::from_str(raw.trim()).context("--patch must be valid JSON")?;
    Ok(v)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
