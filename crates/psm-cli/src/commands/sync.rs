//! Import, sync, conflict resolution, out-of-band edits and retention.

use anyhow::{bail, Context, Result};
use psm_config::ConfigCommand;
use psm_reconcile::{CancelFlag, RunError};
use psm_schemas::{Identity, RunOutcome};
use tracing::{info, warn};

use super::collection::parse_collection_id;
use super::{load_patch, open_session, print_json, read_records, GlobalOpts};

/// Ctrl-C trips `cancel`; the run stops before its next record.
fn cancel_on_ctrl_c(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling after the current record");
            cancel.cancel();
        }
    });
}

pub async fn import(opts: &GlobalOpts, source: &str, file: &str) -> Result<()> {
    let source = parse_collection_id(source, "source")?;
    let raws = read_records(file)?;
    let s = open_session(opts, ConfigCommand::Import).await?;

    let stats = s.engine.import(&s.ctx, source, &raws).await?;
    print_json(&stats)?;
    if stats.rejected > 0 {
        info!(rejected = stats.rejected, "some records were rejected");
    }
    Ok(())
}

pub async fn sync(opts: &GlobalOpts, source: &str, target: &str, file: Option<&str>) -> Result<()> {
    let source = parse_collection_id(source, "source")?;
    let target = parse_collection_id(target, "target")?;
    let raws = file.map(read_records).transpose()?;
    let s = open_session(opts, ConfigCommand::Sync).await?;

    let cancel = CancelFlag::new();
    cancel_on_ctrl_c(cancel.clone());

    let res = match raws {
        Some(raws) => {
            s.engine
                .import_and_reconcile(&s.ctx, source, target, &raws, &cancel)
                .await
        }
        None => s.engine.reconcile(&s.ctx, source, target, &cancel).await,
    };

    match res {
        Ok(stats) => {
            if stats.outcome == RunOutcome::Partial {
                warn!(run_id = %stats.run_id, rejected = stats.rejected, cancelled = stats.cancelled, "run finished partially");
            }
            print_json(&stats)
        }
        Err(RunError::CollectionUnavailable { reason, stats }) => {
            print_json(&stats)?;
            bail!("run {} failed: cannot open collection: {reason}", stats.run_id)
        }
        Err(e @ RunError::RunInProgress(_)) => bail!("REFUSING SYNC: {e}. Retry when it finishes."),
        Err(e) => Err(e.into()),
    }
}

pub async fn accept_source(opts: &GlobalOpts, source: &str, target: &str, identity: &str) -> Result<()> {
    let source = parse_collection_id(source, "source")?;
    let target = parse_collection_id(target, "target")?;
    let s = open_session(opts, ConfigCommand::Sync).await?;

    let record = s
        .engine
        .accept_source(&s.ctx, source, target, &Identity::from(identity))
        .await?;
    print_json(&record)
}

pub async fn edit(
    opts: &GlobalOpts,
    target: &str,
    identity: &str,
    patch: Option<String>,
    patch_file: Option<String>,
) -> Result<()> {
    let target = parse_collection_id(target, "target")?;
    let patch = load_patch(patch, patch_file)?;
    let s = open_session(opts, ConfigCommand::Sync).await?;

    let record = s
        .engine
        .edit_target(&s.ctx, target, &Identity::from(identity), &patch)
        .await?;
    print_json(&record)
}

pub async fn cleanup(opts: &GlobalOpts, retention_days: Option<u32>) -> Result<()> {
    if let Some(days) = retention_days {
        psm_config::check_retention_days(days).context("invalid --retention-days")?;
    }
    let mut s = open_session(opts, ConfigCommand::Cleanup).await?;
    let days = retention_days.unwrap_or(s.settings.retention_days);
    s.ctx = s.ctx.with_retention_days(days);

    let now = s.ctx.now();
    let deleted = s.engine.cleanup(&s.ctx, now).await?;
    println!("snapshots_deleted={deleted} retention_days={days}");
    Ok(())
}

pub async fn runs(opts: &GlobalOpts, limit: i64) -> Result<()> {
    let s = open_session(opts, ConfigCommand::Sync).await?;
    let runs = psm_db::recent_runs(s.engine.store().pool(), s.ctx.tenant_id, limit).await?;
    print_json(&runs)
}
