//! psm-db
//!
//! PostgreSQL persistence: connection bootstrap, embedded migrations and the
//! [`PgStore`] implementation of [`psm_reconcile::RecordStore`].

use anyhow::{Context, Result};
use psm_schemas::{RunLogEntry, RunOutcome, TenantId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

mod lock;
mod store;

pub use lock::PgLock;
pub use store::PgStore;

pub const ENV_DB_URL: &str = "PSM_DATABASE_URL";

/// Connect to Postgres at `url`.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect to Postgres using PSM_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_properties_table: bool,
}

/// Connectivity plus schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='properties'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_properties_table: exists,
    })
}

/// Runs still PENDING across all tenants. Used by the CLI to refuse a
/// migration while a sync may be writing.
pub async fn count_pending_runs(pool: &PgPool) -> Result<i64> {
    let st = status(pool).await?;
    if !st.has_properties_table {
        return Ok(0);
    }

    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        "select count(*)::bigint from sync_runs where status = 'PENDING'",
    )
    .fetch_one(pool)
    .await
    .context("count_pending_runs failed")?;
    Ok(n)
}

/// Most recent runs of a tenant, newest first.
pub async fn recent_runs(pool: &PgPool, tenant_id: TenantId, limit: i64) -> Result<Vec<RunLogEntry>> {
    let rows = sqlx::query(
        r#"
        select run_id, tenant_id, source_id, target_id, status,
               created, updated, skipped_unchanged, skipped_conflict, rejected,
               message, started_at, finished_at
        from sync_runs
        where tenant_id = $1
        order by started_at desc
        limit $2
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_runs failed")?;

    rows.iter().map(run_from_row).collect()
}

fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<RunLogEntry> {
    let status: String = row.try_get("status")?;
    let outcome = RunOutcome::parse(&status)
        .with_context(|| format!("invalid run status: {status}"))?;
    let count = |col: &str| -> Result<u64> { Ok(row.try_get::<i64, _>(col)?.max(0) as u64) };

    Ok(RunLogEntry {
        run_id: row.try_get::<uuid::Uuid, _>("run_id")?.into(),
        tenant_id: row.try_get::<uuid::Uuid, _>("tenant_id")?.into(),
        source_id: row.try_get::<uuid::Uuid, _>("source_id")?.into(),
        target_id: row.try_get::<uuid::Uuid, _>("target_id")?.into(),
        created: count("created")?,
        updated: count("updated")?,
        skipped_unchanged: count("skipped_unchanged")?,
        skipped_conflict: count("skipped_conflict")?,
        rejected: count("rejected")?,
        outcome,
        message: row.try_get("message")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}
