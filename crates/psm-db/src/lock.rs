//! Session advisory lock for the (tenant, target) run scope.
//!
//! The lock lives on one pooled connection held by [`PgLock`]. Release it
//! with [`PgLock::release`]; a guard dropped without release detaches and
//! closes its connection so the server ends the session and frees the lock.

use anyhow::{Context, Result};
use psm_schemas::CollectionScope;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::warn;

pub struct PgLock {
    conn: Option<PoolConnection<Postgres>>,
    key: String,
}

impl std::fmt::Debug for PgLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLock")
            .field("key", &self.key)
            .field("held", &self.conn.is_some())
            .finish()
    }
}

pub(crate) fn lock_key(scope: CollectionScope) -> String {
    format!("psm-run:{}:{}", scope.tenant_id, scope.collection_id)
}

impl PgLock {
    /// `Ok(None)` when another session holds the scope.
    pub(crate) async fn try_acquire(pool: &PgPool, scope: CollectionScope) -> Result<Option<Self>> {
        let mut conn = pool
            .acquire()
            .await
            .context("acquire connection for run lock")?;
        let key = lock_key(scope);

        let (acquired,): (bool,) =
            sqlx::query_as::<_, (bool,)>("select pg_try_advisory_lock(hashtextextended($1, 0))")
                .bind(&key)
                .fetch_one(&mut *conn)
                .await
                .context("pg_try_advisory_lock failed")?;

        if !acquired {
            return Ok(None);
        }
        Ok(Some(Self {
            conn: Some(conn),
            key,
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unlock and return the connection to the pool.
    pub async fn release(mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let res = sqlx::query_as::<_, (bool,)>("select pg_advisory_unlock(hashtextextended($1, 0))")
            .bind(&self.key)
            .fetch_one(&mut *conn)
            .await;

        match res {
            Ok((true,)) => Ok(()),
            Ok((false,)) => {
                warn!(key = %self.key, "advisory lock was not held at release");
                Ok(())
            }
            Err(e) => {
                // Closing the session frees the lock server-side.
                drop(conn.detach());
                Err(anyhow::Error::new(e).context("pg_advisory_unlock failed"))
            }
        }
    }
}

impl Drop for PgLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(key = %self.key, "run lock dropped without release; closing its session");
            drop(conn.detach());
        }
    }
}
