//! Forward-only schema migrations.
//!
//! Files are named `NNNN_name.sql` and embedded at build time; each runs at
//! most once, recorded in `schema_migrations`. An advisory lock keeps
//! concurrently starting replicas from racing each other.

use std::time::Duration;

use sqlx::postgres::PgConnection;
use sqlx::{Connection, Executor, Row};
use tracing::info;

use crate::error::StoreError;

const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_orgs", include_str!("../migrations/0001_orgs.sql")),
    ("0002_api_keys", include_str!("../migrations/0002_api_keys.sql")),
    ("0003_jobs", include_str!("../migrations/0003_jobs.sql")),
];

/// Lock key shared by all migrators of this schema.
const ADVISORY_LOCK_KEY: i64 = 0x76_65_6c_75; // "velu"

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Apply all pending migrations, waiting for the database to come up.
pub async fn migrate(database_url: &str) -> Result<(), StoreError> {
    let mut last_err: Option<StoreError> = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match try_migrate(database_url).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                info!(attempt, error = %err, "database not ready, retrying");
                last_err = Some(err);
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| StoreError::backend("migration failed")))
}

async fn try_migrate(database_url: &str) -> Result<(), StoreError> {
    let mut conn = PgConnection::connect(database_url).await?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(ADVISORY_LOCK_KEY)
        .execute(&mut conn)
        .await?;

    let result = apply_pending(&mut conn).await;

    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(ADVISORY_LOCK_KEY)
        .execute(&mut conn)
        .await?;

    let _ = conn.close().await;
    result
}

async fn apply_pending(conn: &mut sqlx::PgConnection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .await?;

    let applied: Vec<String> = sqlx::query("SELECT version FROM schema_migrations")
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| row.try_get("version"))
        .collect::<Result<_, _>>()?;

    for (version, sql) in MIGRATIONS {
        if applied.iter().any(|v| v == version) {
            continue;
        }
        info!(version, "applying migration");
        let mut tx = conn.begin().await?;
        (&mut *tx)
            .execute(*sql)
            .await
            .map_err(|e| StoreError::backend(format!("migration {version} failed: {e}")))?;
        sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }
    Ok(())
}
