//! Schema migrations for the cache database.
//!
//! Every statement is `IF NOT EXISTS` or guarded by a schema check, so
//! running migrations repeatedly is safe.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `targets` | One row per query target with both fetch timestamps |
//! | `raw_records` | Current primary snapshot, one payload per row |
//! | `reverse_runs` | Reverse-lookup run history and each run's field projection |
//! | `reverse_chunks` | Result rows of a run, stored as JSON arrays |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Connect to the configured database and create the schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the schema on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS targets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            primary_fetched_at TEXT,
            secondary_fetched_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_id INTEGER NOT NULL,
            fetched_at TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            FOREIGN KEY (target_id) REFERENCES targets(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reverse_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_id INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            input_count INTEGER NOT NULL DEFAULT 0,
            result_count INTEGER NOT NULL DEFAULT 0,
            note TEXT NOT NULL DEFAULT '',
            fields TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (target_id) REFERENCES targets(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before runs recorded their field projection.
    let has_fields: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('reverse_runs') WHERE name = 'fields'",
    )
    .fetch_one(pool)
    .await?;
    if has_fields == 0 {
        sqlx::query("ALTER TABLE reverse_runs ADD COLUMN fields TEXT NOT NULL DEFAULT ''")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reverse_chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL,
            payload_json TEXT NOT NULL,
            FOREIGN KEY (run_id) REFERENCES reverse_runs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_raw_records_target_id ON raw_records(target_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_reverse_runs_target_id ON reverse_runs(target_id, id DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_reverse_chunks_run_id ON reverse_chunks(run_id)")
        .execute(pool)
        .await?;

    Ok(())
}
