//! SQLite-backed [`CacheStore`] implementation.
//!
//! Maps each trait operation onto the schema created by
//! [`migrate`](crate::migrate). Multi-statement writes run inside a single
//! sqlx transaction, so a failure part-way leaves the previous state intact.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use icp_sweep_core::models::{ReverseRun, RunStatus, TargetState};
use icp_sweep_core::store::{CacheStore, ReverseSnapshot, StoredPayload};

/// SQLite implementation of the [`CacheStore`] trait.
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn target_from_row(row: &SqliteRow) -> Result<TargetState> {
    Ok(TargetState {
        name: row.try_get("name")?,
        primary_fetched_at: row.try_get("primary_fetched_at")?,
        secondary_fetched_at: row.try_get("secondary_fetched_at")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<ReverseRun> {
    let status: String = row.try_get("status")?;
    Ok(ReverseRun {
        id: row.try_get("id")?,
        target: row.try_get("name")?,
        started_at: row.try_get("started_at")?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown reverse run status '{}'", status))?,
        input_count: row.try_get("input_count")?,
        result_count: row.try_get("result_count")?,
        note: row.try_get("note")?,
        fields: parse_fields(&row.try_get::<String, _>("fields")?),
    })
}

/// Decode the stored projection. Rows written before it was recorded have an
/// empty column and yield no fields.
fn parse_fields(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Insert the target if missing and return its id, inside `tx`.
async fn target_id_in(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<i64> {
    sqlx::query("INSERT INTO targets (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    let id: i64 = sqlx::query_scalar("SELECT id FROM targets WHERE name = ?")
        .bind(name)
        .fetch_one(&mut **tx)
        .await?;
    Ok(id)
}

const RUN_COLUMNS: &str = "r.id, t.name, r.started_at, r.status, r.input_count, r.result_count, r.note, r.fields";

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn ensure_target(&self, name: &str) -> Result<TargetState> {
        sqlx::query("INSERT INTO targets (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        match self.target_state(name).await? {
            Some(state) => Ok(state),
            None => bail!("target '{}' vanished after insert", name),
        }
    }

    async fn target_state(&self, name: &str) -> Result<Option<TargetState>> {
        let row = sqlx::query(
            "SELECT name, primary_fetched_at, secondary_fetched_at FROM targets WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(target_from_row).transpose()
    }

    async fn list_targets(&self) -> Result<Vec<TargetState>> {
        let rows = sqlx::query(
            "SELECT name, primary_fetched_at, secondary_fetched_at FROM targets ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(target_from_row).collect()
    }

    async fn primary_payloads(&self, name: &str) -> Result<Vec<StoredPayload>> {
        let rows = sqlx::query(
            r#"
            SELECT r.fetched_at, r.payload_json
            FROM raw_records r
            JOIN targets t ON t.id = r.target_id
            WHERE t.name = ?
            ORDER BY r.id
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StoredPayload {
                    fetched_at: row.try_get("fetched_at")?,
                    payload_json: row.try_get("payload_json")?,
                })
            })
            .collect()
    }

    async fn replace_primary(
        &self,
        name: &str,
        payloads: &[String],
        fetched_at: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let target_id = target_id_in(&mut tx, name).await?;

        sqlx::query("DELETE FROM raw_records WHERE target_id = ?")
            .bind(target_id)
            .execute(&mut *tx)
            .await?;

        for payload in payloads {
            sqlx::query(
                "INSERT INTO raw_records (target_id, fetched_at, payload_json) VALUES (?, ?, ?)",
            )
            .bind(target_id)
            .bind(fetched_at)
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE targets SET primary_fetched_at = ? WHERE id = ?")
            .bind(fetched_at)
            .bind(target_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn begin_reverse_run(
        &self,
        name: &str,
        input_count: i64,
        fields: &[String],
        started_at: &str,
    ) -> Result<i64> {
        let fields_json = serde_json::to_string(fields)?;
        let mut tx = self.pool.begin().await?;
        let target_id = target_id_in(&mut tx, name).await?;
        let result = sqlx::query(
            "INSERT INTO reverse_runs (target_id, started_at, status, input_count, fields) VALUES (?, ?, 'running', ?, ?)",
        )
        .bind(target_id)
        .bind(started_at)
        .bind(input_count)
        .bind(fields_json)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    async fn complete_reverse_run(
        &self,
        run_id: i64,
        chunks: &[String],
        result_count: i64,
        status: RunStatus,
        note: &str,
        advance_to: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT target_id, status FROM reverse_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            bail!("reverse run {} not found", run_id);
        };
        let target_id: i64 = row.try_get("target_id")?;
        let current: String = row.try_get("status")?;
        if current != RunStatus::Running.as_str() {
            bail!("reverse run {} already finished as {}", run_id, current);
        }

        for chunk in chunks {
            sqlx::query("INSERT INTO reverse_chunks (run_id, payload_json) VALUES (?, ?)")
                .bind(run_id)
                .bind(chunk)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE reverse_runs SET status = ?, result_count = ?, note = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(result_count)
            .bind(note)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        if let Some(ts) = advance_to {
            sqlx::query("UPDATE targets SET secondary_fetched_at = ? WHERE id = ?")
                .bind(ts)
                .bind(target_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn finish_reverse_run(&self, run_id: i64, status: RunStatus, note: &str) -> Result<()> {
        let result = sqlx::query("UPDATE reverse_runs SET status = ?, note = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(note)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("reverse run {} not found", run_id);
        }
        Ok(())
    }

    async fn latest_reverse_chunks(&self, name: &str) -> Result<Option<ReverseSnapshot>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM reverse_runs r
            JOIN targets t ON t.id = r.target_id
            WHERE t.name = ? AND r.status IN ('completed', 'completed_with_errors')
            ORDER BY r.id DESC
            LIMIT 1
            "#,
            RUN_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let run = run_from_row(&row)?;

        let chunks: Vec<String> =
            sqlx::query_scalar("SELECT payload_json FROM reverse_chunks WHERE run_id = ? ORDER BY id")
                .bind(run.id)
                .fetch_all(&self.pool)
                .await?;

        Ok(Some(ReverseSnapshot { run, chunks }))
    }

    async fn reverse_runs(&self, name: &str) -> Result<Vec<ReverseRun>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM reverse_runs r
            JOIN targets t ON t.id = r.target_id
            WHERE t.name = ?
            ORDER BY r.id DESC
            "#,
            RUN_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(name).fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }
}
