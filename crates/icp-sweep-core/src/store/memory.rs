//! In-memory [`CacheStore`] implementation for tests.
//!
//! All tables live in one struct behind a `std::sync::RwLock`, so every
//! operation is trivially atomic.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{ReverseRun, RunStatus, TargetState};

use super::{CacheStore, ReverseSnapshot, StoredPayload};

#[derive(Default)]
struct Tables {
    targets: BTreeMap<String, TargetState>,
    payloads: BTreeMap<String, Vec<StoredPayload>>,
    runs: Vec<ReverseRun>,
    chunks: BTreeMap<i64, Vec<String>>,
}

impl Tables {
    fn ensure(&mut self, name: &str) -> TargetState {
        self.targets
            .entry(name.to_string())
            .or_insert_with(|| TargetState {
                name: name.to_string(),
                primary_fetched_at: None,
                secondary_fetched_at: None,
            })
            .clone()
    }

    fn run_mut(&mut self, run_id: i64) -> Result<&mut ReverseRun> {
        self.runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| anyhow!("reverse run {} not found", run_id))
    }
}

/// In-memory cache store.
#[derive(Default)]
pub struct InMemoryCacheStore {
    tables: RwLock<Tables>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    /// Overwrite a target's raw primary timestamp. Lets tests plant
    /// malformed values the way a hand-edited database would.
    pub fn set_primary_timestamp(&self, name: &str, raw: Option<&str>) -> Result<()> {
        let mut tables = self.write()?;
        tables.ensure(name);
        if let Some(state) = tables.targets.get_mut(name) {
            state.primary_fetched_at = raw.map(str::to_string);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn ensure_target(&self, name: &str) -> Result<TargetState> {
        Ok(self.write()?.ensure(name))
    }

    async fn target_state(&self, name: &str) -> Result<Option<TargetState>> {
        Ok(self.read()?.targets.get(name).cloned())
    }

    async fn list_targets(&self) -> Result<Vec<TargetState>> {
        Ok(self.read()?.targets.values().cloned().collect())
    }

    async fn primary_payloads(&self, name: &str) -> Result<Vec<StoredPayload>> {
        Ok(self
            .read()?
            .payloads
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_primary(
        &self,
        name: &str,
        payloads: &[String],
        fetched_at: &str,
    ) -> Result<()> {
        let mut tables = self.write()?;
        tables.ensure(name);
        let stored = payloads
            .iter()
            .map(|p| StoredPayload {
                fetched_at: fetched_at.to_string(),
                payload_json: p.clone(),
            })
            .collect();
        tables.payloads.insert(name.to_string(), stored);
        if let Some(state) = tables.targets.get_mut(name) {
            state.primary_fetched_at = Some(fetched_at.to_string());
        }
        Ok(())
    }

    async fn begin_reverse_run(
        &self,
        name: &str,
        input_count: i64,
        fields: &[String],
        started_at: &str,
    ) -> Result<i64> {
        let mut tables = self.write()?;
        tables.ensure(name);
        let id = tables.runs.last().map(|r| r.id + 1).unwrap_or(1);
        tables.runs.push(ReverseRun {
            id,
            target: name.to_string(),
            started_at: started_at.to_string(),
            status: RunStatus::Running,
            input_count,
            result_count: 0,
            note: String::new(),
            fields: fields.to_vec(),
        });
        Ok(id)
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
        let mut tables = self.write()?;
        let run = tables.run_mut(run_id)?;
        if run.status != RunStatus::Running {
            bail!("reverse run {} already finished as {}", run_id, run.status);
        }
        run.status = status;
        run.result_count = result_count;
        run.note = note.to_string();
        let target = run.target.clone();

        tables
            .chunks
            .entry(run_id)
            .or_default()
            .extend(chunks.iter().cloned());
        if let Some(ts) = advance_to {
            if let Some(state) = tables.targets.get_mut(&target) {
                state.secondary_fetched_at = Some(ts.to_string());
            }
        }
        Ok(())
    }

    async fn finish_reverse_run(&self, run_id: i64, status: RunStatus, note: &str) -> Result<()> {
        let mut tables = self.write()?;
        let run = tables.run_mut(run_id)?;
        run.status = status;
        run.note = note.to_string();
        Ok(())
    }

    async fn latest_reverse_chunks(&self, name: &str) -> Result<Option<ReverseSnapshot>> {
        let tables = self.read()?;
        let run = tables
            .runs
            .iter()
            .rev()
            .find(|r| r.target == name && r.status.is_completed());
        Ok(run.map(|run| ReverseSnapshot {
            run: run.clone(),
            chunks: tables.chunks.get(&run.id).cloned().unwrap_or_default(),
        }))
    }

    async fn reverse_runs(&self, name: &str) -> Result<Vec<ReverseRun>> {
        Ok(self
            .read()?
            .runs
            .iter()
            .rev()
            .filter(|r| r.target == name)
            .cloned()
            .collect())
    }
}
