//! Storage abstraction for the asset cache.
//!
//! The [`CacheStore`] trait covers the two cache domains: primary scroll
//! results (one snapshot of raw payloads per target) and reverse-lookup
//! runs (an append-only history of runs, each with chunked row payloads).
//! Freshness decisions are not made here; see [`crate::cache`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ReverseRun, RunStatus, TargetState};

/// One stored primary payload, still serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub fetched_at: String,
    pub payload_json: String,
}

/// The newest finished reverse-lookup run and its chunk payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseSnapshot {
    pub run: ReverseRun,
    /// Each chunk is a JSON array of result rows.
    pub chunks: Vec<String>,
}

/// Abstract storage backend for the asset cache.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_target`](CacheStore::ensure_target) | Create a target row if missing |
/// | [`target_state`](CacheStore::target_state) | Timestamps for one target |
/// | [`list_targets`](CacheStore::list_targets) | Every known target |
/// | [`primary_payloads`](CacheStore::primary_payloads) | Stored primary snapshot |
/// | [`replace_primary`](CacheStore::replace_primary) | Atomically swap the primary snapshot |
/// | [`begin_reverse_run`](CacheStore::begin_reverse_run) | Open a `running` reverse run |
/// | [`complete_reverse_run`](CacheStore::complete_reverse_run) | Store chunks and finalize a run |
/// | [`finish_reverse_run`](CacheStore::finish_reverse_run) | Finalize a run without chunks |
/// | [`latest_reverse_chunks`](CacheStore::latest_reverse_chunks) | Newest `completed*` run |
/// | [`reverse_runs`](CacheStore::reverse_runs) | Run history, newest first |
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Insert the target if it does not exist and return its state.
    async fn ensure_target(&self, name: &str) -> Result<TargetState>;

    async fn target_state(&self, name: &str) -> Result<Option<TargetState>>;

    /// All targets, ordered by name.
    async fn list_targets(&self) -> Result<Vec<TargetState>>;

    /// Stored primary payloads in insertion order.
    async fn primary_payloads(&self, name: &str) -> Result<Vec<StoredPayload>>;

    /// Delete the target's primary payloads, insert `payloads`, and set the
    /// primary timestamp to `fetched_at`, all in one transaction.
    ///
    /// Creates the target if needed. On error nothing changes.
    async fn replace_primary(&self, name: &str, payloads: &[String], fetched_at: &str)
        -> Result<()>;

    /// Record a new `running` reverse run and return its id. `fields` is the
    /// projection every row of the run is laid out by.
    async fn begin_reverse_run(
        &self,
        name: &str,
        input_count: i64,
        fields: &[String],
        started_at: &str,
    ) -> Result<i64>;

    /// Insert `chunks` for the run and set its final status, result count and
    /// note. When `advance_to` is given the target's secondary timestamp is
    /// set to it. One transaction.
    async fn complete_reverse_run(
        &self,
        run_id: i64,
        chunks: &[String],
        result_count: i64,
        status: RunStatus,
        note: &str,
        advance_to: Option<&str>,
    ) -> Result<()>;

    /// Set a run's final status and note without storing results.
    async fn finish_reverse_run(&self, run_id: i64, status: RunStatus, note: &str) -> Result<()>;

    /// The newest run for the target whose status is `completed` or
    /// `completed_with_errors`, with its chunks.
    async fn latest_reverse_chunks(&self, name: &str) -> Result<Option<ReverseSnapshot>>;

    /// Reverse run history for the target, newest first.
    async fn reverse_runs(&self, name: &str) -> Result<Vec<ReverseRun>>;
}
