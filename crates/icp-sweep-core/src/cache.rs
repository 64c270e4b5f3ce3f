//! Cache freshness policy over a [`CacheStore`].
//!
//! A lookup is a HIT only when the domain's timestamp exists, parses, is
//! younger than the expiry window, and at least one decodable payload is
//! stored. Anything else is a MISS carrying a [`MissReason`]; lookups never
//! return errors.
//!
//! Writes go through the store's transactional operations. A successful
//! write advances the target's timestamp; a failed one leaves it alone.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::models::{format_ts, parse_ts, CanonicalAsset, RunStatus};
use crate::normalize::{normalize_primary, normalize_secondary};
use crate::store::CacheStore;

/// Expiry window for both cache domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub expiry: Duration,
}

impl CachePolicy {
    pub fn from_hours(hours: i64) -> Self {
        Self {
            expiry: Duration::hours(hours),
        }
    }

    pub fn is_fresh(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - fetched_at < self.expiry
    }

    /// Time left before an entry fetched at `fetched_at` expires. Negative
    /// once expired.
    pub fn remaining(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        fetched_at + self.expiry - now
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_hours(7 * 24)
    }
}

/// Why a lookup missed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    UnknownTarget,
    NeverFetched,
    /// Stored timestamp could not be parsed.
    BadTimestamp(String),
    Expired,
    NoPayloads,
    UndecodablePayload(String),
    Storage(String),
    /// Reverse rows were stored under a different field projection than the
    /// one now requested. Empty when the run recorded no projection.
    FieldsChanged(Vec<String>),
}

impl MissReason {
    /// Reasons that point at damaged data or a broken store rather than a
    /// normal cold or stale cache.
    pub fn is_anomaly(&self) -> bool {
        match self {
            MissReason::BadTimestamp(_)
            | MissReason::UndecodablePayload(_)
            | MissReason::Storage(_) => true,
            MissReason::FieldsChanged(stored) => stored.is_empty(),
            _ => false,
        }
    }
}

impl std::fmt::Display for MissReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissReason::UnknownTarget => write!(f, "target not in cache"),
            MissReason::NeverFetched => write!(f, "never fetched"),
            MissReason::BadTimestamp(raw) => write!(f, "malformed timestamp {:?}", raw),
            MissReason::Expired => write!(f, "expired"),
            MissReason::NoPayloads => write!(f, "no stored payloads"),
            MissReason::UndecodablePayload(e) => write!(f, "undecodable payload: {}", e),
            MissReason::Storage(e) => write!(f, "storage error: {}", e),
            MissReason::FieldsChanged(stored) if stored.is_empty() => {
                write!(f, "cached rows have no recorded field layout")
            }
            MissReason::FieldsChanged(stored) => {
                write!(f, "cached rows use fields [{}]", stored.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Hit(T),
    Miss(MissReason),
}

impl<T> CacheLookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn hit(self) -> Option<T> {
        match self {
            CacheLookup::Hit(v) => Some(v),
            CacheLookup::Miss(_) => None,
        }
    }
}

/// A fresh primary snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimarySnapshot {
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<Value>,
}

impl PrimarySnapshot {
    pub fn assets(&self) -> Vec<CanonicalAsset> {
        self.records.iter().map(normalize_primary).collect()
    }
}

/// Result rows of the newest fresh reverse-lookup run.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondarySnapshot {
    pub fetched_at: DateTime<Utc>,
    pub run_id: i64,
    /// Projection the rows were fetched with.
    pub fields: Vec<String>,
    pub rows: Vec<Value>,
}

impl SecondarySnapshot {
    pub fn assets(&self) -> Vec<CanonicalAsset> {
        self.rows
            .iter()
            .map(|row| normalize_secondary(row, &self.fields))
            .collect()
    }
}

/// Validate a stored timestamp against the policy.
fn check_timestamp(
    raw: Option<&str>,
    policy: &CachePolicy,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, MissReason> {
    let raw = raw.ok_or(MissReason::NeverFetched)?;
    let ts = parse_ts(raw).ok_or_else(|| MissReason::BadTimestamp(raw.to_string()))?;
    if policy.is_fresh(ts, now) {
        Ok(ts)
    } else {
        Err(MissReason::Expired)
    }
}

/// Look up the primary snapshot for `target`.
///
/// Only payloads stamped with the target's current primary timestamp count.
pub async fn get_primary(
    store: &dyn CacheStore,
    target: &str,
    policy: &CachePolicy,
    now: DateTime<Utc>,
) -> CacheLookup<PrimarySnapshot> {
    let state = match store.target_state(target).await {
        Ok(Some(state)) => state,
        Ok(None) => return CacheLookup::Miss(MissReason::UnknownTarget),
        Err(e) => return CacheLookup::Miss(MissReason::Storage(format!("{:#}", e))),
    };
    let fetched_at = match check_timestamp(state.primary_fetched_at.as_deref(), policy, now) {
        Ok(ts) => ts,
        Err(reason) => return CacheLookup::Miss(reason),
    };
    let stamp = state.primary_fetched_at.unwrap_or_default();

    let payloads = match store.primary_payloads(target).await {
        Ok(p) => p,
        Err(e) => return CacheLookup::Miss(MissReason::Storage(format!("{:#}", e))),
    };

    let mut records = Vec::with_capacity(payloads.len());
    for payload in payloads.iter().filter(|p| p.fetched_at == stamp) {
        match serde_json::from_str::<Value>(&payload.payload_json) {
            Ok(v) => records.push(v),
            Err(e) => return CacheLookup::Miss(MissReason::UndecodablePayload(e.to_string())),
        }
    }
    if records.is_empty() {
        return CacheLookup::Miss(MissReason::NoPayloads);
    }

    CacheLookup::Hit(PrimarySnapshot {
        fetched_at,
        records,
    })
}

/// Look up the newest completed reverse-lookup run for `target`.
///
/// The run must have been fetched with exactly `fields`; rows stored under
/// another projection cannot be read by position and count as a miss.
pub async fn get_secondary(
    store: &dyn CacheStore,
    target: &str,
    policy: &CachePolicy,
    fields: &[String],
    now: DateTime<Utc>,
) -> CacheLookup<SecondarySnapshot> {
    let state = match store.target_state(target).await {
        Ok(Some(state)) => state,
        Ok(None) => return CacheLookup::Miss(MissReason::UnknownTarget),
        Err(e) => return CacheLookup::Miss(MissReason::Storage(format!("{:#}", e))),
    };
    let fetched_at = match check_timestamp(state.secondary_fetched_at.as_deref(), policy, now) {
        Ok(ts) => ts,
        Err(reason) => return CacheLookup::Miss(reason),
    };

    let snapshot = match store.latest_reverse_chunks(target).await {
        Ok(Some(s)) => s,
        Ok(None) => return CacheLookup::Miss(MissReason::NoPayloads),
        Err(e) => return CacheLookup::Miss(MissReason::Storage(format!("{:#}", e))),
    };
    if snapshot.run.fields.is_empty() || snapshot.run.fields != fields {
        return CacheLookup::Miss(MissReason::FieldsChanged(snapshot.run.fields));
    }

    let mut rows = Vec::new();
    for chunk in &snapshot.chunks {
        match serde_json::from_str::<Value>(chunk) {
            Ok(Value::Array(items)) => rows.extend(items),
            Ok(_) => {
                return CacheLookup::Miss(MissReason::UndecodablePayload(
                    "reverse chunk is not an array".to_string(),
                ))
            }
            Err(e) => return CacheLookup::Miss(MissReason::UndecodablePayload(e.to_string())),
        }
    }
    if rows.is_empty() {
        return CacheLookup::Miss(MissReason::NoPayloads);
    }

    CacheLookup::Hit(SecondarySnapshot {
        fetched_at,
        run_id: snapshot.run.id,
        fields: snapshot.run.fields,
        rows,
    })
}

/// Replace the primary snapshot for `target` with `records`.
///
/// An empty `records` slice is a valid snapshot: old rows are removed and
/// the timestamp advances, but later lookups still miss.
pub async fn put_primary(
    store: &dyn CacheStore,
    target: &str,
    records: &[Value],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let payloads: Vec<String> = records.iter().map(|r| r.to_string()).collect();
    store
        .replace_primary(target, &payloads, &format_ts(now))
        .await
}

/// Final state of a reverse-lookup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFinish {
    pub status: RunStatus,
    pub note: String,
    /// Set when the run row could not be closed either; it is then left as
    /// `running` in the store.
    pub close_error: Option<String>,
}

/// Open a reverse-lookup run for `target` whose rows follow `fields`.
pub async fn begin_secondary(
    store: &dyn CacheStore,
    target: &str,
    ip_count: usize,
    fields: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<i64> {
    store
        .begin_reverse_run(target, ip_count as i64, fields, &format_ts(now))
        .await
}

/// Close a run whose results could not be stored.
async fn close_run(
    store: &dyn CacheStore,
    run_id: i64,
    status: RunStatus,
    note: String,
) -> RunFinish {
    let close_error = store
        .finish_reverse_run(run_id, status, &note)
        .await
        .err()
        .map(|e| format!("{:#}", e));
    RunFinish {
        status,
        note,
        close_error,
    }
}

/// Persist reverse-lookup rows for an open run and finalize it.
///
/// * No `fetch_error` and the write succeeds: `completed`, timestamp advanced.
/// * No `fetch_error` but the write fails: `completed_with_errors`.
/// * With `fetch_error`: rows gathered so far are stored if possible and the
///   run is `failed`.
///
/// Only the first case advances the target's secondary timestamp.
pub async fn finish_secondary(
    store: &dyn CacheStore,
    run_id: i64,
    rows: &[Value],
    fetch_error: Option<&str>,
    storage_chunk_size: usize,
    now: DateTime<Utc>,
) -> RunFinish {
    let chunks: Vec<String> = rows
        .chunks(storage_chunk_size.max(1))
        .map(|chunk| Value::Array(chunk.to_vec()).to_string())
        .collect();
    let count = rows.len() as i64;

    match fetch_error {
        None => {
            let note = if rows.is_empty() { "no results" } else { "" };
            let stamp = format_ts(now);
            match store
                .complete_reverse_run(run_id, &chunks, count, RunStatus::Completed, note, Some(&stamp))
                .await
            {
                Ok(()) => RunFinish {
                    status: RunStatus::Completed,
                    note: note.to_string(),
                    close_error: None,
                },
                Err(e) => {
                    let note = format!("persistence error: {:#}", e);
                    close_run(store, run_id, RunStatus::CompletedWithErrors, note).await
                }
            }
        }
        Some(err) => {
            let note = format!("api error: {}", err);
            let stored = store
                .complete_reverse_run(run_id, &chunks, count, RunStatus::Failed, &note, None)
                .await;
            match stored {
                Ok(()) => RunFinish {
                    status: RunStatus::Failed,
                    note,
                    close_error: None,
                },
                Err(e) => {
                    let note = format!("{}; persistence error: {:#}", note, e);
                    close_run(store, run_id, RunStatus::Failed, note).await
                }
            }
        }
    }
}

/// Record a complete reverse lookup in one call: open a run and finish it.
pub async fn put_secondary(
    store: &dyn CacheStore,
    target: &str,
    ip_count: usize,
    fields: &[String],
    rows: &[Value],
    storage_chunk_size: usize,
    now: DateTime<Utc>,
) -> anyhow::Result<RunFinish> {
    let run_id = begin_secondary(store, target, ip_count, fields, now).await?;
    Ok(finish_secondary(store, run_id, rows, None, storage_chunk_size, now).await)
}
