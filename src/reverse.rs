//! Reverse-lookup fetcher.
//!
//! Independent IPs are sorted, split into chunks of `fofa.ip_chunk_size`,
//! and each chunk is queried as `ip="a" || ip="b" || ...`, following the
//! `next` token until the API reports no further pages. The first failing
//! request stops the whole lookup.
//!
//! A run row is opened before the first request, tagged with the source's
//! field projection, and closed exactly once through
//! [`cache::finish_secondary`]; rows gathered before a failure are still
//! stored against the failed run.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;

use icp_sweep_core::cache;
use icp_sweep_core::models::RunStatus;
use icp_sweep_core::store::CacheStore;

use crate::config::FofaConfig;
use crate::error::FetchError;
use crate::traits::ReverseSource;

/// `ip="a" || ip="b"` for a chunk of addresses.
pub fn build_ip_query<S: AsRef<str>>(ips: &[S]) -> String {
    ips.iter()
        .map(|ip| format!("ip=\"{}\"", ip.as_ref()))
        .collect::<Vec<_>>()
        .join(" || ")
}

pub fn encode_query(query: &str) -> String {
    STANDARD.encode(query.as_bytes())
}

/// Outcome of one reverse lookup.
#[derive(Debug, Clone)]
pub struct ReverseOutcome {
    /// `None` when the run row could not be created.
    pub run_id: Option<i64>,
    pub status: RunStatus,
    pub rows: Vec<Value>,
    pub note: String,
}

/// Walk every page of one chunk query, appending rows to `rows`.
async fn fetch_chunk(
    source: &dyn ReverseSource,
    qbase64: &str,
    config: &FofaConfig,
    requests: &mut usize,
    rows: &mut Vec<Value>,
) -> Result<(), FetchError> {
    let mut next: Option<String> = None;
    loop {
        if *requests > 0 && config.delay_secs > 0 {
            tokio::time::sleep(config.delay()).await;
        }
        *requests += 1;

        let page = source.search_next(qbase64, next.as_deref()).await?;
        if page.error {
            return Err(FetchError::Remote {
                code: -1,
                message: page.errmsg,
            });
        }
        if page.results.is_empty() {
            return Ok(());
        }
        rows.extend(page.results);

        match page.next {
            Some(token) => next = Some(token),
            None => return Ok(()),
        }
    }
}

/// Look up every IP in `ips` and record the run for `target`.
pub async fn fetch_by_ips(
    store: &dyn CacheStore,
    source: &dyn ReverseSource,
    config: &FofaConfig,
    target: &str,
    ips: &BTreeSet<String>,
) -> ReverseOutcome {
    let opened = cache::begin_secondary(store, target, ips.len(), source.fields(), Utc::now()).await;
    let run_id = match opened {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(
                target_name = target,
                error = %format!("{:#}", e),
                "could not open reverse-lookup run"
            );
            None
        }
    };

    let sorted: Vec<&String> = ips.iter().collect();
    let chunk_count = sorted.chunks(config.ip_chunk_size.max(1)).len();
    let mut rows = Vec::new();
    let mut requests = 0usize;
    let mut fetch_error: Option<String> = None;

    for (i, chunk) in sorted.chunks(config.ip_chunk_size.max(1)).enumerate() {
        let qbase64 = encode_query(&build_ip_query(chunk));
        let before = rows.len();
        match fetch_chunk(source, &qbase64, config, &mut requests, &mut rows).await {
            Ok(()) => {
                tracing::debug!(
                    target_name = target,
                    chunk = i + 1,
                    of = chunk_count,
                    rows = rows.len() - before,
                    "reverse chunk done"
                );
            }
            Err(e) => {
                tracing::warn!(
                    target_name = target,
                    chunk = i + 1,
                    of = chunk_count,
                    error = %e,
                    "reverse lookup failed, skipping remaining chunks"
                );
                fetch_error = Some(e.to_string());
                break;
            }
        }
    }

    match run_id {
        Some(id) => {
            let finish = cache::finish_secondary(
                store,
                id,
                &rows,
                fetch_error.as_deref(),
                config.storage_chunk_size,
                Utc::now(),
            )
            .await;
            if let Some(close_error) = &finish.close_error {
                tracing::warn!(
                    target_name = target,
                    run_id = id,
                    status = %finish.status,
                    error = %close_error,
                    "could not close reverse-lookup run, it stays running"
                );
            }
            ReverseOutcome {
                run_id,
                status: finish.status,
                rows,
                note: finish.note,
            }
        }
        None => {
            let (status, note) = match fetch_error {
                Some(err) => (RunStatus::Failed, format!("api error: {}", err)),
                None => (
                    RunStatus::CompletedWithErrors,
                    "persistence error: run not recorded".to_string(),
                ),
            };
            ReverseOutcome {
                run_id,
                status,
                rows,
                note,
            }
        }
    }
}
