//! Paginated fetcher for the primary scroll API.
//!
//! [`ScrollPager`] owns the cursor for one query and hands out pages
//! lazily. For each response, in order:
//!
//! 1. `code != 0` ends the walk with [`FetchError::Remote`].
//! 2. An empty `data` array means the result set is exhausted.
//! 3. A missing cursor means this page is the last one.
//!
//! Consecutive requests are spaced by the configured delay. [`fetch_primary`]
//! drains a pager and commits the whole result as one snapshot; nothing is
//! written unless every page succeeded.

use chrono::Utc;
use serde_json::Value;
use std::time::Duration;

use icp_sweep_core::cache;
use icp_sweep_core::store::CacheStore;

use crate::config::QuakeConfig;
use crate::error::FetchError;
use crate::traits::ScrollSource;

/// Cursor-driven page iterator over one scroll query.
pub struct ScrollPager<'a> {
    source: &'a dyn ScrollSource,
    query: String,
    size: usize,
    delay: Duration,
    cursor: Option<String>,
    requests: usize,
    done: bool,
}

impl<'a> ScrollPager<'a> {
    pub fn new(source: &'a dyn ScrollSource, query: &str, size: usize, delay: Duration) -> Self {
        Self {
            source,
            query: query.to_string(),
            size,
            delay,
            cursor: None,
            requests: 0,
            done: false,
        }
    }

    /// Fetch the next non-empty page. `None` once the result set is
    /// exhausted or after an error has been returned.
    pub async fn next_page(&mut self) -> Option<Result<Vec<Value>, FetchError>> {
        if self.done {
            return None;
        }
        if self.requests > 0 && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.requests += 1;

        let page = match self
            .source
            .scroll(&self.query, self.size, self.cursor.as_deref())
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        if page.code != 0 {
            self.done = true;
            return Some(Err(FetchError::Remote {
                code: page.code,
                message: page.message,
            }));
        }
        if page.data.is_empty() {
            self.done = true;
            return None;
        }
        match page.cursor {
            Some(cursor) => self.cursor = Some(cursor),
            None => self.done = true,
        }
        Some(Ok(page.data))
    }

    /// Requests issued so far.
    pub fn requests(&self) -> usize {
        self.requests
    }
}

/// Drain a scroll query into one ordered list of raw records.
pub async fn fetch_all(
    source: &dyn ScrollSource,
    query: &str,
    size: usize,
    delay: Duration,
) -> Result<Vec<Value>, FetchError> {
    let mut pager = ScrollPager::new(source, query, size, delay);
    let mut records = Vec::new();
    while let Some(page) = pager.next_page().await {
        let page = page?;
        tracing::debug!(
            request = pager.requests(),
            records = page.len(),
            "scroll page received"
        );
        records.extend(page);
    }
    Ok(records)
}

/// A successful primary fetch.
#[derive(Debug, Clone)]
pub struct PrimaryFetch {
    pub records: Vec<Value>,
    /// Whether the snapshot reached the cache. `false` means the records are
    /// only in memory and the target's timestamp did not move.
    pub persisted: bool,
}

/// Fetch every record for `target` and replace its cached snapshot.
///
/// The target row is created before the first request so failed targets
/// still show up in status reports. Remote failures return early and leave
/// the cache untouched; a persistence failure after a good fetch is logged
/// and the records are returned anyway.
pub async fn fetch_primary(
    store: &dyn CacheStore,
    source: &dyn ScrollSource,
    config: &QuakeConfig,
    target: &str,
) -> Result<PrimaryFetch, FetchError> {
    if let Err(e) = store.ensure_target(target).await {
        tracing::warn!(target_name = target, error = %format!("{:#}", e), "could not register target");
    }

    let query = config.query_for(target);
    tracing::info!(target_name = target, query = %query, "fetching from scroll API");
    let records = fetch_all(source, &query, config.page_size, config.delay()).await?;

    let persisted = match cache::put_primary(store, target, &records, Utc::now()).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                target_name = target,
                error = %format!("{:#}", e),
                "fetched records could not be cached"
            );
            false
        }
    };

    Ok(PrimaryFetch { records, persisted })
}
