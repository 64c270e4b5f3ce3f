//! `show <target>`: inspect cached data without touching the network.
//!
//! Unlike the sweep, this reads whatever snapshot is stored, stale or not,
//! and reports how fresh it is.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use icp_sweep_core::aggregate::{aggregate, EntityBucket, EntityBuckets};
use icp_sweep_core::cache::CachePolicy;
use icp_sweep_core::models::CanonicalAsset;
use icp_sweep_core::normalize::{normalize_primary, normalize_secondary};
use icp_sweep_core::store::CacheStore;

use crate::config::Config;
use crate::db;
use crate::export::scan_urls;
use crate::migrate;
use crate::sqlite_store::SqliteCacheStore;
use crate::status::{freshness, Freshness};

/// Everything cached for one target.
#[derive(Debug)]
pub struct CachedView {
    pub target: String,
    pub primary: Freshness,
    pub secondary: Freshness,
    pub buckets: EntityBuckets,
    pub reverse_assets: Vec<CanonicalAsset>,
}

#[derive(Serialize)]
struct CachedViewJson<'a> {
    target: &'a str,
    primary: String,
    secondary: String,
    entities: Vec<&'a EntityBucket>,
    reverse: &'a [CanonicalAsset],
}

fn decode_all<'a, I>(target: &str, payloads: I) -> Vec<Value>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut out = Vec::new();
    for payload in payloads {
        match serde_json::from_str::<Value>(payload) {
            Ok(v) => out.push(v),
            Err(e) => tracing::warn!(target_name = target, error = %e, "skipping undecodable cached payload"),
        }
    }
    out
}

/// Load the cached view for `target`. `None` if the target is unknown.
pub async fn load_cached_view(
    store: &dyn CacheStore,
    config: &Config,
    target: &str,
    now: DateTime<Utc>,
) -> Result<Option<CachedView>> {
    let Some(state) = store.target_state(target).await? else {
        return Ok(None);
    };
    let policy = CachePolicy::from_hours(config.cache.expiry_hours);

    let stamp = state.primary_fetched_at.clone().unwrap_or_default();
    let payloads = store.primary_payloads(target).await?;
    let records = decode_all(
        target,
        payloads
            .iter()
            .filter(|p| p.fetched_at == stamp)
            .map(|p| &p.payload_json),
    );

    let mut reverse_assets = Vec::new();
    if let Some(snapshot) = store.latest_reverse_chunks(target).await? {
        let fields = &snapshot.run.fields;
        if fields.is_empty() {
            tracing::warn!(
                target_name = target,
                run_id = snapshot.run.id,
                "reverse rows have no recorded field layout, skipping them"
            );
        } else {
            for chunk in decode_all(target, &snapshot.chunks) {
                if let Value::Array(items) = chunk {
                    reverse_assets.extend(items.iter().map(|row| normalize_secondary(row, fields)));
                }
            }
        }
    }

    Ok(Some(CachedView {
        target: state.name.clone(),
        primary: freshness(state.primary_fetched_at.as_deref(), &policy, now),
        secondary: freshness(state.secondary_fetched_at.as_deref(), &policy, now),
        buckets: aggregate(records.iter().map(normalize_primary)),
        reverse_assets,
    }))
}

pub fn view_json(view: &CachedView) -> Result<String> {
    let json = CachedViewJson {
        target: &view.target,
        primary: view.primary.to_string(),
        secondary: view.secondary.to_string(),
        entities: view.buckets.iter().collect(),
        reverse: &view.reverse_assets,
    };
    Ok(serde_json::to_string_pretty(&json)?)
}

pub fn print_view(view: &CachedView) {
    println!("--- {} ---", view.target);
    println!("primary:   {}", view.primary);
    println!("secondary: {}", view.secondary);
    println!();

    for bucket in &view.buckets {
        println!(
            "[{}] {} ips, {} urls, {} ports",
            bucket.name,
            bucket.ips.len(),
            bucket.urls.len(),
            bucket.ports.len()
        );
        for url in scan_urls(bucket) {
            println!("  {}", url);
        }
        for ip in &bucket.ips {
            println!("  {}", ip);
        }
    }

    if !view.reverse_assets.is_empty() {
        println!();
        println!("--- reverse lookup ({}) ---", view.reverse_assets.len());
        for asset in &view.reverse_assets {
            let shown = if asset.url.is_empty() { &asset.host } else { &asset.url };
            println!("  {}  {}  {}", asset.ip, shown, asset.title);
        }
    }
}

/// CLI entry point for `show`.
pub async fn run_show(config: &Config, target: &str, as_json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteCacheStore::new(pool);

    let view = load_cached_view(&store, config, target.trim(), Utc::now()).await?;
    store.pool().close().await;

    let Some(view) = view else {
        bail!("target '{}' is not in the cache", target.trim());
    };
    if as_json {
        println!("{}", view_json(&view)?);
    } else {
        print_view(&view);
    }
    Ok(())
}
