//! `status`: cache self-check report.
//!
//! Lists every known target with the state of both cache domains, the last
//! reverse-lookup run, and the entities present in a valid primary cache.
//! A primary cache only counts as valid when a sweep would actually use it:
//! a fresh snapshot with no records is `Empty`, one that cannot be decoded
//! is `Unreadable`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;

use icp_sweep_core::aggregate::aggregate;
use icp_sweep_core::cache::{self, CacheLookup, CachePolicy, MissReason};
use icp_sweep_core::models::{parse_ts, ReverseRun};
use icp_sweep_core::store::CacheStore;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sqlite_store::SqliteCacheStore;

/// State of one cache domain for one target.
#[derive(Debug, Clone, PartialEq)]
pub enum Freshness {
    Never,
    Malformed(String),
    Valid { remaining_hours: f64 },
    /// Fresh, but the fetch it records found nothing.
    Empty { remaining_hours: f64 },
    /// Fresh timestamp, unusable contents.
    Unreadable(String),
    Expired { age_hours: f64 },
}

impl Freshness {
    pub fn is_valid(&self) -> bool {
        matches!(self, Freshness::Valid { .. })
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freshness::Never => write!(f, "never"),
            Freshness::Malformed(_) => write!(f, "malformed"),
            Freshness::Valid { remaining_hours } => write!(f, "{:.1}h left", remaining_hours),
            Freshness::Empty { remaining_hours } => {
                write!(f, "{:.1}h left (empty)", remaining_hours)
            }
            Freshness::Unreadable(_) => write!(f, "unreadable"),
            Freshness::Expired { age_hours } => write!(f, "expired ({:.1}h old)", age_hours),
        }
    }
}

fn hours(d: chrono::Duration) -> f64 {
    d.num_seconds() as f64 / 3600.0
}

/// Classify a stored timestamp.
pub fn freshness(raw: Option<&str>, policy: &CachePolicy, now: DateTime<Utc>) -> Freshness {
    let Some(raw) = raw else {
        return Freshness::Never;
    };
    match parse_ts(raw) {
        None => Freshness::Malformed(raw.to_string()),
        Some(ts) if policy.is_fresh(ts, now) => Freshness::Valid {
            remaining_hours: hours(policy.remaining(ts, now)),
        },
        Some(ts) => Freshness::Expired {
            age_hours: hours(now - ts),
        },
    }
}

/// One line of the status report.
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub target: String,
    pub primary: Freshness,
    pub secondary: Freshness,
    pub last_run: Option<ReverseRun>,
    /// Entities in the cached primary snapshot; empty unless it is a hit.
    pub entities: Vec<String>,
}

/// Build the report rows for every known target.
pub async fn collect_status(
    store: &dyn CacheStore,
    policy: &CachePolicy,
    now: DateTime<Utc>,
) -> Result<Vec<StatusRow>> {
    let mut rows = Vec::new();
    for state in store.list_targets().await? {
        let mut primary = freshness(state.primary_fetched_at.as_deref(), policy, now);
        let secondary = freshness(state.secondary_fetched_at.as_deref(), policy, now);
        let last_run = store.reverse_runs(&state.name).await?.into_iter().next();

        let mut entities = Vec::new();
        match cache::get_primary(store, &state.name, policy, now).await {
            CacheLookup::Hit(snapshot) => {
                entities = aggregate(snapshot.assets())
                    .names()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
            }
            CacheLookup::Miss(reason) => {
                if let Freshness::Valid { remaining_hours } = primary {
                    primary = match reason {
                        MissReason::NoPayloads => Freshness::Empty { remaining_hours },
                        other => Freshness::Unreadable(other.to_string()),
                    };
                }
            }
        }

        rows.push(StatusRow {
            target: state.name,
            primary,
            secondary,
            last_run,
            entities,
        });
    }
    Ok(rows)
}

pub fn print_status(rows: &[StatusRow]) {
    if rows.is_empty() {
        println!("No targets in cache.");
        return;
    }

    println!(
        "{:<32} {:<22} {:<22} LAST REVERSE RUN",
        "TARGET", "PRIMARY", "SECONDARY"
    );
    for row in rows {
        let run = match &row.last_run {
            Some(run) if run.note.is_empty() => {
                format!("{} ({} ips, {} results)", run.status, run.input_count, run.result_count)
            }
            Some(run) => format!(
                "{} ({} ips, {} results; {})",
                run.status, run.input_count, run.result_count, run.note
            ),
            None => "-".to_string(),
        };
        println!(
            "{:<32} {:<22} {:<22} {}",
            row.target,
            row.primary.to_string(),
            row.secondary.to_string(),
            run
        );
    }

    let valid: Vec<&StatusRow> = rows.iter().filter(|r| r.primary.is_valid()).collect();
    let empty = rows
        .iter()
        .filter(|r| matches!(r.primary, Freshness::Empty { .. }))
        .count();
    println!();
    println!("valid caches: {}", valid.len());
    if empty > 0 {
        println!("fresh but empty: {}", empty);
    }
    for row in valid {
        println!("  {} ({})", row.target, row.primary);
        for entity in &row.entities {
            println!("    - {}", entity);
        }
    }
}

/// CLI entry point for `status`.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteCacheStore::new(pool);

    let policy = CachePolicy::from_hours(config.cache.expiry_hours);
    let rows = collect_status(&store, &policy, Utc::now()).await?;
    print_status(&rows);

    store.pool().close().await;
    Ok(())
}
