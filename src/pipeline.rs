//! Sweep orchestration.
//!
//! For each target, strictly in order:
//!
//! 1. Primary cache lookup; on a miss, a full scroll fetch that replaces the
//!    cached snapshot.
//! 2. Normalization and aggregation of the raw records by entity.
//! 3. Shared-infrastructure classification.
//! 4. Reverse lookup of the independent IPs (cache first).
//! 5. Export and external runners.
//!
//! No target failure stops the sweep. Each target ends with a
//! [`TargetOutcome`] and the CLI prints a summary of all of them.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use icp_sweep_core::aggregate::{aggregate, EntityBuckets};
use icp_sweep_core::cache::{self, CacheLookup, CachePolicy};
use icp_sweep_core::classify::{classify_detailed, independent_ips, ShareSignal};
use icp_sweep_core::models::{CanonicalAsset, RunStatus};
use icp_sweep_core::normalize::{normalize_primary, normalize_secondary};
use icp_sweep_core::store::CacheStore;

use crate::config::Config;
use crate::db;
use crate::export::{self, BucketExport};
use crate::fetch::fetch_primary;
use crate::fofa::FofaClient;
use crate::migrate;
use crate::quake::QuakeClient;
use crate::reverse::fetch_by_ips;
use crate::runner::{run_all, runners_from_config, RunnerReport, ScanRunner};
use crate::sqlite_store::SqliteCacheStore;
use crate::traits::{ReverseSource, ScrollSource};

/// Read a targets file: one per line, trimmed, blanks skipped, duplicates
/// dropped keeping the first occurrence.
pub fn load_targets(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read targets file: {}", path.display()))?;
    Ok(dedup_targets(content.lines()))
}

pub fn dedup_targets<I, S>(targets: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for t in targets {
        let t = t.as_ref().trim();
        if !t.is_empty() && seen.insert(t.to_string()) {
            out.push(t.to_string());
        }
    }
    out
}

/// How a target's primary data was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// Fetched from the API in this run.
    Fetched,
    /// Served from a fresh cache entry.
    Cached,
    /// The API answered successfully with zero records.
    Empty,
    Failed { reason: String },
}

impl fmt::Display for TargetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetOutcome::Fetched => write!(f, "fetched"),
            TargetOutcome::Cached => write!(f, "cached"),
            TargetOutcome::Empty => write!(f, "empty"),
            TargetOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// What happened to the reverse lookup for a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReverseState {
    Cached,
    Ran { status: RunStatus, note: String },
    Skipped(String),
}

impl fmt::Display for ReverseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReverseState::Cached => write!(f, "cached"),
            ReverseState::Ran { status, note } if note.is_empty() => write!(f, "{}", status),
            ReverseState::Ran { status, note } => write!(f, "{} ({})", status, note),
            ReverseState::Skipped(why) => write!(f, "skipped: {}", why),
        }
    }
}

/// Everything one target produced.
#[derive(Debug)]
pub struct TargetReport {
    pub target: String,
    pub outcome: TargetOutcome,
    pub buckets: EntityBuckets,
    pub shared: BTreeMap<String, ShareSignal>,
    pub independent: BTreeSet<String>,
    pub reverse: ReverseState,
    pub reverse_assets: Vec<CanonicalAsset>,
    pub exports: Vec<BucketExport>,
    pub runs: Vec<RunnerReport>,
}

impl TargetReport {
    fn new(target: &str, outcome: TargetOutcome) -> Self {
        Self {
            target: target.to_string(),
            outcome,
            buckets: EntityBuckets::new(),
            shared: BTreeMap::new(),
            independent: BTreeSet::new(),
            reverse: ReverseState::Skipped("no primary data".to_string()),
            reverse_assets: Vec::new(),
            exports: Vec::new(),
            runs: Vec::new(),
        }
    }

    pub fn asset_count(&self) -> usize {
        self.buckets.iter().map(|b| b.assets.len()).sum()
    }
}

/// Per-sweep switches from the command line.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub reverse: bool,
    pub export: bool,
    pub runners: bool,
    pub output_dir: PathBuf,
}

impl SweepOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reverse: config.fofa.enabled,
            export: true,
            runners: true,
            output_dir: config.output.dir.clone(),
        }
    }
}

/// The remote APIs and scanners a sweep talks to.
pub struct Collaborators<'a> {
    pub scroll: &'a dyn ScrollSource,
    pub reverse: Option<&'a dyn ReverseSource>,
    pub runners: &'a [Box<dyn ScanRunner>],
}

/// Obtain primary records from cache or API.
async fn primary_records(
    config: &Config,
    store: &dyn CacheStore,
    scroll: &dyn ScrollSource,
    target: &str,
) -> Result<(TargetOutcome, Vec<Value>), TargetOutcome> {
    let policy = CachePolicy::from_hours(config.cache.expiry_hours);
    match cache::get_primary(store, target, &policy, Utc::now()).await {
        CacheLookup::Hit(snapshot) => {
            tracing::info!(
                target_name = target,
                records = snapshot.records.len(),
                fetched_at = %snapshot.fetched_at,
                "primary cache hit"
            );
            return Ok((TargetOutcome::Cached, snapshot.records));
        }
        CacheLookup::Miss(reason) if reason.is_anomaly() => {
            tracing::warn!(target_name = target, reason = %reason, "primary cache unusable, refetching");
        }
        CacheLookup::Miss(reason) => {
            tracing::info!(target_name = target, reason = %reason, "primary cache miss");
        }
    }

    match fetch_primary(store, scroll, &config.quake, target).await {
        Ok(fetch) if fetch.records.is_empty() => {
            tracing::info!(target_name = target, "API returned no records");
            Err(TargetOutcome::Empty)
        }
        Ok(fetch) => {
            tracing::info!(
                target_name = target,
                records = fetch.records.len(),
                persisted = fetch.persisted,
                "primary fetch complete"
            );
            Ok((TargetOutcome::Fetched, fetch.records))
        }
        Err(e) => {
            tracing::warn!(target_name = target, error = %e, "primary fetch failed");
            Err(TargetOutcome::Failed {
                reason: e.to_string(),
            })
        }
    }
}

/// Reverse-lookup rows for the independent IPs, cache first.
async fn reverse_rows(
    config: &Config,
    store: &dyn CacheStore,
    source: &dyn ReverseSource,
    target: &str,
    independent: &BTreeSet<String>,
) -> (ReverseState, Vec<CanonicalAsset>) {
    let policy = CachePolicy::from_hours(config.cache.expiry_hours);
    match cache::get_secondary(store, target, &policy, source.fields(), Utc::now()).await {
        CacheLookup::Hit(snapshot) => {
            tracing::info!(target_name = target, rows = snapshot.rows.len(), "reverse cache hit");
            return (ReverseState::Cached, snapshot.assets());
        }
        CacheLookup::Miss(reason) if reason.is_anomaly() => {
            tracing::warn!(target_name = target, reason = %reason, "reverse cache unusable");
        }
        CacheLookup::Miss(reason) => {
            tracing::debug!(target_name = target, reason = %reason, "reverse cache miss");
        }
    }

    tracing::info!(target_name = target, ips = independent.len(), "starting reverse lookup");
    let outcome = fetch_by_ips(store, source, &config.fofa, target, independent).await;
    tracing::info!(
        target_name = target,
        status = %outcome.status,
        rows = outcome.rows.len(),
        "reverse lookup finished"
    );
    let assets = outcome
        .rows
        .iter()
        .map(|row| normalize_secondary(row, source.fields()))
        .collect();
    (
        ReverseState::Ran {
            status: outcome.status,
            note: outcome.note,
        },
        assets,
    )
}

fn export_target(report: &mut TargetReport, output: &Path) {
    match export::export_entities(output, &report.target, &report.buckets) {
        Ok(written) => report.exports = written,
        Err(e) => {
            tracing::warn!(target_name = %report.target, error = %format!("{:#}", e), "entity export failed")
        }
    }
    if !report.shared.is_empty() {
        if let Err(e) = export::export_shared(output, &report.target, &report.shared) {
            tracing::warn!(target_name = %report.target, error = %format!("{:#}", e), "shared IP export failed");
        }
    }
    if !report.reverse_assets.is_empty() {
        match export::export_reverse(output, &report.target, report.reverse_assets.clone()) {
            Ok(written) => report.exports.push(written),
            Err(e) => {
                tracing::warn!(target_name = %report.target, error = %format!("{:#}", e), "reverse export failed")
            }
        }
    }
}

/// Run the whole pipeline for one target.
pub async fn sweep_target(
    config: &Config,
    store: &dyn CacheStore,
    collab: &Collaborators<'_>,
    target: &str,
    opts: &SweepOptions,
) -> TargetReport {
    let (outcome, records) = match primary_records(config, store, collab.scroll, target).await {
        Ok(found) => found,
        Err(outcome) => return TargetReport::new(target, outcome),
    };

    let mut report = TargetReport::new(target, outcome);
    report.buckets = aggregate(records.iter().map(normalize_primary));

    report.shared = classify_detailed(&records, &config.classifier);
    for (ip, signal) in &report.shared {
        tracing::info!(target_name = target, ip = %ip, signal = %signal, "shared infrastructure");
    }
    let shared_ips: BTreeSet<String> = report.shared.keys().cloned().collect();
    report.independent = independent_ips(&records, &shared_ips);

    report.reverse = match collab.reverse {
        _ if !opts.reverse => ReverseState::Skipped("disabled".to_string()),
        None => ReverseState::Skipped("no reverse source".to_string()),
        Some(_) if report.independent.is_empty() => {
            ReverseState::Skipped("no independent IPs".to_string())
        }
        Some(source) => {
            let (state, assets) =
                reverse_rows(config, store, source, target, &report.independent).await;
            report.reverse_assets = assets;
            state
        }
    };

    if opts.export {
        export_target(&mut report, &opts.output_dir);
        if opts.runners && !collab.runners.is_empty() {
            report.runs = run_all(collab.runners, &report.exports).await;
        }
    }

    report
}

/// Sweep every target in order.
pub async fn run_sweep_with(
    config: &Config,
    store: &dyn CacheStore,
    collab: &Collaborators<'_>,
    targets: &[String],
    opts: &SweepOptions,
) -> Vec<TargetReport> {
    let mut reports = Vec::with_capacity(targets.len());
    for (i, target) in targets.iter().enumerate() {
        tracing::info!(target_name = %target, n = i + 1, of = targets.len(), "sweeping target");
        reports.push(sweep_target(config, store, collab, target, opts).await);
    }
    reports
}

/// CLI entry point for `sweep`.
pub async fn run_sweep(config: &Config, targets: &[String], opts: &SweepOptions) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteCacheStore::new(pool);

    let quake = QuakeClient::new(&config.quake).context("Failed to build scroll API client")?;
    let fofa = if opts.reverse && config.fofa.enabled {
        Some(FofaClient::new(&config.fofa).context("Failed to build reverse API client")?)
    } else {
        None
    };
    let runners = if opts.runners {
        runners_from_config(&config.runners)
    } else {
        Vec::new()
    };

    let collab = Collaborators {
        scroll: &quake,
        reverse: fofa.as_ref().map(|f| f as &dyn ReverseSource),
        runners: &runners,
    };

    let reports = run_sweep_with(config, &store, &collab, targets, opts).await;
    print_summary(&reports);

    store.pool().close().await;
    Ok(())
}

/// Print the per-target summary and the list of problem targets.
pub fn print_summary(reports: &[TargetReport]) {
    println!("sweep {} targets", reports.len());
    for report in reports {
        println!("  {}", report.target);
        println!("    primary: {}", report.outcome);
        if matches!(report.outcome, TargetOutcome::Fetched | TargetOutcome::Cached) {
            println!(
                "    assets: {} in {} entities",
                report.asset_count(),
                report.buckets.len()
            );
            println!(
                "    ips: {} independent, {} shared",
                report.independent.len(),
                report.shared.len()
            );
            println!(
                "    reverse: {} ({} results)",
                report.reverse,
                report.reverse_assets.len()
            );
            if !report.exports.is_empty() {
                println!("    exported: {} directories", report.exports.len());
            }
            for run in &report.runs {
                match &run.result {
                    Ok(path) => println!("    runner {} [{}]: {}", run.runner, run.bucket, path.display()),
                    Err(e) => println!("    runner {} [{}] failed: {}", run.runner, run.bucket, e),
                }
            }
        }
    }

    let failed: Vec<&TargetReport> = reports
        .iter()
        .filter(|r| matches!(r.outcome, TargetOutcome::Failed { .. }))
        .collect();
    let empty: Vec<&TargetReport> = reports
        .iter()
        .filter(|r| r.outcome == TargetOutcome::Empty)
        .collect();

    if !failed.is_empty() {
        println!();
        println!("failed targets ({}):", failed.len());
        for r in failed {
            println!("  {}  {}", r.target, r.outcome);
        }
    }
    if !empty.is_empty() {
        println!();
        println!("targets with no results ({}):", empty.len());
        for r in empty {
            println!("  {}", r.target);
        }
    }
    println!("ok");
}
