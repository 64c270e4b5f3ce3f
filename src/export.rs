//! Per-entity export for external scanners.
//!
//! Layout under the output directory:
//!
//! ```text
//! <output>/<target>/
//!     shared_ips.txt          ip<TAB>reason, one per line
//!     <entity>/
//!         ips.txt             one IP per line
//!         urls.txt            http(s) URLs only, one per line
//!         ports.txt           one port per line
//!         assets.json         the bucket's assets, pretty-printed
//!     reverse/                same four files for reverse-lookup results
//! ```
//!
//! Target and entity names are sanitised before they become path
//! components. Entity directories never share a name with each other or
//! with `reverse/` and `shared_ips.txt`; a clash gets a `_2`, `_3`, ...
//! suffix in bucket order.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use icp_sweep_core::aggregate::{EntityBucket, EntityBuckets};
use icp_sweep_core::classify::ShareSignal;
use icp_sweep_core::models::CanonicalAsset;
use icp_sweep_core::normalize::is_web_url;

/// Directory name used for reverse-lookup results.
pub const REVERSE_DIR: &str = "reverse";

const SHARED_FILE: &str = "shared_ips.txt";

/// Files written for one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketExport {
    pub name: String,
    pub dir: PathBuf,
    pub ips_file: PathBuf,
    pub urls_file: PathBuf,
    pub ports_file: PathBuf,
    pub ip_count: usize,
    pub url_count: usize,
    pub port_count: usize,
}

/// Make a name safe to use as a single path component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == ' ' || c == '.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Sanitise `name` and make it distinct from everything in `taken`,
/// compared case-insensitively. The chosen name is added to `taken`.
fn unique_component(name: &str, taken: &mut HashSet<String>) -> String {
    let base = sanitize_component(name);
    let mut candidate = base.clone();
    let mut n = 2;
    while !taken.insert(candidate.to_lowercase()) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    candidate
}

/// Every URL in the bucket worth scanning: the display URLs plus each
/// asset's candidate URLs, restricted to `http(s)://`.
pub fn scan_urls(bucket: &EntityBucket) -> BTreeSet<String> {
    bucket
        .urls
        .iter()
        .chain(bucket.assets.iter().flat_map(|a| a.scan_urls.iter()))
        .filter(|u| is_web_url(u))
        .cloned()
        .collect()
}

fn write_lines<'a, I>(path: &Path, lines: I) -> Result<()>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut content = String::new();
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn write_bucket(dir: &Path, bucket: &EntityBucket) -> Result<BucketExport> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let urls = scan_urls(bucket);
    let ips_file = dir.join("ips.txt");
    let urls_file = dir.join("urls.txt");
    let ports_file = dir.join("ports.txt");

    write_lines(&ips_file, &bucket.ips)?;
    write_lines(&urls_file, &urls)?;
    write_lines(&ports_file, &bucket.ports)?;

    let assets_path = dir.join("assets.json");
    let json = serde_json::to_string_pretty(&bucket.assets)?;
    fs::write(&assets_path, json)
        .with_context(|| format!("Failed to write {}", assets_path.display()))?;

    Ok(BucketExport {
        name: bucket.name.clone(),
        dir: dir.to_path_buf(),
        ips_file,
        urls_file,
        ports_file,
        ip_count: bucket.ips.len(),
        url_count: urls.len(),
        port_count: bucket.ports.len(),
    })
}

/// Root directory for one target's export.
pub fn target_dir(output: &Path, target: &str) -> PathBuf {
    output.join(sanitize_component(target))
}

/// Write one directory per entity bucket.
pub fn export_entities(
    output: &Path,
    target: &str,
    buckets: &EntityBuckets,
) -> Result<Vec<BucketExport>> {
    let root = target_dir(output, target);
    let mut taken: HashSet<String> = [REVERSE_DIR, SHARED_FILE]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut written = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let component = unique_component(&bucket.name, &mut taken);
        if component != sanitize_component(&bucket.name) {
            tracing::info!(
                target_name = target,
                entity = %bucket.name,
                dir = %component,
                "entity directory renamed to avoid a clash"
            );
        }
        written.push(write_bucket(&root.join(component), bucket)?);
    }
    Ok(written)
}

/// Write reverse-lookup results as one bucket under `reverse/`.
pub fn export_reverse(
    output: &Path,
    target: &str,
    assets: Vec<CanonicalAsset>,
) -> Result<BucketExport> {
    let bucket = EntityBucket::collect(REVERSE_DIR, assets);
    write_bucket(&target_dir(output, target).join(REVERSE_DIR), &bucket)
}

/// Record which IPs were held back from reverse lookup and why.
pub fn export_shared(
    output: &Path,
    target: &str,
    shared: &BTreeMap<String, ShareSignal>,
) -> Result<PathBuf> {
    let root = target_dir(output, target);
    fs::create_dir_all(&root).with_context(|| format!("Failed to create {}", root.display()))?;
    let path = root.join(SHARED_FILE);
    let lines: Vec<String> = shared
        .iter()
        .map(|(ip, signal)| format!("{}\t{}", ip, signal))
        .collect();
    write_lines(&path, &lines)?;
    Ok(path)
}
