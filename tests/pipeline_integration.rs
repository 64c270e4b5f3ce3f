//! End-to-end tests for the sweep pipeline.
//!
//! A real SQLite cache in a temp dir, with scripted implementations of the
//! two API traits that count requests and record what they were asked.

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

use icp_sweep::config::Config;
use icp_sweep::error::FetchError;
use icp_sweep::fetch::{fetch_all, fetch_primary};
use icp_sweep::pipeline::{sweep_target, Collaborators, ReverseState, SweepOptions, TargetOutcome};
use icp_sweep::sqlite_store::SqliteCacheStore;
use icp_sweep::traits::{ReversePage, ReverseSource, ScrollPage, ScrollSource};
use icp_sweep::{db, migrate};
use icp_sweep_core::cache::{self, CacheLookup, CachePolicy, MissReason};
use icp_sweep_core::models::{format_ts, ReverseRun, RunStatus, TargetState};
use icp_sweep_core::store::{CacheStore, ReverseSnapshot, StoredPayload};

// ─── Scripted API sources ───────────────────────────────────────────

struct ScriptedScroll {
    pages: Mutex<VecDeque<Result<ScrollPage, FetchError>>>,
    cursors: Mutex<Vec<Option<String>>>,
    calls: AtomicUsize,
}

impl ScriptedScroll {
    fn new(pages: Vec<Result<ScrollPage, FetchError>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            cursors: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScrollSource for ScriptedScroll {
    async fn scroll(
        &self,
        _query: &str,
        _size: usize,
        cursor: Option<&str>,
    ) -> Result<ScrollPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().unwrap().push(cursor.map(str::to_string));
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(FetchError::Remote {
                    code: 99,
                    message: "unexpected request".to_string(),
                })
            })
    }
}

struct ScriptedReverse {
    pages: Mutex<VecDeque<Result<ReversePage, FetchError>>>,
    queries: Mutex<Vec<(String, Option<String>)>>,
    fields: Vec<String>,
}

impl ScriptedReverse {
    fn new(pages: Vec<Result<ReversePage, FetchError>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            queries: Mutex::new(Vec::new()),
            fields: ["host", "ip", "port", "protocol", "title", "server", "icp", "domain", "link"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    fn decoded_queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .map(|(q, _)| String::from_utf8(STANDARD.decode(q).unwrap()).unwrap())
            .collect()
    }
}

#[async_trait]
impl ReverseSource for ScriptedReverse {
    async fn search_next(
        &self,
        qbase64: &str,
        next: Option<&str>,
    ) -> Result<ReversePage, FetchError> {
        self.queries
            .lock()
            .unwrap()
            .push((qbase64.to_string(), next.map(str::to_string)));
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ReversePage::default()))
    }

    fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// Delegates to SQLite but refuses to store reverse-lookup results.
struct ReverseWriteFails {
    inner: SqliteCacheStore,
}

#[async_trait]
impl CacheStore for ReverseWriteFails {
    async fn ensure_target(&self, name: &str) -> Result<TargetState> {
        self.inner.ensure_target(name).await
    }
    async fn target_state(&self, name: &str) -> Result<Option<TargetState>> {
        self.inner.target_state(name).await
    }
    async fn list_targets(&self) -> Result<Vec<TargetState>> {
        self.inner.list_targets().await
    }
    async fn primary_payloads(&self, name: &str) -> Result<Vec<StoredPayload>> {
        self.inner.primary_payloads(name).await
    }
    async fn replace_primary(&self, name: &str, payloads: &[String], fetched_at: &str) -> Result<()> {
        self.inner.replace_primary(name, payloads, fetched_at).await
    }
    async fn begin_reverse_run(
        &self,
        name: &str,
        input_count: i64,
        fields: &[String],
        started_at: &str,
    ) -> Result<i64> {
        self.inner.begin_reverse_run(name, input_count, fields, started_at).await
    }
    async fn complete_reverse_run(
        &self,
        _run_id: i64,
        _chunks: &[String],
        _result_count: i64,
        _status: RunStatus,
        _note: &str,
        _advance_to: Option<&str>,
    ) -> Result<()> {
        bail!("disk full")
    }
    async fn finish_reverse_run(&self, run_id: i64, status: RunStatus, note: &str) -> Result<()> {
        self.inner.finish_reverse_run(run_id, status, note).await
    }
    async fn latest_reverse_chunks(&self, name: &str) -> Result<Option<ReverseSnapshot>> {
        self.inner.latest_reverse_chunks(name).await
    }
    async fn reverse_runs(&self, name: &str) -> Result<Vec<ReverseRun>> {
        self.inner.reverse_runs(name).await
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

fn test_config(tmp: &TempDir) -> Config {
    let content = format!(
        r#"[db]
path = "{root}/data/cache.sqlite"

[quake]
api_key = "test"
delay_secs = 0

[fofa]
email = "t@example.com"
key = "test"
delay_secs = 0

[output]
dir = "{root}/results"
"#,
        root = tmp.path().display()
    );
    toml::from_str(&content).unwrap()
}

async fn open_store(config: &Config) -> SqliteCacheStore {
    let pool = db::connect(config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    SqliteCacheStore::new(pool)
}

fn no_side_effects(config: &Config) -> SweepOptions {
    SweepOptions {
        reverse: false,
        export: false,
        runners: false,
        output_dir: config.output.dir.clone(),
    }
}

fn record(ip: &str, port: u16, entity: &str) -> Value {
    json!({
        "ip": ip,
        "port": port,
        "service": {
            "http": {
                "host": format!("{}.example.com", ip.replace('.', "-")),
                "icp": { "main_licence": { "unit": entity } }
            }
        }
    })
}

fn shared_record(ip: &str) -> Value {
    let names: Vec<String> = (0..25).map(|i| format!("s{}.cdn.example.net", i)).collect();
    json!({
        "ip": ip,
        "port": 443,
        "service": { "tls": { "certificate": { "parsed": { "extensions": {
            "subject_alt_name": { "dns_names": names }
        } } } } }
    })
}

fn page(data: Vec<Value>, cursor: Option<&str>) -> Result<ScrollPage, FetchError> {
    Ok(ScrollPage {
        code: 0,
        message: "Successful.".to_string(),
        data,
        cursor: cursor.map(str::to_string),
    })
}

fn reverse_page(rows: Vec<Value>, next: Option<&str>) -> Result<ReversePage, FetchError> {
    Ok(ReversePage {
        error: false,
        errmsg: String::new(),
        results: rows,
        next: next.map(str::to_string),
    })
}

// ─── Pagination ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_pagination_issues_n_plus_one_requests() {
    let scroll = ScriptedScroll::new(vec![
        page(vec![record("1.0.0.1", 80, "A"), record("1.0.0.2", 80, "A")], Some("c1")),
        page(vec![record("1.0.0.3", 80, "B")], Some("c2")),
        page(vec![], Some("c3")),
    ]);

    let records = fetch_all(&scroll, "q", 10, std::time::Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(scroll.calls(), 3);
    let ips: Vec<&str> = records.iter().map(|r| r["ip"].as_str().unwrap()).collect();
    assert_eq!(ips, vec!["1.0.0.1", "1.0.0.2", "1.0.0.3"]);
    assert_eq!(
        *scroll.cursors.lock().unwrap(),
        vec![None, Some("c1".to_string()), Some("c2".to_string())]
    );
}

#[tokio::test]
async fn test_missing_cursor_ends_after_page() {
    let scroll = ScriptedScroll::new(vec![page(vec![record("1.0.0.1", 80, "A")], None)]);
    let records = fetch_all(&scroll, "q", 10, std::time::Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(scroll.calls(), 1);
}

#[tokio::test]
async fn test_nonzero_code_is_failure() {
    let scroll = ScriptedScroll::new(vec![
        page(vec![record("1.0.0.1", 80, "A")], Some("c1")),
        Ok(ScrollPage {
            code: 429,
            message: "rate limited".to_string(),
            ..ScrollPage::default()
        }),
    ]);
    let err = fetch_all(&scroll, "q", 10, std::time::Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Remote { code: 429, .. }));
}

// ─── Cache behaviour ────────────────────────────────────────────────

#[tokio::test]
async fn test_cache_hit_makes_no_request() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = open_store(&config).await;
    let scroll = ScriptedScroll::new(vec![page(
        vec![record("2.0.0.1", 443, "Acme"), record("2.0.0.2", 80, "Acme")],
        None,
    )]);
    let collab = Collaborators {
        scroll: &scroll,
        reverse: None,
        runners: &[],
    };
    let opts = no_side_effects(&config);

    let first = sweep_target(&config, &store, &collab, "acme", &opts).await;
    assert_eq!(first.outcome, TargetOutcome::Fetched);
    assert_eq!(scroll.calls(), 1);

    let second = sweep_target(&config, &store, &collab, "acme", &opts).await;
    assert_eq!(second.outcome, TargetOutcome::Cached);
    assert_eq!(scroll.calls(), 1);
    assert_eq!(second.asset_count(), 2);
    assert_eq!(second.buckets.names(), vec!["Acme"]);
}

#[tokio::test]
async fn test_failed_fetch_leaves_snapshot_untouched() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = open_store(&config).await;

    // An expired snapshot forces a refetch.
    let stale = format_ts(Utc::now() - Duration::hours(200));
    let old = vec![record("3.0.0.1", 80, "Old").to_string()];
    store.replace_primary("acme", &old, &stale).await.unwrap();
    let payloads_before = store.primary_payloads("acme").await.unwrap();
    let state_before = store.target_state("acme").await.unwrap();

    let scroll = ScriptedScroll::new(vec![
        page(vec![record("3.0.0.9", 80, "New")], Some("c1")),
        Err(FetchError::Status {
            status: 502,
            body: "bad gateway".to_string(),
        }),
    ]);
    let collab = Collaborators {
        scroll: &scroll,
        reverse: None,
        runners: &[],
    };

    let report = sweep_target(&config, &store, &collab, "acme", &no_side_effects(&config)).await;
    assert!(matches!(report.outcome, TargetOutcome::Failed { .. }));
    assert_eq!(store.primary_payloads("acme").await.unwrap(), payloads_before);
    assert_eq!(store.target_state("acme").await.unwrap(), state_before);
}

#[tokio::test]
async fn test_refetch_keeps_single_snapshot() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = open_store(&config).await;
    let data = vec![record("4.0.0.1", 80, "A"), record("4.0.0.2", 80, "A")];
    let scroll = ScriptedScroll::new(vec![
        page(data.clone(), None),
        page(data.clone(), None),
    ]);

    fetch_primary(&store, &scroll, &config.quake, "acme").await.unwrap();
    fetch_primary(&store, &scroll, &config.quake, "acme").await.unwrap();

    let payloads = store.primary_payloads("acme").await.unwrap();
    assert_eq!(payloads.len(), 2);
    let state = store.target_state("acme").await.unwrap().unwrap();
    let stamp = state.primary_fetched_at.unwrap();
    assert!(payloads.iter().all(|p| p.fetched_at == stamp));
}

#[tokio::test]
async fn test_empty_result_is_success_but_not_a_hit() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = open_store(&config).await;
    let scroll = ScriptedScroll::new(vec![page(vec![], None)]);
    let collab = Collaborators {
        scroll: &scroll,
        reverse: None,
        runners: &[],
    };

    let report = sweep_target(&config, &store, &collab, "nobody", &no_side_effects(&config)).await;
    assert_eq!(report.outcome, TargetOutcome::Empty);

    let state = store.target_state("nobody").await.unwrap().unwrap();
    assert!(state.primary_fetched_at.is_some());
    let lookup = cache::get_primary(&store, "nobody", &CachePolicy::default(), Utc::now()).await;
    assert_eq!(lookup, CacheLookup::Miss(MissReason::NoPayloads));
}

// ─── Classification and reverse lookup ──────────────────────────────

#[tokio::test]
async fn test_shared_ips_are_not_reverse_looked_up() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = open_store(&config).await;
    let scroll = ScriptedScroll::new(vec![page(
        vec![
            record("10.0.0.2", 80, "Acme"),
            record("10.0.0.1", 443, "Acme"),
            shared_record("10.0.0.9"),
        ],
        None,
    )]);
    let reverse = ScriptedReverse::new(vec![reverse_page(
        vec![json!(["www.acme.example", "10.0.0.1", "443", "https", "Acme", "nginx", "", "acme.example", ""])],
        None,
    )]);
    let collab = Collaborators {
        scroll: &scroll,
        reverse: Some(&reverse as &dyn ReverseSource),
        runners: &[],
    };
    let mut opts = no_side_effects(&config);
    opts.reverse = true;

    let report = sweep_target(&config, &store, &collab, "acme", &opts).await;

    assert!(report.shared.contains_key("10.0.0.9"));
    assert_eq!(
        reverse.decoded_queries(),
        vec![r#"ip="10.0.0.1" || ip="10.0.0.2""#.to_string()]
    );
    assert_eq!(
        report.reverse,
        ReverseState::Ran {
            status: RunStatus::Completed,
            note: String::new()
        }
    );
    assert_eq!(report.reverse_assets.len(), 1);
    assert_eq!(report.reverse_assets[0].url, "https://www.acme.example");

    let state = store.target_state("acme").await.unwrap().unwrap();
    assert!(state.secondary_fetched_at.is_some());

    // Second sweep: both domains come from cache.
    let again = sweep_target(&config, &store, &collab, "acme", &opts).await;
    assert_eq!(again.outcome, TargetOutcome::Cached);
    assert_eq!(again.reverse, ReverseState::Cached);
    assert_eq!(again.reverse_assets.len(), 1);
    assert_eq!(reverse.queries.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_changed_reverse_fields_refetch_instead_of_reusing_rows() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = open_store(&config).await;
    let scroll = ScriptedScroll::new(vec![page(vec![record("10.0.0.1", 443, "Acme")], None)]);

    let first = ScriptedReverse::new(vec![reverse_page(
        vec![json!(["www.acme.example", "10.0.0.1", "443", "https", "", "", "", "", ""])],
        None,
    )]);
    let mut opts = no_side_effects(&config);
    opts.reverse = true;
    let collab = Collaborators {
        scroll: &scroll,
        reverse: Some(&first as &dyn ReverseSource),
        runners: &[],
    };
    let report = sweep_target(&config, &store, &collab, "acme", &opts).await;
    assert_eq!(report.reverse_assets[0].ip, "10.0.0.1");

    // Same target, now asking for `ip` first.
    let mut second = ScriptedReverse::new(vec![reverse_page(
        vec![json!(["10.0.0.1", "www.acme.example", "443", "https"])],
        None,
    )]);
    second.fields = ["ip", "host", "port", "protocol"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let collab = Collaborators {
        scroll: &scroll,
        reverse: Some(&second as &dyn ReverseSource),
        runners: &[],
    };
    let again = sweep_target(&config, &store, &collab, "acme", &opts).await;

    assert!(matches!(again.reverse, ReverseState::Ran { status: RunStatus::Completed, .. }));
    assert_eq!(second.queries.lock().unwrap().len(), 1);
    assert_eq!(again.reverse_assets[0].ip, "10.0.0.1");
    assert_eq!(again.reverse_assets[0].host, "www.acme.example");

    let runs = store.reverse_runs("acme").await.unwrap();
    assert_eq!(runs[0].fields, second.fields);
    assert_eq!(runs[1].fields, first.fields);
}

#[tokio::test]
async fn test_reverse_follows_next_token() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = open_store(&config).await;
    let reverse = ScriptedReverse::new(vec![
        reverse_page(vec![json!(["a.example", "10.1.0.1", "80", "http"])], Some("tok-2")),
        reverse_page(vec![json!(["b.example", "10.1.0.1", "8080", "http"])], None),
    ]);
    let ips: BTreeSet<String> = ["10.1.0.1".to_string()].into_iter().collect();

    let outcome = icp_sweep::reverse::fetch_by_ips(&store, &reverse, &config.fofa, "acme", &ips).await;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.rows.len(), 2);

    let queries = reverse.queries.lock().unwrap().clone();
    assert_eq!(queries[0].1, None);
    assert_eq!(queries[1].1.as_deref(), Some("tok-2"));
}

#[tokio::test]
async fn test_reverse_failure_stops_and_marks_run_failed() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.fofa.ip_chunk_size = 1;
    let store = open_store(&config).await;
    let reverse = ScriptedReverse::new(vec![
        reverse_page(vec![json!(["a.example", "10.2.0.1", "80", "http"])], None),
        Err(FetchError::Status {
            status: 502,
            body: "bad gateway".to_string(),
        }),
    ]);
    let ips: BTreeSet<String> = ["10.2.0.1", "10.2.0.2", "10.2.0.3"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let outcome = icp_sweep::reverse::fetch_by_ips(&store, &reverse, &config.fofa, "acme", &ips).await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(reverse.queries.lock().unwrap().len(), 2);

    let runs = store.reverse_runs("acme").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].input_count, 3);
    assert_eq!(runs[0].result_count, 1);
    assert!(runs[0].note.starts_with("api error:"));

    let state = store.target_state("acme").await.unwrap().unwrap();
    assert!(state.secondary_fetched_at.is_none());
    assert!(store.latest_reverse_chunks("acme").await.unwrap().is_none());

    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reverse_chunks")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(chunks, 1);
}

#[tokio::test]
async fn test_persistence_failure_completes_with_errors() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = ReverseWriteFails {
        inner: open_store(&config).await,
    };
    let reverse = ScriptedReverse::new(vec![reverse_page(
        vec![json!(["a.example", "10.3.0.1", "80", "http"])],
        None,
    )]);
    let ips: BTreeSet<String> = ["10.3.0.1".to_string()].into_iter().collect();

    let outcome = icp_sweep::reverse::fetch_by_ips(&store, &reverse, &config.fofa, "acme", &ips).await;

    assert_eq!(outcome.status, RunStatus::CompletedWithErrors);
    assert_eq!(outcome.rows.len(), 1);
    let runs = store.reverse_runs("acme").await.unwrap();
    assert_eq!(runs[0].status, RunStatus::CompletedWithErrors);
    assert!(runs[0].note.contains("disk full"));
    let state = store.target_state("acme").await.unwrap().unwrap();
    assert!(state.secondary_fetched_at.is_none());
}

// ─── Export ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sweep_exports_entity_files() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = open_store(&config).await;
    let scroll = ScriptedScroll::new(vec![page(
        vec![
            record("5.0.0.1", 443, "Acme Ltd"),
            record("5.0.0.2", 22, ""),
            shared_record("5.0.0.9"),
        ],
        None,
    )]);
    let collab = Collaborators {
        scroll: &scroll,
        reverse: None,
        runners: &[],
    };
    let opts = SweepOptions {
        reverse: false,
        export: true,
        runners: false,
        output_dir: config.output.dir.clone(),
    };

    let report = sweep_target(&config, &store, &collab, "acme", &opts).await;
    assert_eq!(report.exports.len(), 2);

    let root = config.output.dir.join("acme");
    let urls = std::fs::read_to_string(root.join("Acme Ltd").join("urls.txt")).unwrap();
    assert_eq!(
        urls,
        "http://5-0-0-1.example.com:443\nhttps://5-0-0-1.example.com\n"
    );
    let unknown_ips = std::fs::read_to_string(root.join("unknown entity").join("ips.txt")).unwrap();
    assert!(unknown_ips.contains("5.0.0.2"));
    assert!(unknown_ips.contains("5.0.0.9"));
    let shared = std::fs::read_to_string(root.join("shared_ips.txt")).unwrap();
    assert!(shared.starts_with("5.0.0.9\t"));
}
