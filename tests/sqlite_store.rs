//! SQLite cache store against a real database file.

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use icp_sweep::sqlite_store::SqliteCacheStore;
use icp_sweep::{db, migrate};
use icp_sweep_core::cache::{self, CacheLookup, CachePolicy, MissReason};
use icp_sweep_core::models::{format_ts, RunStatus};
use icp_sweep_core::store::CacheStore;

fn layout(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn open(tmp: &TempDir) -> SqliteCacheStore {
    let pool = db::connect_path(&tmp.path().join("cache.sqlite"))
        .await
        .unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    SqliteCacheStore::new(pool)
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    migrate::migrate_pool(store.pool()).await.unwrap();

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(tables, vec!["raw_records", "reverse_chunks", "reverse_runs", "targets"]);
}

#[tokio::test]
async fn test_ensure_target_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;

    let first = store.ensure_target("acme").await.unwrap();
    let second = store.ensure_target("acme").await.unwrap();
    assert_eq!(first, second);
    assert!(first.primary_fetched_at.is_none());
    assert_eq!(store.list_targets().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_replace_primary_swaps_snapshot() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;

    let first = vec![
        "{\"ip\":\"1.1.1.1\"}".to_string(),
        "{\"ip\":\"1.1.1.2\"}".to_string(),
    ];
    store
        .replace_primary("acme", &first, "2026-01-01T00:00:00.000000Z")
        .await
        .unwrap();
    store
        .replace_primary("acme", &["{\"ip\":\"2.2.2.2\"}".to_string()], "2026-01-02T00:00:00.000000Z")
        .await
        .unwrap();

    let payloads = store.primary_payloads("acme").await.unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].payload_json, "{\"ip\":\"2.2.2.2\"}");
    assert_eq!(payloads[0].fetched_at, "2026-01-02T00:00:00.000000Z");

    let state = store.target_state("acme").await.unwrap().unwrap();
    assert_eq!(state.primary_fetched_at.as_deref(), Some("2026-01-02T00:00:00.000000Z"));
}

#[tokio::test]
async fn test_primary_cache_window() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let fetched = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let records = vec![json!({"ip": "1.1.1.1", "port": 80})];
    cache::put_primary(&store, "acme", &records, fetched).await.unwrap();

    let policy = CachePolicy::from_hours(24);
    let inside = fetched + Duration::hours(24) - Duration::seconds(1);
    let outside = fetched + Duration::hours(24) + Duration::seconds(1);

    match cache::get_primary(&store, "acme", &policy, inside).await {
        CacheLookup::Hit(snapshot) => assert_eq!(snapshot.records, records),
        CacheLookup::Miss(reason) => panic!("expected hit, got {}", reason),
    }
    assert_eq!(
        cache::get_primary(&store, "acme", &policy, outside).await,
        CacheLookup::Miss(MissReason::Expired)
    );
}

#[tokio::test]
async fn test_malformed_timestamp_is_a_miss() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    cache::put_primary(&store, "acme", &[json!({"ip": "1.1.1.1"})], Utc::now())
        .await
        .unwrap();

    sqlx::query("UPDATE targets SET primary_fetched_at = 'yesterday-ish' WHERE name = 'acme'")
        .execute(store.pool())
        .await
        .unwrap();

    let lookup = cache::get_primary(&store, "acme", &CachePolicy::default(), Utc::now()).await;
    match lookup {
        CacheLookup::Miss(MissReason::BadTimestamp(raw)) => assert_eq!(raw, "yesterday-ish"),
        other => panic!("expected bad timestamp miss, got {:?}", other),
    }
}

#[tokio::test]
async fn test_undecodable_payload_is_a_miss() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let now = Utc::now();
    store
        .replace_primary("acme", &["not json".to_string()], &format_ts(now))
        .await
        .unwrap();

    let lookup = cache::get_primary(&store, "acme", &CachePolicy::default(), now).await;
    assert!(matches!(lookup, CacheLookup::Miss(MissReason::UndecodablePayload(_))));
}

#[tokio::test]
async fn test_reverse_runs_history_and_latest_snapshot() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let now = Utc::now();
    let rows = vec![
        json!(["a.example", "1.1.1.1", "80"]),
        json!(["b.example", "1.1.1.2", "80"]),
        json!(["c.example", "1.1.1.3", "80"]),
    ];

    let fields = layout(&["host", "ip", "port"]);

    let finish = cache::put_secondary(&store, "acme", 3, &fields, &rows, 2, now)
        .await
        .unwrap();
    assert_eq!(finish.status, RunStatus::Completed);

    // A later failed run must not shadow the completed one.
    let failed = cache::begin_secondary(&store, "acme", 3, &fields, now).await.unwrap();
    let finish = cache::finish_secondary(&store, failed, &rows[..1], Some("HTTP 502"), 2, now).await;
    assert_eq!(finish.status, RunStatus::Failed);

    let runs = store.reverse_runs("acme").await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[1].status, RunStatus::Completed);
    assert_eq!(runs[1].result_count, 3);

    let snapshot = store.latest_reverse_chunks("acme").await.unwrap().unwrap();
    assert_eq!(snapshot.run.id, runs[1].id);
    assert_eq!(snapshot.chunks.len(), 2);

    match cache::get_secondary(&store, "acme", &CachePolicy::default(), &fields, now).await {
        CacheLookup::Hit(snapshot) => {
            assert_eq!(snapshot.rows, rows);
            assert_eq!(snapshot.fields, fields);
            assert_eq!(snapshot.assets()[2].host, "c.example");
        }
        CacheLookup::Miss(reason) => panic!("expected hit, got {}", reason),
    }
}

#[tokio::test]
async fn test_finished_run_cannot_be_completed_again() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let now = format_ts(Utc::now());

    let run = store.begin_reverse_run("acme", 1, &layout(&["ip"]), &now).await.unwrap();
    store
        .complete_reverse_run(run, &[], 0, RunStatus::Completed, "no results", Some(&now))
        .await
        .unwrap();
    let again = store
        .complete_reverse_run(run, &[], 0, RunStatus::Completed, "", Some(&now))
        .await;
    assert!(again.is_err());

    assert!(store
        .finish_reverse_run(9999, RunStatus::Failed, "missing")
        .await
        .is_err());
}

#[tokio::test]
async fn test_reverse_run_keeps_field_projection() {
    let tmp = TempDir::new().unwrap();
    let store = open(&tmp).await;
    let now = Utc::now();
    let stored = layout(&["host", "ip", "port", "protocol"]);
    let rows = vec![json!(["a.example", "1.1.1.1", "443", "https"])];
    cache::put_secondary(&store, "acme", 1, &stored, &rows, 100, now)
        .await
        .unwrap();

    let runs = store.reverse_runs("acme").await.unwrap();
    assert_eq!(runs[0].fields, stored);

    let reordered = layout(&["ip", "host", "port", "protocol"]);
    let lookup = cache::get_secondary(&store, "acme", &CachePolicy::default(), &reordered, now).await;
    assert_eq!(lookup, CacheLookup::Miss(MissReason::FieldsChanged(stored.clone())));

    match cache::get_secondary(&store, "acme", &CachePolicy::default(), &stored, now).await {
        CacheLookup::Hit(snapshot) => {
            let assets = snapshot.assets();
            assert_eq!(assets[0].ip, "1.1.1.1");
            assert_eq!(assets[0].host, "a.example");
        }
        CacheLookup::Miss(reason) => panic!("expected hit, got {}", reason),
    }
}

#[tokio::test]
async fn test_migration_adds_fields_to_old_reverse_runs() {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("cache.sqlite"))
        .await
        .unwrap();

    // Schema as it was before runs recorded their projection.
    sqlx::query("CREATE TABLE targets (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE, primary_fetched_at TEXT, secondary_fetched_at TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE reverse_runs (id INTEGER PRIMARY KEY AUTOINCREMENT, target_id INTEGER NOT NULL, started_at TEXT NOT NULL, status TEXT NOT NULL DEFAULT 'running', input_count INTEGER NOT NULL DEFAULT 0, result_count INTEGER NOT NULL DEFAULT 0, note TEXT NOT NULL DEFAULT '')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE reverse_chunks (id INTEGER PRIMARY KEY AUTOINCREMENT, run_id INTEGER NOT NULL, payload_json TEXT NOT NULL)")
        .execute(&pool)
        .await
        .unwrap();
    let now = format_ts(Utc::now());
    sqlx::query("INSERT INTO targets (name, secondary_fetched_at) VALUES ('acme', ?)")
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO reverse_runs (target_id, started_at, status, input_count, result_count) VALUES (1, ?, 'completed', 1, 1)")
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO reverse_chunks (run_id, payload_json) VALUES (1, '[[\"a.example\",\"1.1.1.1\"]]')")
        .execute(&pool)
        .await
        .unwrap();

    migrate::migrate_pool(&pool).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    let store = SqliteCacheStore::new(pool);

    let runs = store.reverse_runs("acme").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].fields.is_empty());

    let lookup = cache::get_secondary(
        &store,
        "acme",
        &CachePolicy::default(),
        &layout(&["host", "ip"]),
        Utc::now(),
    )
    .await;
    assert_eq!(lookup, CacheLookup::Miss(MissReason::FieldsChanged(Vec::new())));
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let store = open(&tmp).await;
        cache::put_primary(&store, "acme", &[json!({"ip": "1.1.1.1"})], Utc::now())
            .await
            .unwrap();
        store.pool().close().await;
    }

    let store = open(&tmp).await;
    let lookup = cache::get_primary(&store, "acme", &CachePolicy::default(), Utc::now()).await;
    assert!(lookup.is_hit());
}
