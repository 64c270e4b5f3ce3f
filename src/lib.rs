//! # icp-sweep
//!
//! Asset discovery for organizations identified by an ICP registration
//! keyword.
//!
//! For each target keyword, icp-sweep pulls every matching service from a
//! scroll-paginated asset search API, caches the raw results in SQLite with
//! an expiry window, flags IPs that belong to shared infrastructure (CDN,
//! hosted mail, PaaS), looks the remaining IPs up in a second search API,
//! and groups everything by the registered organization.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Scroll API   │──▶│ Cache Store  │──▶│ Normalize     │
//! │ (primary)    │   │ SQLite / TTL │   │ + Classify    │
//! └──────────────┘   └──────┬───────┘   └──────┬────────┘
//!                           │                  │ independent IPs
//!                           ▼                  ▼
//!                    ┌──────────────┐   ┌───────────────┐
//!                    │ Aggregate by │◀──│ Reverse API   │
//!                    │ entity       │   │ (secondary)   │
//!                    └──────┬───────┘   └───────────────┘
//!                           ▼
//!                    export + external runners
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! icp-sweep init
//! icp-sweep sweep --input targets.txt
//! icp-sweep status
//! icp-sweep show "Acme" --json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite cache store |
//! | [`traits`] | Remote API seams |
//! | [`quake`] | Scroll API client |
//! | [`fofa`] | Reverse-lookup API client |
//! | [`fetch`] | Paginated fetcher |
//! | [`reverse`] | Reverse-lookup fetcher |
//! | [`pipeline`] | Sweep orchestration |
//! | [`export`] | Per-entity files |
//! | [`runner`] | External scanner hook |
//! | [`status`] | Cache self-check report |
//! | [`show`] | Offline view of one target |
//! | [`logging`] | Tracing setup |
//! | [`error`] | Fetch errors |

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod fetch;
pub mod fofa;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod quake;
pub mod reverse;
pub mod runner;
pub mod show;
pub mod sqlite_store;
pub mod status;
pub mod traits;
