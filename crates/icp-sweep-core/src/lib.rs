//! # icp-sweep core
//!
//! Shared logic for icp-sweep: asset models, record normalization,
//! shared-infrastructure classification, entity aggregation, cache
//! freshness rules, and the [`store::CacheStore`] abstraction.
//!
//! This crate contains no tokio, sqlx, reqwest, or filesystem I/O. The
//! native application crate supplies the SQLite store and the HTTP
//! clients; everything here operates on `serde_json::Value` payloads.

pub mod aggregate;
pub mod cache;
pub mod classify;
pub mod models;
pub mod normalize;
pub mod store;
