//! Core data models used throughout icp-sweep.
//!
//! Raw API payloads are kept as `serde_json::Value` and only turned into
//! [`CanonicalAsset`]s at read time, so normalization changes apply to
//! everything already cached.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Entity name used when a record carries no responsible organization.
pub const UNKNOWN_ENTITY: &str = "unknown entity";

/// One discovered network service in normalized form.
///
/// Every field is textual so report output is stable regardless of how
/// the upstream API typed the value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CanonicalAsset {
    pub ip: String,
    pub port: String,
    pub host: String,
    pub status_code: String,
    /// Display URL (first candidate, or empty).
    pub url: String,
    /// Every URL worth handing to a web fingerprinting tool.
    pub scan_urls: Vec<String>,
    pub title: String,
    pub domain: String,
    pub registration_id: String,
    pub entity: String,
    pub entity_type: String,
    pub timestamp: String,
    pub region: String,
    pub server: String,
}

impl CanonicalAsset {
    /// Grouping key for aggregation.
    pub fn entity_key(&self) -> &str {
        let trimmed = self.entity.trim();
        if trimmed.is_empty() {
            UNKNOWN_ENTITY
        } else {
            trimmed
        }
    }
}

/// Cache bookkeeping for one query target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetState {
    pub name: String,
    /// RFC 3339 timestamp of the last successful primary fetch, stored verbatim.
    pub primary_fetched_at: Option<String>,
    /// RFC 3339 timestamp of the last successful reverse lookup, stored verbatim.
    pub secondary_fetched_at: Option<String>,
}

/// Lifecycle of a reverse-lookup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "completed_with_errors" => Some(RunStatus::CompletedWithErrors),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    /// `completed` and `completed_with_errors` both count as finished fetches.
    pub fn is_completed(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::CompletedWithErrors)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reverse-lookup attempt for a target's IP set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseRun {
    pub id: i64,
    pub target: String,
    pub started_at: String,
    pub status: RunStatus,
    pub input_count: i64,
    pub result_count: i64,
    pub note: String,
    /// Field projection the run's rows are laid out by. Empty when unknown.
    pub fields: Vec<String>,
}

/// Format a timestamp the way the cache stores it.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Returns `None` for anything malformed.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
