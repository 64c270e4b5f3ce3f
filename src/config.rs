//! Configuration parsing and validation.
//!
//! icp-sweep is configured via a TOML file (default: `config/icp-sweep.toml`).
//! Every section except `[db]` is optional and falls back to the defaults
//! below.
//!
//! # Example Configuration
//!
//! ```toml
//! [db]
//! path = "./data/icp-sweep.sqlite"
//!
//! [cache]
//! expiry_hours = 168
//!
//! [quake]
//! api_key = "..."                      # or QUAKE_API_KEY
//! query_template = 'icp_keywords:"{target}" and not domain_is_wildcard:true'
//!
//! [fofa]
//! enabled = true
//! email = "me@example.com"             # or FOFA_EMAIL
//! key = "..."                          # or FOFA_KEY
//!
//! [classifier]
//! san_threshold = 20
//!
//! [output]
//! dir = "./results"
//!
//! [logging]
//! level = "info"
//! file = "./icp-sweep.log"
//!
//! [[runners]]
//! name = "fingerprint"
//! input = "urls"
//! program = "observer_ward"
//! args = ["-l", "{input}", "-o", "{output}"]
//! ```
//!
//! # Validation
//!
//! [`load_config`] rejects zero expiry or page sizes, an `ip_chunk_size`
//! outside `1..=100`, a query template without `{target}`, and a field list
//! without `ip`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use icp_sweep_core::classify::ClassifierRules;

/// Upper bound the reverse-lookup API accepts for OR-ed IP terms.
pub const MAX_IP_CHUNK: usize = 100;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub quake: QuakeConfig,
    #[serde(default)]
    pub fofa: FofaConfig,
    #[serde(default)]
    pub classifier: ClassifierRules,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: i64,
}

fn default_expiry_hours() -> i64 {
    7 * 24
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiry_hours: default_expiry_hours(),
        }
    }
}

/// Primary scroll API settings.
#[derive(Debug, Deserialize, Clone)]
pub struct QuakeConfig {
    #[serde(default = "default_quake_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_query_template")]
    pub query_template: String,
    #[serde(default = "default_quake_page_size")]
    pub page_size: usize,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_quake_base_url() -> String {
    "https://quake.360.net/api/v3".to_string()
}
fn default_query_template() -> String {
    r#"icp_keywords:"{target}" and not domain_is_wildcard:true"#.to_string()
}
fn default_quake_page_size() -> usize {
    1000
}
fn default_delay_secs() -> u64 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for QuakeConfig {
    fn default() -> Self {
        Self {
            base_url: default_quake_base_url(),
            api_key: String::new(),
            query_template: default_query_template(),
            page_size: default_quake_page_size(),
            delay_secs: default_delay_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl QuakeConfig {
    /// Render the scroll query for one target.
    pub fn query_for(&self, target: &str) -> String {
        self.query_template.replace("{target}", target)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Reverse-lookup API settings.
#[derive(Debug, Deserialize, Clone)]
pub struct FofaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fofa_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_fofa_fields")]
    pub fields: Vec<String>,
    #[serde(default = "default_fofa_page_size")]
    pub page_size: usize,
    #[serde(default = "default_ip_chunk_size")]
    pub ip_chunk_size: usize,
    #[serde(default = "default_storage_chunk_size")]
    pub storage_chunk_size: usize,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_fofa_base_url() -> String {
    "https://fofa.info".to_string()
}
fn default_fofa_fields() -> Vec<String> {
    [
        "host", "ip", "port", "protocol", "title", "server", "icp", "domain", "link",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_fofa_page_size() -> usize {
    2000
}
fn default_ip_chunk_size() -> usize {
    MAX_IP_CHUNK
}
fn default_storage_chunk_size() -> usize {
    100
}

impl Default for FofaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_fofa_base_url(),
            email: String::new(),
            key: String::new(),
            fields: default_fofa_fields(),
            page_size: default_fofa_page_size(),
            ip_chunk_size: default_ip_chunk_size(),
            storage_chunk_size: default_storage_chunk_size(),
            delay_secs: default_delay_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl FofaConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./results")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Which per-entity list an external runner consumes.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunnerInput {
    Urls,
    Ips,
}

/// An external scanner invoked once per entity.
///
/// `{input}`, `{ports}` and `{output}` in `args` are replaced with the input
/// list path, the entity's port list path and the result file path.
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    pub name: String,
    pub input: RunnerInput,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Replace credentials with `QUAKE_API_KEY`, `FOFA_EMAIL` and `FOFA_KEY`
    /// when those are set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        if let Some(v) = env("QUAKE_API_KEY") {
            self.quake.api_key = v;
        }
        if let Some(v) = env("FOFA_EMAIL") {
            self.fofa.email = v;
        }
        if let Some(v) = env("FOFA_KEY") {
            self.fofa.key = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.expiry_hours <= 0 {
            bail!("cache.expiry_hours must be > 0");
        }

        if self.quake.page_size == 0 {
            bail!("quake.page_size must be > 0");
        }
        if !self.quake.query_template.contains("{target}") {
            bail!("quake.query_template must contain the {{target}} placeholder");
        }

        if self.fofa.page_size == 0 {
            bail!("fofa.page_size must be > 0");
        }
        if !(1..=MAX_IP_CHUNK).contains(&self.fofa.ip_chunk_size) {
            bail!("fofa.ip_chunk_size must be in [1, {}]", MAX_IP_CHUNK);
        }
        if self.fofa.storage_chunk_size == 0 {
            bail!("fofa.storage_chunk_size must be > 0");
        }
        if !self.fofa.fields.iter().any(|f| f == "ip") {
            bail!("fofa.fields must include \"ip\"");
        }

        for runner in &self.runners {
            if runner.program.trim().is_empty() {
                bail!("runner '{}' has an empty program", runner.name);
            }
        }

        Ok(())
    }
}

/// Read, parse, apply environment overrides, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.apply_env_overrides();
    config.validate()?;

    Ok(config)
}
