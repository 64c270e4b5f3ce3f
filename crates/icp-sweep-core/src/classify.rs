//! Shared-infrastructure classification.
//!
//! An IP is flagged as shared (CDN, hosted mail, PaaS front door, URL
//! forwarding) when any record observed on it fires one of four signals.
//! Each signal is a standalone predicate over the raw primary payload; the
//! classifier folds them with short-circuit OR in declaration order.
//!
//! Missing or oddly-typed structure never fires a signal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::normalize::value_text;

/// Thresholds and marker lists driving the classifier.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClassifierRules {
    /// A certificate covering more SAN names than this is treated as shared.
    #[serde(default = "default_san_threshold")]
    pub san_threshold: usize,
    #[serde(default = "default_cname_denylist")]
    pub cname_denylist: Vec<String>,
    #[serde(default = "default_cdn_product_markers")]
    pub cdn_product_markers: Vec<String>,
    #[serde(default = "default_mailbox_markers")]
    pub mailbox_markers: Vec<String>,
    #[serde(default = "default_forwarding_header_markers")]
    pub forwarding_header_markers: Vec<String>,
}

fn default_san_threshold() -> usize {
    20
}

fn default_cname_denylist() -> Vec<String> {
    [
        "qiye.aliyun.com",
        "exmail.qq.com",
        "qiye.163.com",
        "ali-mail.com",
        "dingtalk.com",
        "mxhichina.com",
        ".cdn.cloudflare.net",
        ".akamaiedge.net",
        ".fastly.net",
        ".chinacache.com",
        ".cdnetworks.net",
        "aliyuncs.com",
        "bspapp.com",
        "hiflow.tencent.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_cdn_product_markers() -> Vec<String> {
    vec!["内容分发网络(CDN)".to_string(), "CDN".to_string()]
}

fn default_mailbox_markers() -> Vec<String> {
    vec!["企业邮箱".to_string()]
}

fn default_forwarding_header_markers() -> Vec<String> {
    vec!["Aliyun URL Forwarding Server".to_string()]
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            san_threshold: default_san_threshold(),
            cname_denylist: default_cname_denylist(),
            cdn_product_markers: default_cdn_product_markers(),
            mailbox_markers: default_mailbox_markers(),
            forwarding_header_markers: default_forwarding_header_markers(),
        }
    }
}

/// Which heuristic marked an IP as shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareSignal {
    /// Certificate SAN list longer than the threshold.
    SanCount(usize),
    /// A CDN or hosted-mailbox component was fingerprinted.
    Component(String),
    /// A CNAME points at a denylisted provider.
    Cname(String),
    /// The HTTP response came from a URL forwarding service.
    ForwardingHeader(String),
}

impl fmt::Display for ShareSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShareSignal::SanCount(n) => write!(f, "certificate lists {} SAN names", n),
            ShareSignal::Component(c) => write!(f, "component {}", c),
            ShareSignal::Cname(c) => write!(f, "cname {}", c),
            ShareSignal::ForwardingHeader(m) => write!(f, "response header {}", m),
        }
    }
}

/// Collect strings from a value that may be a string or an array of strings.
fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| value_text(Some(v)))
            .filter(|s| !s.is_empty())
            .collect(),
        Some(v) => {
            let s = value_text(Some(v));
            if s.is_empty() {
                Vec::new()
            } else {
                vec![s]
            }
        }
        None => Vec::new(),
    }
}

pub fn san_signal(record: &Value, rules: &ClassifierRules) -> Option<ShareSignal> {
    let names = record
        .pointer("/service/tls/certificate/parsed/extensions/subject_alt_name/dns_names")?
        .as_array()?;
    (names.len() > rules.san_threshold).then(|| ShareSignal::SanCount(names.len()))
}

pub fn component_signal(record: &Value, rules: &ClassifierRules) -> Option<ShareSignal> {
    let components = record.get("components")?.as_array()?;
    for component in components {
        for product_type in strings(component.get("product_type")) {
            if rules
                .cdn_product_markers
                .iter()
                .any(|m| product_type.contains(m.as_str()))
            {
                return Some(ShareSignal::Component(product_type));
            }
        }
        for key in ["product_name_cn", "product_name_en"] {
            let name = value_text(component.get(key));
            if rules
                .mailbox_markers
                .iter()
                .any(|m| name.contains(m.as_str()))
            {
                return Some(ShareSignal::Component(name));
            }
        }
    }
    None
}

pub fn cname_signal(record: &Value, rules: &ClassifierRules) -> Option<ShareSignal> {
    let cnames = strings(record.pointer("/service/dns/cname"));
    for cname in cnames {
        let lower = cname.to_lowercase();
        if rules
            .cname_denylist
            .iter()
            .any(|d| lower.contains(&d.to_lowercase()))
        {
            return Some(ShareSignal::Cname(cname));
        }
    }
    None
}

pub fn forwarding_header_signal(record: &Value, rules: &ClassifierRules) -> Option<ShareSignal> {
    let headers = value_text(record.pointer("/service/http/response_headers"));
    if headers.is_empty() {
        return None;
    }
    rules
        .forwarding_header_markers
        .iter()
        .find(|m| headers.contains(m.as_str()))
        .map(|m| ShareSignal::ForwardingHeader(m.clone()))
}

/// Evaluate the signals in order and return the first that fires.
pub fn evaluate(record: &Value, rules: &ClassifierRules) -> Option<ShareSignal> {
    san_signal(record, rules)
        .or_else(|| component_signal(record, rules))
        .or_else(|| cname_signal(record, rules))
        .or_else(|| forwarding_header_signal(record, rules))
}

/// Map each shared IP to the first signal that flagged it.
///
/// Records without an IP are skipped.
pub fn classify_detailed(
    records: &[Value],
    rules: &ClassifierRules,
) -> BTreeMap<String, ShareSignal> {
    let mut shared = BTreeMap::new();
    for record in records {
        let ip = value_text(record.get("ip"));
        if ip.is_empty() || shared.contains_key(&ip) {
            continue;
        }
        if let Some(signal) = evaluate(record, rules) {
            shared.insert(ip, signal);
        }
    }
    shared
}

/// The set of IPs flagged as shared infrastructure.
pub fn classify(records: &[Value], rules: &ClassifierRules) -> BTreeSet<String> {
    classify_detailed(records, rules).into_keys().collect()
}

/// IPs present in `records` that were not flagged as shared, sorted.
pub fn independent_ips(records: &[Value], shared: &BTreeSet<String>) -> BTreeSet<String> {
    records
        .iter()
        .map(|r| value_text(r.get("ip")))
        .filter(|ip| !ip.is_empty() && !shared.contains(ip))
        .collect()
}
