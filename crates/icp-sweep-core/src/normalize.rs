//! Record normalization.
//!
//! Maps raw payloads from both search APIs into [`CanonicalAsset`]s.
//! Normalization never fails: any missing or oddly-typed field becomes an
//! empty string.
//!
//! # Primary URL policy
//!
//! First match wins:
//!
//! 1. `service.http.http_load_url`, the resolved URL list.
//! 2. `service.http.url`, a single explicit URL.
//! 3. A synthesized `http://host[:port]` / `https://host[:port]` pair when a
//!    host is known and the port is a conventional web port. The `http`
//!    variant is the display URL; both are kept as scan candidates.

use serde_json::Value;

use crate::models::CanonicalAsset;

/// Ports treated as web services when a URL has to be synthesized.
pub const WEB_PORTS: [u64; 5] = [80, 443, 8000, 8080, 8443];

/// Render a JSON scalar as canonical text. Non-scalars become empty.
pub fn value_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn text_at(raw: &Value, pointer: &str) -> String {
    value_text(raw.pointer(pointer))
}

/// Replace embedded line breaks with spaces and trim.
pub fn flatten_title(title: &str) -> String {
    title.replace(['\r', '\n'], " ").trim().to_string()
}

/// Whether a string looks like an `http://` or `https://` URL.
pub fn is_web_url(s: &str) -> bool {
    let lower = s.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Build the `http` and `https` URLs for a host on a web port.
///
/// Default ports are elided. A host that already ends in `:port` is not
/// given a second port suffix.
pub fn synthesize_web_urls(host: &str, port: u64) -> Vec<String> {
    let suffix = format!(":{}", port);
    let bare = host.trim().trim_end_matches(&suffix);
    if bare.is_empty() {
        return Vec::new();
    }

    let http = if port == 80 {
        format!("http://{}", bare)
    } else {
        format!("http://{}:{}", bare, port)
    };
    let https = if port == 443 {
        format!("https://{}", bare)
    } else {
        format!("https://{}:{}", bare, port)
    };
    vec![http, https]
}

fn port_number(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn primary_urls(raw: &Value, host: &str) -> Vec<String> {
    if let Some(Value::Array(list)) = raw.pointer("/service/http/http_load_url") {
        let urls: Vec<String> = list
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !urls.is_empty() {
            return urls;
        }
    }

    let explicit = text_at(raw, "/service/http/url");
    if !explicit.trim().is_empty() {
        return vec![explicit.trim().to_string()];
    }

    let host_for_url = [
        host.to_string(),
        text_at(raw, "/service/hostname"),
        text_at(raw, "/domain"),
    ]
    .into_iter()
    .find(|h| !h.trim().is_empty());

    match (host_for_url, raw.get("port").and_then(port_number)) {
        (Some(h), Some(port)) if WEB_PORTS.contains(&port) => synthesize_web_urls(&h, port),
        _ => Vec::new(),
    }
}

/// Normalize one primary (scroll API) record.
pub fn normalize_primary(raw: &Value) -> CanonicalAsset {
    let host = text_at(raw, "/service/http/host");
    let scan_urls = primary_urls(raw, &host);
    let url = scan_urls.first().cloned().unwrap_or_default();

    let mut region = text_at(raw, "/location/province_cn");
    if region.is_empty() {
        region = text_at(raw, "/location/province_en");
    }

    CanonicalAsset {
        ip: text_at(raw, "/ip"),
        port: text_at(raw, "/port"),
        host,
        status_code: text_at(raw, "/service/http/status_code"),
        url,
        scan_urls,
        title: flatten_title(&text_at(raw, "/service/http/title")),
        domain: text_at(raw, "/domain"),
        registration_id: text_at(raw, "/service/http/icp/licence"),
        entity: text_at(raw, "/service/http/icp/main_licence/unit"),
        entity_type: text_at(raw, "/service/http/icp/main_licence/nature"),
        timestamp: text_at(raw, "/time"),
        region,
        server: text_at(raw, "/service/http/server"),
    }
}

fn secondary_url(protocol: &str, host: &str, port: &str, link: &str) -> String {
    if !link.trim().is_empty() {
        return link.trim().to_string();
    }
    if host.contains("://") {
        return host.to_string();
    }
    let protocol = protocol.trim().to_ascii_lowercase();
    if protocol.is_empty() || host.is_empty() {
        return String::new();
    }
    if host.contains(':') {
        return format!("{}://{}", protocol, host);
    }
    match (protocol.as_str(), port) {
        ("http", "80") | ("https", "443") | (_, "") => format!("{}://{}", protocol, host),
        _ => format!("{}://{}:{}", protocol, host, port),
    }
}

/// Normalize one reverse-lookup row.
///
/// Rows are positional arrays whose layout follows `fields` (the field
/// projection sent with the query). A scalar row is treated as a
/// one-column row.
pub fn normalize_secondary(row: &Value, fields: &[String]) -> CanonicalAsset {
    let cells: Vec<&Value> = match row {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    let field = |name: &str| -> String {
        fields
            .iter()
            .position(|f| f == name)
            .and_then(|i| cells.get(i).copied())
            .map(|v| value_text(Some(v)))
            .unwrap_or_default()
    };

    let host = field("host");
    let port = field("port");
    let url = secondary_url(&field("protocol"), &host, &port, &field("link"));
    let scan_urls = if is_web_url(&url) {
        vec![url.clone()]
    } else {
        Vec::new()
    };

    CanonicalAsset {
        ip: field("ip"),
        port,
        host,
        status_code: String::new(),
        url,
        scan_urls,
        title: flatten_title(&field("title")),
        domain: field("domain"),
        registration_id: field("icp"),
        entity: String::new(),
        entity_type: String::new(),
        timestamp: String::new(),
        region: String::new(),
        server: field("server"),
    }
}
