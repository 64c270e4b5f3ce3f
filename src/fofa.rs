//! HTTP client for the reverse-lookup search API.
//!
//! Requests are `GET {base_url}/api/v1/search/next` with `email`, `key`,
//! `qbase64`, `fields` (comma separated), `size`, and `next` when continuing.
//! Responses look like `{error, errmsg, results: [[...]], next}`.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::config::FofaConfig;
use crate::error::FetchError;
use crate::traits::{ReversePage, ReverseSource};

pub struct FofaClient {
    client: reqwest::Client,
    endpoint: String,
    email: String,
    key: String,
    fields: Vec<String>,
    page_size: usize,
}

impl FofaClient {
    pub fn new(config: &FofaConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/v1/search/next", config.base_url.trim_end_matches('/')),
            email: config.email.clone(),
            key: config.key.clone(),
            fields: config.fields.clone(),
            page_size: config.page_size,
        })
    }

    fn query_params(&self, qbase64: &str, next: Option<&str>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("email", self.email.clone()),
            ("key", self.key.clone()),
            ("qbase64", qbase64.to_string()),
            ("fields", self.fields.join(",")),
            ("size", self.page_size.to_string()),
        ];
        if let Some(next) = next {
            params.push(("next", next.to_string()));
        }
        params
    }
}

/// Decode a reverse-lookup response envelope.
///
/// `error` may arrive as a boolean or as a truthy string; an empty `next`
/// means there are no further pages.
pub fn parse_reverse_page(body: &Value) -> Result<ReversePage, FetchError> {
    if !body.is_object() {
        return Err(FetchError::Decode("response is not a JSON object".to_string()));
    }

    let error = match body.get("error") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim(), "true" | "1"),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(1) != 0,
        _ => false,
    };
    let errmsg = body
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let results = match body.get("results") {
        Some(Value::Array(rows)) => rows.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) if error => Vec::new(),
        Some(_) => return Err(FetchError::Decode("results is not an array".to_string())),
    };

    let next = match body.get("next") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    Ok(ReversePage {
        error,
        errmsg,
        results,
        next,
    })
}

#[async_trait]
impl ReverseSource for FofaClient {
    async fn search_next(
        &self,
        qbase64: &str,
        next: Option<&str>,
    ) -> Result<ReversePage, FetchError> {
        if self.email.trim().is_empty() || self.key.trim().is_empty() {
            return Err(FetchError::Config(
                "fofa.email and fofa.key must be set (or FOFA_EMAIL / FOFA_KEY)".to_string(),
            ));
        }

        let resp = self
            .client
            .get(&self.endpoint)
            .query(&self.query_params(qbase64, next))
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }

        let body: Value =
            serde_json::from_str(&text).map_err(|e| FetchError::Decode(e.to_string()))?;
        parse_reverse_page(&body)
    }

    fn fields(&self) -> &[String] {
        &self.fields
    }
}
